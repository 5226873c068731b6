//! Tagged-format packer.
//!
//! Scalar content (primitives, enums, fixed structs, inline class members)
//! writes straight into the current item's zero-initialized buffer, so
//! gaps between member offsets and the tail up to the class's declared
//! size stay zero. Pointers, arrays and strings never write their payload
//! immediately: they leave the zero placeholder in place and enqueue a
//! deferred backfill. After each item's scalar pass the variant-name,
//! array and string queues drain to exhaustion (nested payloads resolve
//! before the next pointer); pointer-item creation is breadth-first across
//! the whole blob.
//!
//! The `existing` map keys items by the identity of the in-memory value,
//! so packing one shared object twice produces a single item whose index
//! is written at every referencing location.

use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use log::{debug, trace};

use crate::buf;
use crate::error::BlobError;
use crate::schema::{ClassId, SchemaSet, WireType};
use crate::text;
use crate::value::{ObjRef, Value, ValueKey};

use super::{field_size, TaggedBlob, TaggedItem};

struct Pending {
    item: usize,
    offset: usize,
    value: Value,
    ty: WireType,
    ctx: String,
}

/// Encodes one object graph into a tagged blob. Single-use: consume with
/// [`TaggedWriter::pack_root`].
pub struct TaggedWriter<'s> {
    schemas: &'s SchemaSet,
    items: Vec<TaggedItem>,
    existing: HashMap<ValueKey, u32>,
    variant_names: VecDeque<Pending>,
    arrays: VecDeque<Pending>,
    strings: VecDeque<Pending>,
    pointers: VecDeque<Pending>,
}

impl<'s> TaggedWriter<'s> {
    pub fn new(schemas: &'s SchemaSet) -> TaggedWriter<'s> {
        TaggedWriter {
            schemas,
            items: TaggedBlob::new().items,
            existing: HashMap::new(),
            variant_names: VecDeque::new(),
            arrays: VecDeque::new(),
            strings: VecDeque::new(),
            pointers: VecDeque::new(),
        }
    }

    /// Pack `root` (a class instance) and everything reachable from it.
    pub fn pack_root(mut self, root: &Value) -> Result<TaggedBlob, BlobError> {
        let obj = root.as_object().ok_or_else(|| BlobError::InvalidWireCategory {
            category: "non-class root".to_owned(),
            context: "<root>".to_owned(),
        })?;
        self.emit_object_item(obj.clone())?;
        while let Some(p) = self.pointers.pop_front() {
            self.backfill_pointer(p)?;
        }
        debug!("packed tagged blob with {} items", self.items.len());
        Ok(TaggedBlob { items: self.items })
    }

    fn push_item(&mut self, ty: WireType, data: Vec<u8>, count: usize) -> u32 {
        let index = self.items.len() as u32;
        trace!("item {index}: {count} element(s), {} bytes", data.len());
        self.items.push(TaggedItem { ty, data, count });
        index
    }

    /// Create and fill the item for one class instance: scalar pass, then
    /// the local (array/string) queues.
    fn emit_object_item(&mut self, obj: ObjRef) -> Result<u32, BlobError> {
        let class = obj.borrow().class;
        let size = self.schemas.class(class)?.size as usize;
        let index = self.push_item(WireType::Class(class), vec![0; size], 1);
        self.existing
            .insert(ValueKey::Object(Rc::as_ptr(&obj)), index);
        self.pack_class_into(class, &obj, index as usize, 0)?;
        self.drain_local()?;
        Ok(index)
    }

    /// Run the deferred array/string work belonging to the item(s) just
    /// written. Variant-name strings go first: the wire format requires a
    /// named variant's name item to be allocated before its class-name
    /// item.
    fn drain_local(&mut self) -> Result<(), BlobError> {
        loop {
            if let Some(p) = self.variant_names.pop_front() {
                self.backfill_string(p)?;
                continue;
            }
            if let Some(p) = self.arrays.pop_front() {
                self.backfill_array(p)?;
                continue;
            }
            if let Some(p) = self.strings.pop_front() {
                self.backfill_string(p)?;
                continue;
            }
            return Ok(());
        }
    }

    fn pack_class_into(
        &mut self,
        cid: ClassId,
        obj: &ObjRef,
        item: usize,
        offset: usize,
    ) -> Result<(), BlobError> {
        let schemas = self.schemas;
        let class_name = schemas.class(cid)?.name.as_str();
        let members = schemas.effective_members(cid)?;
        let variant_shape = schemas.is_named_variant(cid)?;

        for (i, m) in members.iter().enumerate() {
            if m.flags.not_serializable {
                continue;
            }
            let value = obj.borrow().get(&m.name).cloned().unwrap_or(Value::Null);
            let ctx = format!("{class_name}.{}", m.name);
            let off = offset + m.offset as usize;
            if variant_shape && i < 3 {
                // Fixed pack order for the named-variant triple: name,
                // class name, variant pointer.
                match i {
                    0 => self.enqueue_string(true, item, off, value, ctx)?,
                    1 => self.enqueue_string(false, item, off, value, ctx)?,
                    _ => self.enqueue_reference(&WireType::VariantPointer, item, off, value, &ctx)?,
                }
            } else {
                self.pack_at(&m.ty, &value, item, off, &ctx)?;
            }
        }
        Ok(())
    }

    fn pack_at(
        &mut self,
        ty: &WireType,
        value: &Value,
        item: usize,
        offset: usize,
        ctx: &str,
    ) -> Result<(), BlobError> {
        match ty {
            WireType::Primitive(p) => {
                buf::write_primitive(*p, &mut self.items[item].data, offset, 8, value, ctx)
            }
            WireType::Enum { storage, .. } | WireType::Flags { storage, .. } => {
                buf::write_primitive(*storage, &mut self.items[item].data, offset, 8, value, ctx)
            }
            WireType::Str => self.enqueue_string(false, item, offset, value.clone(), ctx.to_owned()),
            WireType::FixedStruct { elem, count } => {
                let values = match value {
                    Value::Tuple(v) => v,
                    _ => {
                        return Err(BlobError::InvalidWireCategory {
                            category: "fixed-struct".to_owned(),
                            context: ctx.to_owned(),
                        })
                    }
                };
                if values.len() != *count as usize {
                    return Err(BlobError::StructLengthMismatch {
                        type_name: ty.display_name(self.schemas)?,
                        expected: *count as usize,
                        actual: values.len(),
                    });
                }
                let stride = field_size(elem, self.schemas)?;
                for (i, v) in values.iter().enumerate() {
                    self.pack_at(elem, v, item, offset + i * stride, ctx)?;
                }
                Ok(())
            }
            WireType::Array(_) | WireType::RelArray(_) => match value {
                Value::Null => Ok(()),
                Value::Array(a) if a.borrow().is_empty() => Ok(()),
                Value::Array(_) => {
                    self.arrays.push_back(Pending {
                        item,
                        offset,
                        value: value.clone(),
                        ty: ty.clone(),
                        ctx: ctx.to_owned(),
                    });
                    Ok(())
                }
                _ => Err(BlobError::InvalidWireCategory {
                    category: "array".to_owned(),
                    context: ctx.to_owned(),
                }),
            },
            WireType::RawPointer(_)
            | WireType::RefPointer { .. }
            | WireType::BackRefPointer(_)
            | WireType::VariantPointer => {
                self.enqueue_reference(ty, item, offset, value.clone(), ctx)
            }
            WireType::Class(cid) => {
                let obj = value.as_object().ok_or_else(|| BlobError::InvalidWireCategory {
                    category: "class".to_owned(),
                    context: ctx.to_owned(),
                })?;
                let obj = obj.clone();
                self.pack_class_into(*cid, &obj, item, offset)
            }
        }
    }

    fn enqueue_string(
        &mut self,
        variant_name: bool,
        item: usize,
        offset: usize,
        value: Value,
        ctx: String,
    ) -> Result<(), BlobError> {
        match &value {
            // Index 0 already in the buffer means empty/absent.
            Value::Null => Ok(()),
            Value::Str(s) if s.is_empty() => Ok(()),
            Value::Str(_) => {
                let queue = if variant_name {
                    &mut self.variant_names
                } else {
                    &mut self.strings
                };
                queue.push_back(Pending {
                    item,
                    offset,
                    value,
                    ty: WireType::Str,
                    ctx,
                });
                Ok(())
            }
            _ => Err(BlobError::InvalidWireCategory {
                category: "string".to_owned(),
                context: ctx,
            }),
        }
    }

    fn enqueue_reference(
        &mut self,
        ty: &WireType,
        item: usize,
        offset: usize,
        value: Value,
        ctx: &str,
    ) -> Result<(), BlobError> {
        if value.is_null() {
            // Placeholder zero stands: null pointers never create an item.
            return Ok(());
        }
        self.pointers.push_back(Pending {
            item,
            offset,
            value,
            ty: ty.clone(),
            ctx: ctx.to_owned(),
        });
        Ok(())
    }

    fn backfill_string(&mut self, p: Pending) -> Result<(), BlobError> {
        let s = match &p.value {
            Value::Str(s) => s.clone(),
            _ => {
                return Err(BlobError::InvalidWireCategory {
                    category: "string".to_owned(),
                    context: p.ctx,
                })
            }
        };
        let key = ValueKey::Str(s.as_ptr());
        let index = match self.existing.get(&key) {
            Some(&idx) => idx,
            None => {
                let bytes = text::encode(&s)?;
                let count = bytes.len();
                let index = self.push_item(WireType::Str, bytes, count);
                self.existing.insert(key, index);
                index
            }
        };
        buf::write_u32(&mut self.items[p.item].data, p.offset, index)
    }

    fn backfill_array(&mut self, p: Pending) -> Result<(), BlobError> {
        let arr = match p.value.as_array() {
            Some(a) => a.clone(),
            None => {
                return Err(BlobError::InvalidWireCategory {
                    category: "array".to_owned(),
                    context: p.ctx,
                })
            }
        };
        let key = ValueKey::Array(Rc::as_ptr(&arr));
        let index = match self.existing.get(&key) {
            Some(&idx) => idx,
            None => {
                let elem = p.ty.pointee()?.clone();
                let values: Vec<Value> = arr.borrow().clone();
                let stride = field_size(&elem, self.schemas)?;
                let index =
                    self.push_item(p.ty.clone(), vec![0; stride * values.len()], values.len());
                self.existing.insert(key, index);
                for (i, v) in values.iter().enumerate() {
                    self.pack_at(&elem, v, index as usize, i * stride, &p.ctx)?;
                }
                index
            }
        };
        buf::write_u32(&mut self.items[p.item].data, p.offset, index)
    }

    fn backfill_pointer(&mut self, p: Pending) -> Result<(), BlobError> {
        let index = self.pointee_item(&p)?;
        buf::write_u32(&mut self.items[p.item].data, p.offset, index)
    }

    fn pointee_item(&mut self, p: &Pending) -> Result<u32, BlobError> {
        // Type-check before the dedup fast path: a shared target must
        // satisfy every declared pointee, not just the first one packed.
        if let Value::Object(obj) = &p.value {
            if let Ok(WireType::Class(want)) = p.ty.pointee() {
                let have = obj.borrow().class;
                if !self.schemas.is_subtype(have, *want)? {
                    return Err(BlobError::PointerTypeMismatch {
                        index: self.items.len() as u32,
                        actual: self.schemas.class(have)?.name.clone(),
                        expected: self.schemas.class(*want)?.name.clone(),
                        member: p.ctx.clone(),
                    });
                }
            }
        }
        if let Some(key) = ValueKey::of(&p.value) {
            if let Some(&idx) = self.existing.get(&key) {
                return Ok(idx);
            }
        }
        match &p.value {
            Value::Object(obj) => self.emit_object_item(obj.clone()),
            other => {
                // Pointer to a non-class value: one item of the declared
                // pointee type, packed in place.
                let pointee = p.ty.pointee()?.clone();
                let size = field_size(&pointee, self.schemas)?;
                let index = self.push_item(pointee.clone(), vec![0; size], 1);
                self.pack_at(&pointee, other, index as usize, 0, &p.ctx)?;
                self.drain_local()?;
                Ok(index)
            }
        }
    }
}
