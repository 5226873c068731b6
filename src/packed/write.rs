//! Packed-format packer.
//!
//! Same queue discipline as the tagged writer (scalar pass per entry,
//! variant-name/array/string backfills drained depth-first, pointer-entry
//! creation breadth-first), but references are recorded as fixup-table
//! rows instead of item indices: the placeholder bytes in the data section
//! always stay zero. Identity deduplication maps each shared value to one
//! `(entry, offset)` target reused by every referencing position.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;

use log::{debug, trace};

use crate::buf;
use crate::error::BlobError;
use crate::schema::{ClassId, SchemaSet, WireType};
use crate::text;
use crate::value::{ObjRef, Value, ValueKey};

use super::{
    field_alignment, field_size, FixupTarget, PackedBlob, PackedEntry, PtrSize, ARRAY_DONT_FREE,
};

struct Pending {
    pos: usize,
    value: Value,
    ty: WireType,
    ctx: String,
}

/// Encodes one object graph into a packed blob for the given pointer
/// width. Single-use: consume with [`PackedWriter::pack_root`].
pub struct PackedWriter<'s> {
    schemas: &'s SchemaSet,
    ptr: PtrSize,
    data: Vec<u8>,
    entries: Vec<PackedEntry>,
    fixups: BTreeMap<u64, FixupTarget>,
    existing: HashMap<ValueKey, FixupTarget>,
    variant_names: VecDeque<Pending>,
    arrays: VecDeque<Pending>,
    strings: VecDeque<Pending>,
    pointers: VecDeque<Pending>,
}

impl<'s> PackedWriter<'s> {
    pub fn new(schemas: &'s SchemaSet, ptr: PtrSize) -> PackedWriter<'s> {
        PackedWriter {
            schemas,
            ptr,
            data: Vec::new(),
            entries: Vec::new(),
            fixups: BTreeMap::new(),
            existing: HashMap::new(),
            variant_names: VecDeque::new(),
            arrays: VecDeque::new(),
            strings: VecDeque::new(),
            pointers: VecDeque::new(),
        }
    }

    /// Pack `root` (a class instance) and everything reachable from it.
    /// The root becomes entry 0.
    pub fn pack_root(mut self, root: &Value) -> Result<PackedBlob, BlobError> {
        let obj = root.as_object().ok_or_else(|| BlobError::InvalidWireCategory {
            category: "non-class root".to_owned(),
            context: "<root>".to_owned(),
        })?;
        self.emit_object_entry(obj.clone())?;
        while let Some(p) = self.pointers.pop_front() {
            self.backfill_pointer(p)?;
        }
        debug!(
            "packed blob: {} entries, {} fixups, {} bytes",
            self.entries.len(),
            self.fixups.len(),
            self.data.len()
        );
        Ok(PackedBlob {
            ptr_size: self.ptr,
            data: self.data,
            entries: self.entries,
            fixups: self.fixups,
        })
    }

    fn align_to(&mut self, align: usize) {
        let align = align.max(1);
        let rem = self.data.len() % align;
        if rem != 0 {
            self.data.resize(self.data.len() + align - rem, 0);
        }
    }

    fn alloc_entry(&mut self, ty: WireType, len: usize, count: usize, align: usize) -> usize {
        self.align_to(align);
        let start = self.data.len();
        self.data.resize(start + len, 0);
        let index = self.entries.len();
        trace!("entry {index}: {count} element(s) at {start:#x}, {len} bytes");
        self.entries.push(PackedEntry {
            ty,
            start,
            len,
            count,
        });
        index
    }

    fn emit_object_entry(&mut self, obj: ObjRef) -> Result<FixupTarget, BlobError> {
        let class = obj.borrow().class;
        let align = self.schemas.class(class)?.alignment as usize;
        let size = field_size(&WireType::Class(class), self.schemas, self.ptr)?;
        let entry = self.alloc_entry(
            WireType::Class(class),
            size,
            1,
            align.max(self.ptr.bytes()),
        );
        let target = FixupTarget { entry, offset: 0 };
        self.existing
            .insert(ValueKey::Object(Rc::as_ptr(&obj)), target);
        let start = self.entries[entry].start;
        self.pack_class_at(class, &obj, start)?;
        self.drain_local()?;
        Ok(target)
    }

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

    fn pack_class_at(&mut self, cid: ClassId, obj: &ObjRef, pos: usize) -> Result<(), BlobError> {
        let schemas = self.schemas;
        let class_name = schemas.class(cid)?.name.as_str();
        let members = schemas.effective_members(cid)?;
        let variant_shape = schemas.is_named_variant(cid)?;

        // Virtual-table slot for base-object descendants; stays zero.
        let mut base = pos;
        if schemas.derives_base_object(cid)? {
            base += self.ptr.bytes();
        }

        for (i, m) in members.iter().enumerate() {
            if m.flags.not_serializable {
                continue;
            }
            let value = obj.borrow().get(&m.name).cloned().unwrap_or(Value::Null);
            let ctx = format!("{class_name}.{}", m.name);
            let off = base + m.offset as usize;
            if variant_shape && i < 3 {
                match i {
                    0 => self.enqueue_string(true, off, value, ctx)?,
                    1 => self.enqueue_string(false, off, value, ctx)?,
                    _ => self.enqueue_reference(&WireType::VariantPointer, off, value, &ctx)?,
                }
            } else {
                self.pack_at(&m.ty, &value, off, &ctx)?;
            }
        }
        Ok(())
    }

    fn pack_at(
        &mut self,
        ty: &WireType,
        value: &Value,
        pos: usize,
        ctx: &str,
    ) -> Result<(), BlobError> {
        let ptr = self.ptr.bytes();
        match ty {
            WireType::Primitive(p) => {
                buf::write_primitive(*p, &mut self.data, pos, ptr, value, ctx)
            }
            WireType::Enum { storage, .. } | WireType::Flags { storage, .. } => {
                buf::write_primitive(*storage, &mut self.data, pos, ptr, value, ctx)
            }
            WireType::Str => self.enqueue_string(false, pos, value.clone(), ctx.to_owned()),
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
                let stride = field_size(elem, self.schemas, self.ptr)?;
                for (i, v) in values.iter().enumerate() {
                    self.pack_at(elem, v, pos + i * stride, ctx)?;
                }
                Ok(())
            }
            WireType::Array(_) | WireType::RelArray(_) => {
                let count = match value {
                    Value::Null => 0,
                    Value::Array(a) => a.borrow().len(),
                    _ => {
                        return Err(BlobError::InvalidWireCategory {
                            category: "array".to_owned(),
                            context: ctx.to_owned(),
                        })
                    }
                };
                buf::write_u32(&mut self.data, pos + ptr, count as u32)?;
                buf::write_u32(
                    &mut self.data,
                    pos + ptr + 4,
                    count as u32 | ARRAY_DONT_FREE,
                )?;
                if count > 0 {
                    self.arrays.push_back(Pending {
                        pos,
                        value: value.clone(),
                        ty: ty.clone(),
                        ctx: ctx.to_owned(),
                    });
                }
                Ok(())
            }
            WireType::RawPointer(_)
            | WireType::RefPointer { .. }
            | WireType::BackRefPointer(_)
            | WireType::VariantPointer => self.enqueue_reference(ty, pos, value.clone(), ctx),
            WireType::Class(cid) => {
                let obj = value.as_object().ok_or_else(|| BlobError::InvalidWireCategory {
                    category: "class".to_owned(),
                    context: ctx.to_owned(),
                })?;
                let obj = obj.clone();
                self.pack_class_at(*cid, &obj, pos)
            }
        }
    }

    fn enqueue_string(
        &mut self,
        variant_name: bool,
        pos: usize,
        value: Value,
        ctx: String,
    ) -> Result<(), BlobError> {
        match &value {
            Value::Null => Ok(()),
            Value::Str(s) if s.is_empty() => Ok(()),
            Value::Str(_) => {
                let queue = if variant_name {
                    &mut self.variant_names
                } else {
                    &mut self.strings
                };
                queue.push_back(Pending {
                    pos,
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
        pos: usize,
        value: Value,
        ctx: &str,
    ) -> Result<(), BlobError> {
        if value.is_null() {
            // A zero placeholder with no fixup row is the null encoding.
            return Ok(());
        }
        self.pointers.push_back(Pending {
            pos,
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
        let target = match self.existing.get(&key) {
            Some(&t) => t,
            None => {
                let bytes = text::encode(&s)?;
                let len = bytes.len();
                let entry = self.alloc_entry(WireType::Str, len, len, self.ptr.bytes());
                let start = self.entries[entry].start;
                self.data[start..start + len].copy_from_slice(&bytes);
                let target = FixupTarget { entry, offset: 0 };
                self.existing.insert(key, target);
                target
            }
        };
        self.fixups.insert(p.pos as u64, target);
        Ok(())
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
        let target = match self.existing.get(&key) {
            Some(&t) => t,
            None => {
                let elem = p.ty.pointee()?.clone();
                let values: Vec<Value> = arr.borrow().clone();
                let stride = field_size(&elem, self.schemas, self.ptr)?;
                let align = field_alignment(&elem, self.schemas, self.ptr)?;
                let entry = self.alloc_entry(
                    p.ty.clone(),
                    stride * values.len(),
                    values.len(),
                    align,
                );
                let target = FixupTarget { entry, offset: 0 };
                self.existing.insert(key, target);
                let start = self.entries[entry].start;
                for (i, v) in values.iter().enumerate() {
                    self.pack_at(&elem, v, start + i * stride, &p.ctx)?;
                }
                target
            }
        };
        self.fixups.insert(p.pos as u64, target);
        Ok(())
    }

    fn backfill_pointer(&mut self, p: Pending) -> Result<(), BlobError> {
        let target = self.pointee_entry(&p)?;
        self.fixups.insert(p.pos as u64, target);
        Ok(())
    }

    fn pointee_entry(&mut self, p: &Pending) -> Result<FixupTarget, BlobError> {
        // Type-check before the dedup fast path: a shared target must
        // satisfy every declared pointee, not just the first one packed.
        if let Value::Object(obj) = &p.value {
            if let Ok(WireType::Class(want)) = p.ty.pointee() {
                let have = obj.borrow().class;
                if !self.schemas.is_subtype(have, *want)? {
                    return Err(BlobError::PointerTypeMismatch {
                        index: self.entries.len() as u32,
                        actual: self.schemas.class(have)?.name.clone(),
                        expected: self.schemas.class(*want)?.name.clone(),
                        member: p.ctx.clone(),
                    });
                }
            }
        }
        if let Some(key) = ValueKey::of(&p.value) {
            if let Some(&t) = self.existing.get(&key) {
                return Ok(t);
            }
        }
        match &p.value {
            Value::Object(obj) => self.emit_object_entry(obj.clone()),
            other => {
                let pointee = p.ty.pointee()?.clone();
                let size = field_size(&pointee, self.schemas, self.ptr)?;
                let align = field_alignment(&pointee, self.schemas, self.ptr)?;
                let entry = self.alloc_entry(pointee.clone(), size, 1, align);
                let start = self.entries[entry].start;
                self.pack_at(&pointee, other, start, &p.ctx)?;
                self.drain_local()?;
                Ok(FixupTarget { entry, offset: 0 })
            }
        }
    }
}
