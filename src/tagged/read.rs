//! Tagged-format unpacker.
//!
//! Values are read relative to item buffers; pointer, array and string
//! references resolve through the blob's item list. Each item carries a
//! resolution state (`Unresolved | InProgress | Resolved`): class items
//! are allocated up front and marked in-progress before their members are
//! read, so a back-reference that re-enters the item mid-unpack receives
//! the partially-constructed instance instead of recursing forever, and
//! every reference to one item decodes to the same shared value.

use std::rc::Rc;

use log::{debug, trace};

use crate::buf;
use crate::error::BlobError;
use crate::schema::{ClassId, Member, SchemaSet, WireType};
use crate::text;
use crate::value::{Object, ObjRef, Value};

use super::{field_size, TaggedBlob, TaggedItem};

enum SlotState {
    Unresolved,
    InProgress(ObjRef),
    Resolved(Value),
}

/// Decodes one tagged blob against a schema set. Single-threaded; one
/// reader per blob.
pub struct TaggedReader<'s> {
    schemas: &'s SchemaSet,
    items: Vec<TaggedItem>,
    states: Vec<SlotState>,
}

impl<'s> TaggedReader<'s> {
    pub fn new(schemas: &'s SchemaSet, blob: TaggedBlob) -> TaggedReader<'s> {
        let states = blob.items.iter().map(|_| SlotState::Unresolved).collect();
        TaggedReader {
            schemas,
            items: blob.items,
            states,
        }
    }

    /// Decode the blob's root object (item 1; item 0 is the null item).
    pub fn unpack_root(&mut self) -> Result<Value, BlobError> {
        debug!("unpacking tagged blob with {} items", self.items.len());
        self.unpack_item(1)
    }

    /// Decode an arbitrary item. Idempotent: repeated calls return the
    /// same shared value.
    pub fn unpack_item(&mut self, index: usize) -> Result<Value, BlobError> {
        if index == 0 || index >= self.items.len() {
            return Err(BlobError::ItemIndexOutOfRange {
                index: index as u32,
                count: self.items.len(),
                type_name: "<root>".to_owned(),
            });
        }
        self.resolve_item(index, "<root>")
    }

    fn resolve_item(&mut self, index: usize, ctx: &str) -> Result<Value, BlobError> {
        match &self.states[index] {
            SlotState::Resolved(v) => return Ok(v.clone()),
            SlotState::InProgress(obj) => return Ok(Value::Object(obj.clone())),
            SlotState::Unresolved => {}
        }
        trace!("resolving item {index} ({ctx})");
        let ty = self.items[index].ty.clone();
        let value = match ty {
            WireType::Class(cid) => {
                // Allocate up front so a back-reference resolving mid-unpack
                // sees the instance under construction.
                let obj = Object::new(cid);
                self.states[index] = SlotState::InProgress(obj.clone());
                self.unpack_class_into(cid, &obj, index, 0)?;
                Value::Object(obj)
            }
            WireType::Str => {
                let decoded = text::decode(&self.items[index].data, ctx)?;
                Value::Str(Rc::from(decoded.as_str()))
            }
            WireType::Array(elem) | WireType::RelArray(elem) => {
                self.decode_array_items(index, &elem, ctx)?
            }
            other => self.unpack_at(&other, index, 0, ctx)?,
        };
        self.states[index] = SlotState::Resolved(value.clone());
        Ok(value)
    }

    fn decode_array_items(
        &mut self,
        index: usize,
        elem: &WireType,
        ctx: &str,
    ) -> Result<Value, BlobError> {
        let count = self.items[index].count;
        let stride = field_size(elem, self.schemas)?;
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            out.push(self.unpack_at(elem, index, i * stride, ctx)?);
        }
        Ok(Value::array(out))
    }

    fn unpack_at(
        &mut self,
        ty: &WireType,
        item: usize,
        offset: usize,
        ctx: &str,
    ) -> Result<Value, BlobError> {
        match ty {
            WireType::Primitive(p) => buf::read_primitive(*p, &self.items[item].data, offset, 8),
            WireType::Enum { storage, .. } | WireType::Flags { storage, .. } => {
                buf::read_primitive(*storage, &self.items[item].data, offset, 8)
            }
            WireType::Str => {
                let index = buf::read_u32(&self.items[item].data, offset)?;
                if index == 0 {
                    return Ok(Value::string(""));
                }
                self.check_index(index, ctx)?;
                self.resolve_item(index as usize, ctx)
            }
            WireType::FixedStruct { elem, count } => {
                let stride = field_size(elem, self.schemas)?;
                let mut out = Vec::with_capacity(*count as usize);
                for i in 0..*count as usize {
                    out.push(self.unpack_at(elem, item, offset + i * stride, ctx)?);
                }
                Ok(Value::Tuple(out))
            }
            WireType::Array(_) | WireType::RelArray(_) => {
                let index = buf::read_u32(&self.items[item].data, offset)?;
                if index == 0 {
                    return Ok(Value::array(Vec::new()));
                }
                self.check_index(index, ctx)?;
                self.resolve_item(index as usize, ctx)
            }
            WireType::RawPointer(t)
            | WireType::RefPointer { target: t, .. }
            | WireType::BackRefPointer(t) => {
                let declared = match t.as_ref() {
                    WireType::Class(id) => Some(*id),
                    _ => None,
                };
                self.unpack_pointer(declared, item, offset, ctx)
            }
            WireType::VariantPointer => self.unpack_pointer(None, item, offset, ctx),
            WireType::Class(cid) => {
                let obj = Object::new(*cid);
                self.unpack_class_into(*cid, &obj, item, offset)?;
                Ok(Value::Object(obj))
            }
        }
    }

    /// Read a 4-byte item index and resolve the referenced item, verifying
    /// that its runtime type satisfies `declared` (a class or descendant).
    fn unpack_pointer(
        &mut self,
        declared: Option<ClassId>,
        item: usize,
        offset: usize,
        ctx: &str,
    ) -> Result<Value, BlobError> {
        let index = buf::read_u32(&self.items[item].data, offset)?;
        if index == 0 {
            return Ok(Value::Null);
        }
        self.check_index(index, ctx)?;
        if let Some(want) = declared {
            match &self.items[index as usize].ty {
                WireType::Class(have) if self.schemas.is_subtype(*have, want)? => {}
                other => {
                    return Err(BlobError::PointerTypeMismatch {
                        index,
                        actual: other.display_name(self.schemas)?,
                        expected: self.schemas.class(want)?.name.clone(),
                        member: ctx.to_owned(),
                    });
                }
            }
        }
        self.resolve_item(index as usize, ctx)
    }

    fn check_index(&self, index: u32, ctx: &str) -> Result<(), BlobError> {
        if index as usize >= self.items.len() {
            return Err(BlobError::ItemIndexOutOfRange {
                index,
                count: self.items.len(),
                type_name: ctx.to_owned(),
            });
        }
        Ok(())
    }

    /// Unpack every effective member of `cid` at `offset` into `obj`.
    ///
    /// The named-variant shape is the one schema-name-driven case: the
    /// class-name string selects the concrete pointee class for the
    /// variant pointer, overriding static typing.
    fn unpack_class_into(
        &mut self,
        cid: ClassId,
        obj: &ObjRef,
        item: usize,
        offset: usize,
    ) -> Result<(), BlobError> {
        let schemas = self.schemas;
        let class_name = schemas.class(cid)?.name.as_str();
        let members: Vec<&Member> = schemas.effective_members(cid)?;
        let variant_shape = schemas.is_named_variant(cid)?;

        for (i, m) in members.iter().enumerate() {
            if m.flags.not_serializable {
                continue;
            }
            let ctx = format!("{class_name}.{}", m.name);
            let off = offset + m.offset as usize;
            let value = if variant_shape && i == 2 {
                // Resolve the concrete class named by the sibling string.
                let class_member = members[1];
                let name_off = offset + class_member.offset as usize;
                let named = self.unpack_at(&WireType::Str, item, name_off, &ctx)?;
                let named = named.as_str().unwrap_or("");
                if named.is_empty() {
                    // No class name recorded: the variant must be null.
                    self.unpack_pointer(None, item, off, &ctx)?
                } else {
                    let concrete = schemas
                        .lookup(named)
                        .ok_or_else(|| BlobError::UnknownVariantClass(named.to_owned()))?;
                    self.unpack_pointer(Some(concrete), item, off, &ctx)?
                }
            } else {
                self.unpack_at(&m.ty, item, off, &ctx)?
            };
            obj.borrow_mut().set(&m.name, value);
        }
        Ok(())
    }
}
