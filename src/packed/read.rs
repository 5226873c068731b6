//! Packed-format unpacker.
//!
//! Per-category logic mirrors the tagged reader; what differs is
//! addressing. Every reference reads a pointer-width placeholder at its
//! own position and resolves it through the blob's fixup table (position to
//! entry + offset). A non-zero placeholder with no fixup entry means the
//! container layer failed to resolve the pointer, which is fatal. Entry resolution
//! reuses the Unresolved/InProgress/Resolved state machine, so shared and
//! back-referencing objects decode to single shared values here too.

use std::collections::HashMap;
use std::rc::Rc;

use log::{debug, trace};

use crate::buf;
use crate::error::BlobError;
use crate::schema::{ClassId, SchemaSet, WireType};
use crate::text;
use crate::value::{Object, ObjRef, Value};

use super::{field_size, FixupTarget, PackedBlob};

enum SlotState {
    Unresolved,
    InProgress(ObjRef),
    Resolved(Value),
}

/// Decodes one packed blob against a schema set.
pub struct PackedReader<'s> {
    schemas: &'s SchemaSet,
    blob: PackedBlob,
    states: Vec<SlotState>,
    /// Decoded arrays/strings cached by fixup target, so repeated
    /// references share one value.
    sequences: HashMap<(usize, u64), Value>,
}

impl<'s> PackedReader<'s> {
    pub fn new(schemas: &'s SchemaSet, blob: PackedBlob) -> PackedReader<'s> {
        let states = blob.entries.iter().map(|_| SlotState::Unresolved).collect();
        PackedReader {
            schemas,
            blob,
            states,
            sequences: HashMap::new(),
        }
    }

    /// Decode the blob's root object (entry 0).
    pub fn unpack_root(&mut self) -> Result<Value, BlobError> {
        debug!(
            "unpacking packed blob: {} entries, {} fixups, {:?} pointers",
            self.blob.entries.len(),
            self.blob.fixups.len(),
            self.blob.ptr_size
        );
        self.unpack_entry(0)
    }

    /// Decode an arbitrary entry. Idempotent.
    pub fn unpack_entry(&mut self, index: usize) -> Result<Value, BlobError> {
        if index >= self.blob.entries.len() {
            return Err(BlobError::ItemIndexOutOfRange {
                index: index as u32,
                count: self.blob.entries.len(),
                type_name: "<root>".to_owned(),
            });
        }
        self.resolve_entry(index, "<root>")
    }

    fn ptr_bytes(&self) -> usize {
        self.blob.ptr_size.bytes()
    }

    /// Placeholder-plus-fixup resolution. `None` means a legitimate null;
    /// a non-zero placeholder with no mapping is a broken blob.
    fn fixup(&self, pos: usize) -> Result<Option<FixupTarget>, BlobError> {
        let placeholder = buf::read_uint(&self.blob.data, pos, self.ptr_bytes())?;
        match self.blob.fixups.get(&(pos as u64)) {
            Some(&t) if t.entry < self.blob.entries.len() => Ok(Some(t)),
            Some(_) => Err(BlobError::UnresolvedPointer {
                position: pos as u64,
            }),
            None if placeholder == 0 => Ok(None),
            None => Err(BlobError::UnresolvedPointer {
                position: pos as u64,
            }),
        }
    }

    fn resolve_entry(&mut self, index: usize, ctx: &str) -> Result<Value, BlobError> {
        match &self.states[index] {
            SlotState::Resolved(v) => return Ok(v.clone()),
            SlotState::InProgress(obj) => return Ok(Value::Object(obj.clone())),
            SlotState::Unresolved => {}
        }
        trace!("resolving entry {index} ({ctx})");
        let entry = self.blob.entries[index].clone();
        let value = match entry.ty {
            WireType::Class(cid) => {
                let obj = Object::new(cid);
                self.states[index] = SlotState::InProgress(obj.clone());
                self.unpack_class_at(cid, &obj, entry.start)?;
                Value::Object(obj)
            }
            WireType::Str => {
                let bytes = buf::check(&self.blob.data, entry.start, entry.len)?;
                let decoded = text::decode(bytes, ctx)?;
                Value::Str(Rc::from(decoded.as_str()))
            }
            WireType::Array(elem) | WireType::RelArray(elem) => {
                self.decode_elements(&elem, entry.start, entry.count, ctx)?
            }
            other => self.unpack_at(&other, entry.start, ctx)?,
        };
        self.states[index] = SlotState::Resolved(value.clone());
        Ok(value)
    }

    fn decode_elements(
        &mut self,
        elem: &WireType,
        pos: usize,
        count: usize,
        ctx: &str,
    ) -> Result<Value, BlobError> {
        let stride = field_size(elem, self.schemas, self.blob.ptr_size)?;
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            out.push(self.unpack_at(elem, pos + i * stride, ctx)?);
        }
        Ok(Value::array(out))
    }

    fn unpack_at(&mut self, ty: &WireType, pos: usize, ctx: &str) -> Result<Value, BlobError> {
        let ptr = self.ptr_bytes();
        match ty {
            WireType::Primitive(p) => buf::read_primitive(*p, &self.blob.data, pos, ptr),
            WireType::Enum { storage, .. } | WireType::Flags { storage, .. } => {
                buf::read_primitive(*storage, &self.blob.data, pos, ptr)
            }
            WireType::Str => match self.fixup(pos)? {
                None => Ok(Value::string("")),
                Some(t) => {
                    if let Some(v) = self.sequences.get(&(t.entry, t.offset)) {
                        return Ok(v.clone());
                    }
                    let abs = self.blob.entries[t.entry].start + t.offset as usize;
                    let decoded = text::decode_cstr(&self.blob.data, abs, ctx)?;
                    let value = Value::Str(Rc::from(decoded.as_str()));
                    self.sequences.insert((t.entry, t.offset), value.clone());
                    Ok(value)
                }
            },
            WireType::FixedStruct { elem, count } => {
                let stride = field_size(elem, self.schemas, self.blob.ptr_size)?;
                let mut out = Vec::with_capacity(*count as usize);
                for i in 0..*count as usize {
                    out.push(self.unpack_at(elem, pos + i * stride, ctx)?);
                }
                Ok(Value::Tuple(out))
            }
            WireType::Array(elem) | WireType::RelArray(elem) => {
                let count = buf::read_u32(&self.blob.data, pos + ptr)? as usize;
                // Capacity-and-flags field; validated for range only.
                buf::read_u32(&self.blob.data, pos + ptr + 4)?;
                match self.fixup(pos)? {
                    None if count == 0 => Ok(Value::array(Vec::new())),
                    None => Err(BlobError::UnresolvedPointer {
                        position: pos as u64,
                    }),
                    Some(t) => {
                        if let Some(v) = self.sequences.get(&(t.entry, t.offset)) {
                            return Ok(v.clone());
                        }
                        let abs = self.blob.entries[t.entry].start + t.offset as usize;
                        let value = self.decode_elements(elem, abs, count, ctx)?;
                        self.sequences.insert((t.entry, t.offset), value.clone());
                        Ok(value)
                    }
                }
            }
            WireType::RawPointer(t)
            | WireType::RefPointer { target: t, .. }
            | WireType::BackRefPointer(t) => {
                let declared = match t.as_ref() {
                    WireType::Class(id) => Some(*id),
                    _ => None,
                };
                self.unpack_pointer(declared, pos, ctx)
            }
            WireType::VariantPointer => self.unpack_pointer(None, pos, ctx),
            WireType::Class(cid) => {
                let obj = Object::new(*cid);
                self.unpack_class_at(*cid, &obj, pos)?;
                Ok(Value::Object(obj))
            }
        }
    }

    fn unpack_pointer(
        &mut self,
        declared: Option<ClassId>,
        pos: usize,
        ctx: &str,
    ) -> Result<Value, BlobError> {
        let target = match self.fixup(pos)? {
            None => return Ok(Value::Null),
            Some(t) => t,
        };
        if target.offset != 0 {
            // Object pointers always land on an entry start.
            return Err(BlobError::UnresolvedPointer {
                position: pos as u64,
            });
        }
        if let Some(want) = declared {
            match &self.blob.entries[target.entry].ty {
                WireType::Class(have) if self.schemas.is_subtype(*have, want)? => {}
                other => {
                    return Err(BlobError::PointerTypeMismatch {
                        index: target.entry as u32,
                        actual: other.display_name(self.schemas)?,
                        expected: self.schemas.class(want)?.name.clone(),
                        member: ctx.to_owned(),
                    });
                }
            }
        }
        self.resolve_entry(target.entry, ctx)
    }

    fn unpack_class_at(
        &mut self,
        cid: ClassId,
        obj: &ObjRef,
        pos: usize,
    ) -> Result<(), BlobError> {
        let schemas = self.schemas;
        let class_name = schemas.class(cid)?.name.as_str();
        let members = schemas.effective_members(cid)?;
        let variant_shape = schemas.is_named_variant(cid)?;

        // Base-object lineage carries a virtual-table slot ahead of the
        // first member. Must hold zero.
        let mut base = pos;
        if schemas.derives_base_object(cid)? {
            let ptr = self.ptr_bytes();
            if buf::read_uint(&self.blob.data, pos, ptr)? != 0 {
                return Err(BlobError::NonZeroReserved {
                    position: pos as u64,
                });
            }
            base += ptr;
        }

        for (i, m) in members.iter().enumerate() {
            if m.flags.not_serializable {
                continue;
            }
            let ctx = format!("{class_name}.{}", m.name);
            let off = base + m.offset as usize;
            let value = if variant_shape && i == 2 {
                let class_member = members[1];
                let name_pos = base + class_member.offset as usize;
                let named = self.unpack_at(&WireType::Str, name_pos, &ctx)?;
                let named = named.as_str().unwrap_or("");
                if named.is_empty() {
                    self.unpack_pointer(None, off, &ctx)?
                } else {
                    let concrete = schemas
                        .lookup(named)
                        .ok_or_else(|| BlobError::UnknownVariantClass(named.to_owned()))?;
                    self.unpack_pointer(Some(concrete), off, &ctx)?
                }
            } else {
                self.unpack_at(&m.ty, off, &ctx)?
            };
            obj.borrow_mut().set(&m.name, value);
        }
        Ok(())
    }
}
