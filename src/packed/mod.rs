//! Packed wire format: the legacy blob layout.
//!
//! Instead of the tagged format's index table, a packed blob addresses
//! memory by byte offset: "entries" are typed regions of one flat data
//! section, and every pointer on the wire is a pointer-width zero
//! placeholder resolved through an explicit fixup table keyed by the
//! placeholder's position. Legacy files exist in 32-bit and 64-bit
//! variants, so the pointer width is a runtime parameter threaded through
//! every call, never hard-coded.
//!
//! Arrays are `(placeholder, u32 count, u32 capacity|flags)` headers; the
//! capacity's most-significant bit is the source engine's "do not free"
//! allocator flag and is set on every array this codec writes. Relative
//! arrays share this encoding: their jump-offset addressing is resolved
//! into the fixup table by the container layer, so both array categories
//! read and write identically here. Classes
//! descending from the engine's base-object marker reserve one
//! pointer-width zero slot ahead of their first member, mirroring the
//! virtual-table slot of the original in-memory layout.

mod read;
mod write;
pub mod typetable;

pub use read::PackedReader;
pub use write::PackedWriter;

use std::collections::BTreeMap;

use crate::error::BlobError;
use crate::schema::{SchemaSet, WireType};

/// High bit of an array header's capacity field: element storage must not
/// be handed back to the allocator.
pub const ARRAY_DONT_FREE: u32 = 0x8000_0000;

/// Target-platform pointer width of a packed blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtrSize {
    Four,
    Eight,
}

impl PtrSize {
    pub fn bytes(self) -> usize {
        match self {
            PtrSize::Four => 4,
            PtrSize::Eight => 8,
        }
    }
}

/// Resolved target of one pointer placeholder: an entry plus a byte offset
/// inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixupTarget {
    pub entry: usize,
    pub offset: u64,
}

/// One typed region of the data section.
#[derive(Debug, Clone)]
pub struct PackedEntry {
    pub ty: WireType,
    /// Absolute start within [`PackedBlob::data`].
    pub start: usize,
    pub len: usize,
    /// Element count: array length, string byte length, 1 for instances.
    pub count: usize,
}

/// One packed blob: flat data section, entry list, and the pointer-fixup
/// table built when the container layer parsed the file.
#[derive(Debug, Clone)]
pub struct PackedBlob {
    pub ptr_size: PtrSize,
    pub data: Vec<u8>,
    pub entries: Vec<PackedEntry>,
    /// Placeholder position keyed to its resolved target.
    pub fixups: BTreeMap<u64, FixupTarget>,
}

/// Encoded width of a field of type `ty` in the packed layout.
pub fn field_size(
    ty: &WireType,
    schemas: &SchemaSet,
    ptr: PtrSize,
) -> Result<usize, BlobError> {
    Ok(match ty {
        WireType::Primitive(p) => p.byte_size(ptr.bytes()),
        WireType::Enum { storage, .. } | WireType::Flags { storage, .. } => {
            storage.byte_size(ptr.bytes())
        }
        WireType::Str
        | WireType::RawPointer(_)
        | WireType::RefPointer { .. }
        | WireType::VariantPointer
        | WireType::BackRefPointer(_) => ptr.bytes(),
        // (placeholder, count, capacity|flags)
        WireType::RelArray(_) | WireType::Array(_) => ptr.bytes() + 8,
        WireType::FixedStruct { elem, count } => {
            field_size(elem, schemas, ptr)? * (*count as usize)
        }
        WireType::Class(id) => {
            let pad = if schemas.derives_base_object(*id)? {
                ptr.bytes()
            } else {
                0
            };
            schemas.class(*id)?.size as usize + pad
        }
    })
}

/// Field alignment used when placing new entries in the data section.
pub fn field_alignment(
    ty: &WireType,
    schemas: &SchemaSet,
    ptr: PtrSize,
) -> Result<usize, BlobError> {
    Ok(match ty {
        WireType::Primitive(p) => p.alignment(ptr.bytes()),
        WireType::Enum { storage, .. } | WireType::Flags { storage, .. } => {
            storage.alignment(ptr.bytes())
        }
        WireType::Str
        | WireType::RawPointer(_)
        | WireType::RefPointer { .. }
        | WireType::VariantPointer
        | WireType::BackRefPointer(_)
        | WireType::RelArray(_)
        | WireType::Array(_) => ptr.bytes(),
        WireType::FixedStruct { elem, .. } => field_alignment(elem, schemas, ptr)?,
        WireType::Class(id) => schemas.class(*id)?.alignment as usize,
    })
}
