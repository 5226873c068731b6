//! Tagged wire format: the self-describing blob layout.
//!
//! A tagged blob is a flat, ordered list of items: typed memory regions
//! addressed by index. Every pointer, array and string reference on the
//! wire is a 4-byte little-endian item index; item 0 is reserved as
//! null/absent and never holds payload. The container layer that frames
//! the item table on disk is a collaborator outside this crate: it hands
//! [`TaggedBlob`] the parsed item list (byte range plus runtime type per
//! item) and receives one back when writing.
//!
//! Relative arrays share the plain array encoding at this layer. Their
//! jump-offset addressing is applied by the container layer when it frames
//! items on disk; by the time a blob reaches this crate both array
//! categories are item-backed element runs and encode identically.

mod read;
mod write;

pub use read::TaggedReader;
pub use write::TaggedWriter;

use crate::error::BlobError;
use crate::schema::{Primitive, SchemaSet, WireType};

/// Width of an item index on the wire.
pub const INDEX_SIZE: usize = 4;

/// One typed memory region of a tagged blob.
#[derive(Debug, Clone)]
pub struct TaggedItem {
    /// Runtime type of the item's contents.
    pub ty: WireType,
    /// Packed bytes. Immutable once the blob is fully written.
    pub data: Vec<u8>,
    /// Element count: array length, string byte length (terminator
    /// included), 1 for class instances.
    pub count: usize,
}

/// Ordered item list of one blob. `items[0]` is the reserved null item.
#[derive(Debug, Clone, Default)]
pub struct TaggedBlob {
    pub items: Vec<TaggedItem>,
}

impl TaggedBlob {
    /// Empty blob holding only the reserved null item.
    pub fn new() -> TaggedBlob {
        TaggedBlob {
            items: vec![TaggedItem {
                ty: WireType::Primitive(Primitive::Void),
                data: Vec::new(),
                count: 0,
            }],
        }
    }
}

/// Encoded width of a field of type `ty` inside a tagged item buffer.
///
/// Pointers, arrays and strings occupy one item index; `ulong` is always
/// 8 bytes in this format.
pub fn field_size(ty: &WireType, schemas: &SchemaSet) -> Result<usize, BlobError> {
    Ok(match ty {
        WireType::Primitive(p) => p.byte_size(8),
        WireType::Enum { storage, .. } | WireType::Flags { storage, .. } => storage.byte_size(8),
        WireType::Str
        | WireType::RawPointer(_)
        | WireType::RefPointer { .. }
        | WireType::VariantPointer
        | WireType::BackRefPointer(_)
        | WireType::RelArray(_)
        | WireType::Array(_) => INDEX_SIZE,
        WireType::FixedStruct { elem, count } => {
            field_size(elem, schemas)? * (*count as usize)
        }
        WireType::Class(id) => schemas.class(*id)?.size as usize,
    })
}
