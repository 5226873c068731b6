//! Error taxonomy for the codec core.
//!
//! Two tiers, matching how failures are detected:
//!   - [`SchemaError`]: schema-integrity faults, detected once per schema
//!     set. No blob can be processed against a broken schema set.
//!   - [`BlobError`]: blob-integrity and type-compatibility faults,
//!     detected per value during pack/unpack. Fatal for the whole blob;
//!     there is no best-effort or partial decode mode. Silently-wrong
//!     animation data is worse than a hard failure.
//!
//! Every variant carries enough context (type name, member name, byte
//! offset, item index) to locate the failing part of the graph.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("cyclic inheritance chain through class `{0}`")]
    CyclicInheritance(String),
    #[error("duplicate type name `{0}`")]
    DuplicateTypeName(String),
    #[error("forward type reference `{0}` was never defined")]
    UnresolvedForwardType(String),
    #[error("no enum identity for member `{class}.{member}` and no override supplied")]
    MissingEnum { class: String, member: String },
    #[error("`{0}` is not a pointer or array type")]
    NotAPointer(String),
    #[error("fixed struct element count {0} exceeds 255")]
    FixedStructTooLong(usize),
}

#[derive(Error, Debug)]
pub enum BlobError {
    #[error("item index {index} out of range ({count} items) while reading `{type_name}`")]
    ItemIndexOutOfRange {
        index: u32,
        count: usize,
        type_name: String,
    },
    #[error("read of {len} bytes at offset {offset} exceeds buffer of {available} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        available: usize,
    },
    #[error("item {index} holds `{actual}`, expected `{expected}` or a subtype (member `{member}`)")]
    PointerTypeMismatch {
        index: u32,
        actual: String,
        expected: String,
        member: String,
    },
    #[error("variant class name `{0}` has no schema in the active set")]
    UnknownVariantClass(String),
    #[error("fixed struct of `{type_name}` expects {expected} elements, got {actual}")]
    StructLengthMismatch {
        type_name: String,
        expected: usize,
        actual: usize,
    },
    #[error("wire category `{category}` has no packed encoding (value for `{context}`)")]
    InvalidWireCategory { category: String, context: String },
    #[error("pointer at position {position:#x} has no fixup entry")]
    UnresolvedPointer { position: u64 },
    #[error("reserved field at position {position:#x} must be zero")]
    NonZeroReserved { position: u64 },
    #[error("text at `{context}` is not valid Shift-JIS")]
    BadText { context: String },
    #[error("string `{0}` has no Shift-JIS encoding")]
    UnencodableText(String),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
