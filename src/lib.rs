pub mod error;
pub mod packed;
pub mod schema;
pub mod tagged;
pub mod text;
pub mod typegraph;
pub mod value;

mod buf;

pub use error::{BlobError, SchemaError};
pub use packed::{PackedBlob, PackedReader, PackedWriter, PtrSize};
pub use schema::{Class, ClassId, Member, Primitive, SchemaSet, WireType};
pub use tagged::{TaggedBlob, TaggedReader, TaggedWriter};
pub use value::{Object, Value};
