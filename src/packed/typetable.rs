//! Legacy type-section unpacker: rebuilds a [`SchemaSet`] from the class
//! descriptor table embedded in a packed file.
//!
//! Section layout (all integers little-endian):
//!
//! ```text
//! u32 class_count
//! per class:
//!   cstr name                 Shift-JIS, NUL-terminated
//!   cstr parent_name          "" when the class has no parent
//!   u32  version
//!   u32  byte_size
//!   u32  alignment
//!   u32  member_count
//!   u32  enum_count
//!   per enum:
//!     cstr name
//!     u32  item_count
//!     per item: i32 value, cstr name
//!   per member:
//!     cstr name
//!     cstr type_name          class or enum name; "" when inapplicable
//!     u32  offset
//!     u8   category
//!     u8   subtype            element category, or enum width code
//!     u8   inline_count       fixed-struct repetition; 0 = scalar
//!     u8   flags
//! ```
//!
//! Classes are scanned in two passes so a member may reference an enum or
//! class declared by a later entry: pass one parses every descriptor and
//! collects the enum tables, pass two registers the classes, reserving ids
//! for names that only appear as references. A reservation left dangling
//! after the whole section loads is an [`SchemaError::UnresolvedForwardType`]
//! error from [`SchemaSet::ensure_resolved`].

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;

use crate::buf;
use crate::error::{BlobError, SchemaError};
use crate::schema::overrides::EnumOverrides;
use crate::schema::{
    Class, ClassId, EnumDef, EnumItem, Member, MemberFlags, Primitive, SchemaSet, WireType,
};
use crate::text;

// Member category codes of the legacy section.
pub const T_VOID: u8 = 0;
pub const T_BOOL: u8 = 1;
pub const T_INT8: u8 = 2;
pub const T_UINT8: u8 = 3;
pub const T_INT16: u8 = 4;
pub const T_UINT16: u8 = 5;
pub const T_INT32: u8 = 6;
pub const T_UINT32: u8 = 7;
pub const T_INT64: u8 = 8;
pub const T_UINT64: u8 = 9;
pub const T_ULONG: u8 = 10;
pub const T_REAL: u8 = 11;
pub const T_HALF: u8 = 12;
pub const T_STRING: u8 = 13;
pub const T_ENUM: u8 = 14;
pub const T_FLAGS: u8 = 15;
pub const T_STRUCT: u8 = 16;
pub const T_POINTER: u8 = 17;
pub const T_ARRAY: u8 = 18;
pub const T_RELARRAY: u8 = 19;
pub const T_VARIANT: u8 = 20;

struct RawMember {
    name: String,
    type_name: String,
    offset: u32,
    category: u8,
    subtype: u8,
    inline_count: u8,
    flags: u8,
}

struct RawClass {
    name: String,
    parent_name: String,
    version: u32,
    size: u32,
    alignment: u32,
    enums: Vec<Arc<EnumDef>>,
    members: Vec<RawMember>,
}

struct Cursor<'d> {
    data: &'d [u8],
    pos: usize,
}

impl<'d> Cursor<'d> {
    fn read_u8(&mut self) -> Result<u8, BlobError> {
        let b = buf::check(self.data, self.pos, 1)?[0];
        self.pos += 1;
        Ok(b)
    }

    fn read_u32(&mut self) -> Result<u32, BlobError> {
        let v = buf::read_u32(self.data, self.pos)?;
        self.pos += 4;
        Ok(v)
    }

    fn read_i32(&mut self) -> Result<i32, BlobError> {
        Ok(self.read_u32()? as i32)
    }

    fn read_cstr(&mut self, ctx: &str) -> Result<String, BlobError> {
        let tail = self.data.get(self.pos..).ok_or(BlobError::OutOfBounds {
            offset: self.pos,
            len: 1,
            available: self.data.len(),
        })?;
        let nul = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| BlobError::BadText {
                context: ctx.to_owned(),
            })?;
        let s = text::decode(&tail[..=nul], ctx)?;
        self.pos += nul + 1;
        Ok(s)
    }
}

/// Rebuild class descriptors from a legacy type section.
///
/// `name_hashes` supplies the per-class name hash recorded by the file's
/// outer directory; `overrides` resolves enum members whose identity the
/// section left blank. Returns the scanned classes' ids in declaration
/// order, registered into `schemas`.
pub fn unpack_type_table(
    data: &[u8],
    name_hashes: &HashMap<String, u32>,
    overrides: &EnumOverrides,
    schemas: &mut SchemaSet,
) -> Result<Vec<ClassId>, BlobError> {
    let mut cur = Cursor { data, pos: 0 };
    let class_count = cur.read_u32()? as usize;

    // Pass one: parse everything, collect enum tables by name.
    let mut raw = Vec::with_capacity(class_count);
    let mut enums: HashMap<String, Arc<EnumDef>> = HashMap::new();
    for _ in 0..class_count {
        let class = parse_class(&mut cur)?;
        for def in &class.enums {
            enums.entry(def.name.clone()).or_insert_with(|| def.clone());
        }
        raw.push(class);
    }

    // Pass two: register, reserving ids for referenced-only names.
    let mut ids = Vec::with_capacity(raw.len());
    for rc in &raw {
        let mut class = Class::new(&rc.name, rc.size);
        class.version = rc.version;
        class.alignment = rc.alignment;
        class.name_hash = name_hashes.get(&rc.name).copied();
        if !rc.parent_name.is_empty() {
            class.parent = Some(schemas.reserve(&rc.parent_name));
        }
        class.local_enums = rc.enums.clone();
        for m in &rc.members {
            let ty = member_type(m, &rc.name, &enums, overrides, schemas)?;
            let mut member = Member::new(&m.name, m.offset, ty);
            member.flags = MemberFlags::from_bits(m.flags);
            class.members.push(member);
        }
        ids.push(schemas.define(class)?);
    }
    schemas.ensure_resolved()?;
    debug!("type section: {} classes, {} enum tables", ids.len(), enums.len());
    Ok(ids)
}

fn parse_class(cur: &mut Cursor<'_>) -> Result<RawClass, BlobError> {
    let name = cur.read_cstr("<class name>")?;
    let parent_name = cur.read_cstr(&name)?;
    let version = cur.read_u32()?;
    let size = cur.read_u32()?;
    let alignment = cur.read_u32()?;
    let member_count = cur.read_u32()? as usize;
    let enum_count = cur.read_u32()? as usize;

    let mut enums = Vec::with_capacity(enum_count);
    for _ in 0..enum_count {
        let enum_name = cur.read_cstr(&name)?;
        let item_count = cur.read_u32()? as usize;
        let mut items = Vec::with_capacity(item_count);
        for _ in 0..item_count {
            let value = cur.read_i32()? as i64;
            let item_name = cur.read_cstr(&enum_name)?;
            items.push(EnumItem {
                name: item_name,
                value,
            });
        }
        enums.push(Arc::new(EnumDef {
            name: enum_name,
            items,
        }));
    }

    let mut members = Vec::with_capacity(member_count);
    for _ in 0..member_count {
        let member_name = cur.read_cstr(&name)?;
        let type_name = cur.read_cstr(&member_name)?;
        members.push(RawMember {
            name: member_name,
            type_name,
            offset: cur.read_u32()?,
            category: cur.read_u8()?,
            subtype: cur.read_u8()?,
            inline_count: cur.read_u8()?,
            flags: cur.read_u8()?,
        });
    }

    Ok(RawClass {
        name,
        parent_name,
        version,
        size,
        alignment,
        enums,
        members,
    })
}

fn scalar(category: u8) -> Option<Primitive> {
    Some(match category {
        T_VOID => Primitive::Void,
        T_BOOL => Primitive::Bool,
        T_INT8 => Primitive::Int8,
        T_UINT8 => Primitive::UInt8,
        T_INT16 => Primitive::Int16,
        T_UINT16 => Primitive::UInt16,
        T_INT32 => Primitive::Int32,
        T_UINT32 => Primitive::UInt32,
        T_INT64 => Primitive::Int64,
        T_UINT64 => Primitive::UInt64,
        T_ULONG => Primitive::ULong,
        T_REAL => Primitive::Float32,
        T_HALF => Primitive::Half,
        _ => return None,
    })
}

/// Element type named by a subtype code plus the member's `type_name`.
/// Used for pointer targets and array elements.
fn element_type(
    subtype: u8,
    type_name: &str,
    ctx: &str,
    schemas: &mut SchemaSet,
) -> Result<WireType, BlobError> {
    if let Some(p) = scalar(subtype) {
        return Ok(WireType::Primitive(p));
    }
    match subtype {
        T_STRING => Ok(WireType::Str),
        T_STRUCT => Ok(WireType::Class(schemas.reserve(type_name))),
        T_POINTER => Ok(WireType::raw_pointer(WireType::Class(
            schemas.reserve(type_name),
        ))),
        T_VARIANT => Ok(WireType::VariantPointer),
        other => Err(BlobError::InvalidWireCategory {
            category: format!("subtype code {other}"),
            context: ctx.to_owned(),
        }),
    }
}

fn member_type(
    m: &RawMember,
    class_name: &str,
    enums: &HashMap<String, Arc<EnumDef>>,
    overrides: &EnumOverrides,
    schemas: &mut SchemaSet,
) -> Result<WireType, BlobError> {
    let ctx = format!("{class_name}.{}", m.name);
    let base = if let Some(p) = scalar(m.category) {
        WireType::Primitive(p)
    } else {
        match m.category {
            T_STRING => WireType::Str,
            T_ENUM | T_FLAGS => {
                let storage = Primitive::enum_storage(m.subtype).ok_or_else(|| {
                    BlobError::InvalidWireCategory {
                        category: format!("enum width code {}", m.subtype),
                        context: ctx.clone(),
                    }
                })?;
                let enum_name = if m.type_name.is_empty() {
                    overrides
                        .lookup(class_name, &m.name)
                        .ok_or_else(|| SchemaError::MissingEnum {
                            class: class_name.to_owned(),
                            member: m.name.clone(),
                        })?
                } else {
                    &m.type_name
                };
                let def = enums
                    .get(enum_name)
                    .cloned()
                    .unwrap_or_else(|| EnumDef::opaque(enum_name));
                if m.category == T_ENUM {
                    WireType::Enum { storage, def }
                } else {
                    WireType::Flags { storage, def }
                }
            }
            T_STRUCT => WireType::Class(schemas.reserve(&m.type_name)),
            T_POINTER => {
                WireType::raw_pointer(element_type(m.subtype, &m.type_name, &ctx, schemas)?)
            }
            T_ARRAY => WireType::array(element_type(m.subtype, &m.type_name, &ctx, schemas)?),
            T_RELARRAY => {
                WireType::rel_array(element_type(m.subtype, &m.type_name, &ctx, schemas)?)
            }
            T_VARIANT => WireType::VariantPointer,
            other => {
                return Err(BlobError::InvalidWireCategory {
                    category: format!("category code {other}"),
                    context: ctx,
                })
            }
        }
    };
    if m.inline_count > 0 {
        Ok(WireType::fixed_struct(base, m.inline_count as usize).map_err(BlobError::Schema)?)
    } else {
        Ok(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SectionBuilder {
        bytes: Vec<u8>,
        classes: u32,
    }

    impl SectionBuilder {
        fn new() -> SectionBuilder {
            SectionBuilder {
                bytes: vec![0; 4],
                classes: 0,
            }
        }

        fn cstr(&mut self, s: &str) -> &mut Self {
            self.bytes.extend_from_slice(s.as_bytes());
            self.bytes.push(0);
            self
        }

        fn u32(&mut self, v: u32) -> &mut Self {
            self.bytes.extend_from_slice(&v.to_le_bytes());
            self
        }

        fn class_header(
            &mut self,
            name: &str,
            parent: &str,
            size: u32,
            members: u32,
            enums: u32,
        ) -> &mut Self {
            self.classes += 1;
            self.cstr(name).cstr(parent);
            self.u32(1).u32(size).u32(4).u32(members).u32(enums)
        }

        fn member(
            &mut self,
            name: &str,
            type_name: &str,
            offset: u32,
            category: u8,
            subtype: u8,
            inline: u8,
            flags: u8,
        ) -> &mut Self {
            self.cstr(name).cstr(type_name).u32(offset);
            self.bytes.extend_from_slice(&[category, subtype, inline, flags]);
            self
        }

        fn finish(mut self) -> Vec<u8> {
            self.bytes[..4].copy_from_slice(&self.classes.to_le_bytes());
            self.bytes
        }
    }

    fn scan(data: &[u8]) -> Result<(SchemaSet, Vec<ClassId>), BlobError> {
        let mut set = SchemaSet::new();
        let ids = unpack_type_table(
            data,
            &HashMap::new(),
            &EnumOverrides::default(),
            &mut set,
        )?;
        Ok((set, ids))
    }

    #[test]
    fn scalar_members_and_offsets() {
        let mut b = SectionBuilder::new();
        b.class_header("Bone", "", 16, 2, 0)
            .member("length", "", 0, T_REAL, 0, 0, 0)
            .member("index", "", 4, T_INT32, 0, 0, 0);
        let (set, ids) = scan(&b.finish()).unwrap();
        let class = set.class(ids[0]).unwrap();
        assert_eq!(class.name, "Bone");
        assert_eq!(class.members[0].ty, WireType::Primitive(Primitive::Float32));
        assert_eq!(class.members[1].offset, 4);
    }

    #[test]
    fn forward_and_self_references_resolve() {
        let mut b = SectionBuilder::new();
        b.class_header("Bone", "", 12, 2, 0)
            .member("parent", "Bone", 0, T_POINTER, T_STRUCT, 0, 0)
            .member("owner", "Skeleton", 4, T_POINTER, T_STRUCT, 0, 0);
        b.class_header("Skeleton", "", 8, 1, 0)
            .member("bones", "Bone", 0, T_ARRAY, T_STRUCT, 0, 0);
        let (set, ids) = scan(&b.finish()).unwrap();
        let bone = set.class(ids[0]).unwrap();
        assert_eq!(
            bone.members[0].ty,
            WireType::raw_pointer(WireType::Class(ids[0]))
        );
        assert_eq!(
            bone.members[1].ty,
            WireType::raw_pointer(WireType::Class(ids[1]))
        );
        let skeleton = set.class(ids[1]).unwrap();
        assert_eq!(skeleton.members[0].ty, WireType::array(WireType::Class(ids[0])));
    }

    #[test]
    fn dangling_reference_fails_resolution() {
        let mut b = SectionBuilder::new();
        b.class_header("Bone", "", 4, 1, 0)
            .member("owner", "Missing", 0, T_POINTER, T_STRUCT, 0, 0);
        assert!(matches!(
            scan(&b.finish()),
            Err(BlobError::Schema(SchemaError::UnresolvedForwardType(_)))
        ));
    }

    #[test]
    fn enum_storage_follows_the_width_code() {
        let mut b = SectionBuilder::new();
        b.class_header("Frame", "", 8, 2, 1);
        b.cstr("FrameType").u32(1).u32(0).cstr("Rest");
        b.member("kind", "FrameType", 0, T_ENUM, 0, 0, 0)
            .member("mask", "FrameType", 1, T_FLAGS, 1, 0, 0);
        let (set, ids) = scan(&b.finish()).unwrap();
        let class = set.class(ids[0]).unwrap();
        match &class.members[0].ty {
            WireType::Enum { storage, def } => {
                assert_eq!(*storage, Primitive::UInt8);
                assert_eq!(def.items[0].name, "Rest");
            }
            other => panic!("expected enum, got {other:?}"),
        }
        match &class.members[1].ty {
            WireType::Flags { storage, .. } => assert_eq!(*storage, Primitive::UInt16),
            other => panic!("expected flags, got {other:?}"),
        }
    }

    #[test]
    fn unknown_enum_width_code_is_rejected() {
        let mut b = SectionBuilder::new();
        b.class_header("Frame", "", 4, 1, 0)
            .member("kind", "FrameType", 0, T_ENUM, 9, 0, 0);
        assert!(matches!(
            scan(&b.finish()),
            Err(BlobError::InvalidWireCategory { .. })
        ));
    }

    #[test]
    fn blank_enum_identity_uses_the_override_table() {
        let mut b = SectionBuilder::new();
        b.class_header("Frame", "", 4, 1, 0)
            .member("kind", "", 0, T_ENUM, 2, 0, 0);
        let data = b.finish();

        let mut set = SchemaSet::new();
        let err = unpack_type_table(
            &data,
            &HashMap::new(),
            &EnumOverrides::default(),
            &mut set,
        );
        assert!(matches!(
            err,
            Err(BlobError::Schema(SchemaError::MissingEnum { .. }))
        ));

        let overrides = EnumOverrides::from_json(
            br#"{"entries":[{"class":"Frame","member":"kind","enum_name":"FrameType"}]}"#,
        )
        .unwrap();
        let mut set = SchemaSet::new();
        let ids = unpack_type_table(&data, &HashMap::new(), &overrides, &mut set).unwrap();
        match &set.class(ids[0]).unwrap().members[0].ty {
            WireType::Enum { def, .. } => assert_eq!(def.name, "FrameType"),
            other => panic!("expected enum, got {other:?}"),
        }
    }

    #[test]
    fn inline_count_wraps_in_a_fixed_struct() {
        let mut b = SectionBuilder::new();
        b.class_header("Transform", "", 48, 1, 0)
            .member("matrix", "", 0, T_REAL, 0, 12, 0);
        let (set, ids) = scan(&b.finish()).unwrap();
        assert_eq!(
            set.class(ids[0]).unwrap().members[0].ty,
            WireType::fixed_struct(WireType::Primitive(Primitive::Float32), 12).unwrap()
        );
    }

    #[test]
    fn parent_and_hash_are_attached() {
        let mut b = SectionBuilder::new();
        b.class_header("Base", "", 4, 0, 0);
        b.class_header("Derived", "Base", 8, 0, 0);
        let data = b.finish();
        let mut hashes = HashMap::new();
        hashes.insert("Derived".to_owned(), 0xDEAD_BEEF);
        let mut set = SchemaSet::new();
        let ids = unpack_type_table(&data, &hashes, &EnumOverrides::default(), &mut set).unwrap();
        let derived = set.class(ids[1]).unwrap();
        assert_eq!(derived.parent, Some(ids[0]));
        assert_eq!(derived.name_hash, Some(0xDEAD_BEEF));
    }
}
