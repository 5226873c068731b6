//! Type descriptor model: the schema of a wire type and its relationships
//! to other types, independent of which wire format is being read or
//! written.
//!
//! Wire types are a closed tagged union ([`WireType`]): parametrized
//! wrappers such as "array of X" or "pointer to X" carry their element
//! type as data instead of being synthesized nominal types. Class
//! descriptors live in an append-only arena ([`SchemaSet`]) with stable
//! [`ClassId`] indices; a member that must reference the class currently
//! being defined, or a sibling that has not been scanned yet, reserves an
//! id up front and the reference becomes valid once the whole set has
//! finished loading.
//!
//! Descriptors are immutable once built and are safely shared across
//! concurrent pack/unpack operations.

pub mod overrides;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::SchemaError;

/// Stable index of a [`Class`] inside its [`SchemaSet`] arena.
pub type ClassId = usize;

// ── Primitives ───────────────────────────────────────────────────────────────

/// Fixed-width scalar encodings.
///
/// `ULong` is the pointer-sized unsigned integer: 8 bytes in the tagged
/// format, pointer-width in the packed format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    Void,
    Bool,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    ULong,
    Float32,
    Float64,
    Half,
}

impl Primitive {
    /// Encoded width in bytes. `ptr_bytes` supplies the platform pointer
    /// width used by `ULong` in the packed format.
    pub fn byte_size(self, ptr_bytes: usize) -> usize {
        match self {
            Primitive::Void => 0,
            Primitive::Bool | Primitive::Int8 | Primitive::UInt8 => 1,
            Primitive::Int16 | Primitive::UInt16 | Primitive::Half => 2,
            Primitive::Int32 | Primitive::UInt32 | Primitive::Float32 => 4,
            Primitive::Int64 | Primitive::UInt64 | Primitive::Float64 => 8,
            Primitive::ULong => ptr_bytes,
        }
    }

    pub fn alignment(self, ptr_bytes: usize) -> usize {
        self.byte_size(ptr_bytes).max(1)
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            Primitive::Int8 | Primitive::Int16 | Primitive::Int32 | Primitive::Int64
        )
    }

    /// Storage primitive for a reconstructed enum, selected by the
    /// type-table width code: 0..=3 for 8/16/32/64-bit storage (byte size
    /// and alignment 1/2/4/8). Any other code is malformed input.
    pub fn enum_storage(width_code: u8) -> Option<Primitive> {
        Some(match width_code {
            0 => Primitive::UInt8,
            1 => Primitive::UInt16,
            2 => Primitive::UInt32,
            3 => Primitive::UInt64,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Primitive::Void => "void",
            Primitive::Bool => "bool",
            Primitive::Int8 => "int8",
            Primitive::UInt8 => "uint8",
            Primitive::Int16 => "int16",
            Primitive::UInt16 => "uint16",
            Primitive::Int32 => "int32",
            Primitive::UInt32 => "uint32",
            Primitive::Int64 => "int64",
            Primitive::UInt64 => "uint64",
            Primitive::ULong => "ulong",
            Primitive::Float32 => "float32",
            Primitive::Float64 => "float64",
            Primitive::Half => "half",
        }
    }
}

// ── Enum identity ────────────────────────────────────────────────────────────

/// One name-to-integer binding of an enum table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumItem {
    pub name: String,
    pub value: i64,
}

/// Logical enum identity: a named value table. The identity is metadata
/// only; the bit pattern on the wire is the storage primitive's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumDef {
    pub name: String,
    pub items: Vec<EnumItem>,
}

impl EnumDef {
    pub fn new(name: &str, items: &[(&str, i64)]) -> Arc<EnumDef> {
        Arc::new(EnumDef {
            name: name.to_owned(),
            items: items
                .iter()
                .map(|(n, v)| EnumItem {
                    name: (*n).to_owned(),
                    value: *v,
                })
                .collect(),
        })
    }

    /// Identity-only enum with no value table, used when a legacy type
    /// section names an enum whose table lives elsewhere.
    pub fn opaque(name: &str) -> Arc<EnumDef> {
        Arc::new(EnumDef {
            name: name.to_owned(),
            items: Vec::new(),
        })
    }
}

// ── Wire types ───────────────────────────────────────────────────────────────

/// Category tag of a [`WireType`]. Mutually exclusive, never combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireCategory {
    Primitive,
    String,
    Enum,
    Flags,
    FixedStruct,
    Pointer,
    Variant,
    BackRef,
    RelArray,
    Array,
    Class,
}

impl fmt::Display for WireCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WireCategory::Primitive => "primitive",
            WireCategory::String => "string",
            WireCategory::Enum => "enum",
            WireCategory::Flags => "flags",
            WireCategory::FixedStruct => "fixed-struct",
            WireCategory::Pointer => "pointer",
            WireCategory::Variant => "variant",
            WireCategory::BackRef => "back-reference",
            WireCategory::RelArray => "relative-array",
            WireCategory::Array => "array",
            WireCategory::Class => "class",
        };
        f.write_str(s)
    }
}

/// Schema-level description of how a value is encoded.
#[derive(Debug, Clone, PartialEq)]
pub enum WireType {
    Primitive(Primitive),
    /// Item-backed byte string in the fixed legacy text encoding.
    Str,
    Enum {
        storage: Primitive,
        def: Arc<EnumDef>,
    },
    Flags {
        storage: Primitive,
        def: Arc<EnumDef>,
    },
    /// N tightly-packed inline instances of the element type. Never has an
    /// item of its own.
    FixedStruct {
        elem: Box<WireType>,
        count: u8,
    },
    /// Owning pointer, polymorphic by the referenced item's runtime type.
    RawPointer(Box<WireType>),
    /// Ref-counted pointer; `points_to` is the template name retained for
    /// schema regeneration.
    RefPointer {
        target: Box<WireType>,
        points_to: Option<String>,
    },
    /// Pointer to an arbitrary concrete class resolved at decode time from
    /// a sibling class-name field.
    VariantPointer,
    /// Weak, non-owning reference back toward an ancestor in the same
    /// graph. Never the unique owner.
    BackRefPointer(Box<WireType>),
    /// Array whose element data is jump-offset addressed.
    RelArray(Box<WireType>),
    /// Variable-length, item-backed sequence.
    Array(Box<WireType>),
    Class(ClassId),
}

impl WireType {
    pub fn raw_pointer(target: WireType) -> WireType {
        WireType::RawPointer(Box::new(target))
    }

    pub fn ref_pointer(target: WireType, points_to: Option<&str>) -> WireType {
        WireType::RefPointer {
            target: Box::new(target),
            points_to: points_to.map(str::to_owned),
        }
    }

    pub fn back_ref(target: WireType) -> WireType {
        WireType::BackRefPointer(Box::new(target))
    }

    pub fn array(elem: WireType) -> WireType {
        WireType::Array(Box::new(elem))
    }

    pub fn rel_array(elem: WireType) -> WireType {
        WireType::RelArray(Box::new(elem))
    }

    /// Fixed-struct constructor; the element count must fit one byte.
    pub fn fixed_struct(elem: WireType, count: usize) -> Result<WireType, SchemaError> {
        if count > 255 {
            return Err(SchemaError::FixedStructTooLong(count));
        }
        Ok(WireType::FixedStruct {
            elem: Box::new(elem),
            count: count as u8,
        })
    }

    /// Pure category lookup.
    pub fn category(&self) -> WireCategory {
        match self {
            WireType::Primitive(_) => WireCategory::Primitive,
            WireType::Str => WireCategory::String,
            WireType::Enum { .. } => WireCategory::Enum,
            WireType::Flags { .. } => WireCategory::Flags,
            WireType::FixedStruct { .. } => WireCategory::FixedStruct,
            WireType::RawPointer(_) | WireType::RefPointer { .. } => WireCategory::Pointer,
            WireType::VariantPointer => WireCategory::Variant,
            WireType::BackRefPointer(_) => WireCategory::BackRef,
            WireType::RelArray(_) => WireCategory::RelArray,
            WireType::Array(_) => WireCategory::Array,
            WireType::Class(_) => WireCategory::Class,
        }
    }

    /// Target type of a pointer or array wrapper. Valid only for the
    /// pointer/array categories.
    pub fn pointee(&self) -> Result<&WireType, SchemaError> {
        match self {
            WireType::RawPointer(t)
            | WireType::RefPointer { target: t, .. }
            | WireType::BackRefPointer(t)
            | WireType::RelArray(t)
            | WireType::Array(t) => Ok(t),
            other => Err(SchemaError::NotAPointer(format!("{}", other.category()))),
        }
    }

    /// Dedup/display key used by the type-graph generator: wrapper
    /// instances collapse to one entry per (wrapper, element) pairing.
    pub fn display_name(&self, schemas: &SchemaSet) -> Result<String, SchemaError> {
        Ok(match self {
            WireType::Primitive(p) => p.name().to_owned(),
            WireType::Str => "string".to_owned(),
            WireType::Enum { storage, def } => {
                format!("Enum<{}, {}>", def.name, storage.name())
            }
            WireType::Flags { storage, def } => {
                format!("Flags<{}, {}>", def.name, storage.name())
            }
            WireType::FixedStruct { elem, count } => {
                format!("FixedStruct<{}, {}>", elem.display_name(schemas)?, count)
            }
            WireType::RawPointer(t) => format!("Ptr<{}>", t.display_name(schemas)?),
            WireType::RefPointer { target, .. } => {
                format!("RefPtr<{}>", target.display_name(schemas)?)
            }
            WireType::VariantPointer => "Variant".to_owned(),
            WireType::BackRefPointer(t) => format!("Ptr<{}>", t.display_name(schemas)?),
            WireType::RelArray(t) => format!("RelArray<{}>", t.display_name(schemas)?),
            WireType::Array(t) => format!("Array<{}>", t.display_name(schemas)?),
            WireType::Class(id) => schemas.class(*id)?.name.clone(),
        })
    }
}

// ── Members ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemberFlags {
    pub not_serializable: bool,
    pub protected: bool,
    pub private: bool,
}

impl MemberFlags {
    pub const SERIALIZABLE: MemberFlags = MemberFlags {
        not_serializable: false,
        protected: false,
        private: false,
    };

    pub fn from_bits(bits: u8) -> MemberFlags {
        MemberFlags {
            not_serializable: bits & 0x01 != 0,
            protected: bits & 0x02 != 0,
            private: bits & 0x04 != 0,
        }
    }

    pub fn bits(self) -> u8 {
        (self.not_serializable as u8) | (self.protected as u8) << 1 | (self.private as u8) << 2
    }
}

/// One field of a [`Class`]. Offset is relative to the start of the owning
/// instance.
#[derive(Debug, Clone)]
pub struct Member {
    pub name: String,
    pub offset: u32,
    pub ty: WireType,
    pub flags: MemberFlags,
}

impl Member {
    pub fn new(name: &str, offset: u32, ty: WireType) -> Member {
        Member {
            name: name.to_owned(),
            offset,
            ty,
            flags: MemberFlags::SERIALIZABLE,
        }
    }
}

/// Template parameter of a class: either a type argument or an integral
/// value argument.
#[derive(Debug, Clone)]
pub enum Template {
    Type { name: String, ty: WireType },
    Value { name: String, value: i64 },
}

// ── Class descriptors ────────────────────────────────────────────────────────

/// Named aggregate with an ordered member list and optional single parent.
/// Members are append-only; once the class is registered it never changes.
#[derive(Debug, Clone)]
pub struct Class {
    pub name: String,
    pub parent: Option<ClassId>,
    pub size: u32,
    pub alignment: u32,
    pub version: u32,
    pub abstract_value: Option<u32>,
    pub name_hash: Option<u32>,
    pub members: Vec<Member>,
    pub interfaces: Vec<ClassId>,
    pub templates: Vec<Template>,
    /// Enum tables declared locally by this class. Retained only for
    /// byte-perfect regeneration of legacy type sections.
    pub local_enums: Vec<Arc<EnumDef>>,
}

impl Class {
    pub fn new(name: &str, size: u32) -> Class {
        Class {
            name: name.to_owned(),
            parent: None,
            size,
            alignment: 4,
            version: 0,
            abstract_value: None,
            name_hash: None,
            members: Vec::new(),
            interfaces: Vec::new(),
            templates: Vec::new(),
            local_enums: Vec::new(),
        }
    }
}

// ── Schema set ───────────────────────────────────────────────────────────────

/// Append-only arena of class descriptors plus the name registry used for
/// named-variant resolution and forward-reference fixup.
///
/// `reserve` hands out an id for a name before its class exists; `define`
/// fills the slot. [`SchemaSet::ensure_resolved`] verifies no reservation
/// was left dangling once a whole schema set has loaded.
#[derive(Debug, Default)]
pub struct SchemaSet {
    classes: Vec<Option<Class>>,
    by_name: HashMap<String, ClassId>,
    base_object: Option<ClassId>,
}

impl SchemaSet {
    pub fn new() -> SchemaSet {
        SchemaSet::default()
    }

    /// Id for `name`, reserving an empty arena slot if the class has not
    /// been defined yet.
    pub fn reserve(&mut self, name: &str) -> ClassId {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let id = self.classes.len();
        self.classes.push(None);
        self.by_name.insert(name.to_owned(), id);
        id
    }

    /// Register a class, filling its reserved slot if one exists.
    pub fn define(&mut self, class: Class) -> Result<ClassId, SchemaError> {
        let id = self.reserve(&class.name);
        if self.classes[id].is_some() {
            return Err(SchemaError::DuplicateTypeName(class.name));
        }
        self.classes[id] = Some(class);
        Ok(id)
    }

    pub fn lookup(&self, name: &str) -> Option<ClassId> {
        self.by_name.get(name).copied()
    }

    pub fn class(&self, id: ClassId) -> Result<&Class, SchemaError> {
        match self.classes.get(id) {
            Some(Some(c)) => Ok(c),
            _ => {
                let name = self
                    .by_name
                    .iter()
                    .find(|(_, &v)| v == id)
                    .map(|(k, _)| k.clone())
                    .unwrap_or_else(|| format!("#{id}"));
                Err(SchemaError::UnresolvedForwardType(name))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Fails if any reserved slot was never defined.
    pub fn ensure_resolved(&self) -> Result<(), SchemaError> {
        for (name, &id) in &self.by_name {
            if self.classes[id].is_none() {
                return Err(SchemaError::UnresolvedForwardType(name.clone()));
            }
        }
        Ok(())
    }

    /// Mark the "base object" lineage root whose descendants carry the
    /// packed format's virtual-table padding slot.
    pub fn set_base_object(&mut self, name: &str) -> ClassId {
        let id = self.reserve(name);
        self.base_object = Some(id);
        id
    }

    pub fn base_object(&self) -> Option<ClassId> {
        self.base_object
    }

    /// Parent's effective members first, then this class's own, in
    /// declaration order. Fails if the parent chain does not terminate.
    pub fn effective_members(&self, id: ClassId) -> Result<Vec<&Member>, SchemaError> {
        let mut chain = Vec::new();
        let mut cursor = Some(id);
        while let Some(cid) = cursor {
            if chain.len() > self.classes.len() {
                return Err(SchemaError::CyclicInheritance(self.class(id)?.name.clone()));
            }
            let class = self.class(cid)?;
            chain.push(class);
            cursor = class.parent;
        }
        let mut members = Vec::new();
        for class in chain.iter().rev() {
            members.extend(class.members.iter());
        }
        Ok(members)
    }

    /// True when `child` is `ancestor` or a descendant of it.
    pub fn is_subtype(&self, child: ClassId, ancestor: ClassId) -> Result<bool, SchemaError> {
        let mut cursor = Some(child);
        let mut steps = 0usize;
        while let Some(cid) = cursor {
            if cid == ancestor {
                return Ok(true);
            }
            steps += 1;
            if steps > self.classes.len() {
                return Err(SchemaError::CyclicInheritance(
                    self.class(child)?.name.clone(),
                ));
            }
            cursor = self.class(cid)?.parent;
        }
        Ok(false)
    }

    /// True when `id` inherits (directly or transitively) from the base
    /// object marker class.
    pub fn derives_base_object(&self, id: ClassId) -> Result<bool, SchemaError> {
        match self.base_object {
            Some(base) => self.is_subtype(id, base),
            None => Ok(false),
        }
    }

    /// Named-variant shape: the first three effective members are a name
    /// string, a class-name string, and a variant pointer. This is the one
    /// place where decoding is schema-name-driven rather than structural.
    pub fn is_named_variant(&self, id: ClassId) -> Result<bool, SchemaError> {
        let members = self.effective_members(id)?;
        Ok(members.len() >= 3
            && members[0].ty == WireType::Str
            && members[1].ty == WireType::Str
            && members[2].ty == WireType::VariantPointer)
    }
}
