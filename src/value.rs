//! Runtime value model emitted and consumed by both codecs.
//!
//! Objects, arrays and strings are `Rc`-shared: a blob that references one
//! logical object from several places decodes to several handles on the
//! same allocation, and packing dedups by that same handle identity (see
//! [`ValueKey`]). Blob processing is single-threaded, so `Rc`/`RefCell`
//! is the right sharing primitive here.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::schema::ClassId;

/// Shared handle to a decoded class instance.
pub type ObjRef = Rc<RefCell<Object>>;
/// Shared handle to a decoded sequence.
pub type ArrRef = Rc<RefCell<Vec<Value>>>;

/// Decoded class instance: runtime class plus named fields.
#[derive(Debug, Default)]
pub struct Object {
    pub class: ClassId,
    pub fields: HashMap<String, Value>,
}

impl Object {
    pub fn new(class: ClassId) -> ObjRef {
        Rc::new(RefCell::new(Object {
            class,
            fields: HashMap::new(),
        }))
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn set(&mut self, name: &str, value: Value) {
        self.fields.insert(name.to_owned(), value);
    }
}

/// One decoded value.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    F32(f32),
    F64(f64),
    /// Raw half-float bits; never converted by the codec.
    Half(u16),
    Str(Rc<str>),
    /// Inline fixed-struct contents. Never item-backed.
    Tuple(Vec<Value>),
    Array(ArrRef),
    Object(ObjRef),
}

impl Value {
    pub fn string(s: &str) -> Value {
        Value::Str(Rc::from(s))
    }

    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    pub fn as_object(&self) -> Option<&ObjRef> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrRef> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// Structural equality. Follows shared handles into their contents, so it
/// must not be used on graphs containing back-reference cycles.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::UInt(a), Value::UInt(b)) => a == b,
            (Value::F32(a), Value::F32(b)) => a.to_bits() == b.to_bits(),
            (Value::F64(a), Value::F64(b)) => a.to_bits() == b.to_bits(),
            (Value::Half(a), Value::Half(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow()
            }
            (Value::Object(a), Value::Object(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.class == b.class && a.fields == b.fields
            }
            _ => false,
        }
    }
}

// ── Identity keys ────────────────────────────────────────────────────────────

/// Identity of an in-memory value, used by both packers to guarantee that
/// one shared object produces exactly one item/entry per blob. Keyed on
/// the allocation, not the content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKey {
    Object(*const RefCell<Object>),
    Array(*const RefCell<Vec<Value>>),
    Str(*const u8),
}

impl ValueKey {
    /// Identity of `value`, if its category is item-backed.
    pub fn of(value: &Value) -> Option<ValueKey> {
        match value {
            Value::Object(o) => Some(ValueKey::Object(Rc::as_ptr(o))),
            Value::Array(a) => Some(ValueKey::Array(Rc::as_ptr(a))),
            Value::Str(s) => Some(ValueKey::Str(s.as_ptr())),
            _ => None,
        }
    }
}
