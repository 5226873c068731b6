//! Enum-identity overrides for legacy type sections.
//!
//! A handful of legacy files declare enum members without naming the enum
//! they store (the identity was compiled out). The assumed identities are
//! data shipped alongside the schema set, a short (class, member) to enum
//! name list loadable from JSON, never logic inside the type-table
//! unpacker.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnumOverride {
    pub class: String,
    pub member: String,
    pub enum_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnumOverrides {
    pub entries: Vec<EnumOverride>,
}

impl EnumOverrides {
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn lookup(&self, class: &str, member: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.class == class && e.member == member)
            .map(|e| e.enum_name.as_str())
    }
}
