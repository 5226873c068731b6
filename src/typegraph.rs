//! Type-graph generation: the closure of every type reachable from a set
//! of root classes, flattened into one named entry list.
//!
//! Exporters embed this list so a consumer can rebuild the schema set
//! without the original headers. Wrapper types (pointers, arrays, enums)
//! do not exist as nominal classes in the schema arena, so the generator
//! synthesizes one entry per distinct wrapper instance, keyed by its
//! display name; two wrappers over the same element collapse to a single
//! entry. Container entries additionally pull in the engine's shared heap
//! allocator class, which every serialized container references.
//!
//! Traversal is breadth-first from the roots and the output order is a
//! pure function of the schema set and root list, so regenerating the
//! graph for an unchanged schema produces byte-identical output.

use std::collections::{HashMap, VecDeque};

use log::debug;

use crate::error::SchemaError;
use crate::schema::{ClassId, SchemaSet, Template, WireType};

/// Name of the synthesized allocator entry referenced by every container.
pub const CONTAINER_ALLOCATOR: &str = "ContainerHeapAllocator";

/// One node of the generated graph.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphEntry {
    /// A class from the schema arena.
    Class(ClassId),
    /// A synthesized wrapper type with no arena presence.
    Synthetic(WireType),
    /// The shared container allocator.
    Allocator,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeGraphEntry {
    pub name: String,
    pub entry: GraphEntry,
}

enum Work {
    Class(ClassId),
    Synthetic(WireType),
    Allocator,
}

/// Generate the reachable-type closure of `roots`.
///
/// Fails with [`SchemaError::DuplicateTypeName`] when a class's name
/// collides with a synthesized wrapper entry (or the allocator), since the
/// emitted list must be unambiguous by name.
pub fn generate(
    schemas: &SchemaSet,
    roots: &[ClassId],
) -> Result<Vec<TypeGraphEntry>, SchemaError> {
    let mut out = Vec::new();
    let mut recorded: HashMap<String, GraphEntry> = HashMap::new();
    let mut queue: VecDeque<Work> = roots.iter().map(|&id| Work::Class(id)).collect();

    while let Some(work) = queue.pop_front() {
        match work {
            Work::Class(cid) => {
                let class = schemas.class(cid)?;
                if !record(&mut recorded, &mut out, &class.name, GraphEntry::Class(cid))? {
                    continue;
                }
                if let Some(parent) = class.parent {
                    queue.push_back(Work::Class(parent));
                }
                for &iface in &class.interfaces {
                    queue.push_back(Work::Class(iface));
                }
                for template in &class.templates {
                    if let Template::Type { ty, .. } = template {
                        queue.push_back(type_work(ty));
                    }
                }
                for member in &class.members {
                    queue.push_back(type_work(&member.ty));
                }
            }
            Work::Synthetic(ty) => {
                let name = ty.display_name(schemas)?;
                if !record(
                    &mut recorded,
                    &mut out,
                    &name,
                    GraphEntry::Synthetic(ty.clone()),
                )? {
                    continue;
                }
                match &ty {
                    WireType::Array(elem) | WireType::RelArray(elem) => {
                        // Container storage is addressed through an owning
                        // pointer and allocated by the shared allocator.
                        queue.push_back(Work::Synthetic(WireType::raw_pointer(
                            elem.as_ref().clone(),
                        )));
                        queue.push_back(Work::Allocator);
                        queue.push_back(type_work(elem));
                    }
                    WireType::RawPointer(t)
                    | WireType::RefPointer { target: t, .. }
                    | WireType::BackRefPointer(t) => {
                        queue.push_back(type_work(t));
                    }
                    WireType::Enum { storage, .. } | WireType::Flags { storage, .. } => {
                        queue.push_back(Work::Synthetic(WireType::Primitive(*storage)));
                    }
                    WireType::FixedStruct { elem, .. } => {
                        queue.push_back(type_work(elem));
                    }
                    _ => {}
                }
            }
            Work::Allocator => {
                record(
                    &mut recorded,
                    &mut out,
                    CONTAINER_ALLOCATOR,
                    GraphEntry::Allocator,
                )?;
            }
        }
    }
    debug!("type graph: {} entries from {} roots", out.len(), roots.len());
    Ok(out)
}

fn type_work(ty: &WireType) -> Work {
    match ty {
        WireType::Class(id) => Work::Class(*id),
        other => Work::Synthetic(other.clone()),
    }
}

/// Record `entry` under `name`. Returns false when the name already holds
/// a compatible entry; errors when it is taken by a different kind.
///
/// Synthetic entries are identified by name alone: owning and
/// back-reference pointers over one element share a display name and must
/// collapse, not collide.
fn record(
    recorded: &mut HashMap<String, GraphEntry>,
    out: &mut Vec<TypeGraphEntry>,
    name: &str,
    entry: GraphEntry,
) -> Result<bool, SchemaError> {
    match (recorded.get(name), &entry) {
        (Some(GraphEntry::Class(a)), GraphEntry::Class(b)) if a == b => Ok(false),
        (Some(GraphEntry::Synthetic(_)), GraphEntry::Synthetic(_)) => Ok(false),
        (Some(GraphEntry::Allocator), GraphEntry::Allocator) => Ok(false),
        (Some(_), _) => Err(SchemaError::DuplicateTypeName(name.to_owned())),
        (None, _) => {
            recorded.insert(name.to_owned(), entry.clone());
            out.push(TypeGraphEntry {
                name: name.to_owned(),
                entry,
            });
            Ok(true)
        }
    }
}
