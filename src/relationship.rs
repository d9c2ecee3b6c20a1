//! Declared bidirectional relationships between entity kinds.
//!
//! Relationships are declared once and enforced in one place, instead of
//! every UI component hand-rolling its own fix-up logic per entity pair.
//! After every successful commit the index diffs the relationship fields
//! that changed and patches the opposite side's cached record in place, so
//! both sides agree without a fresh fetch.
//!
//! Link values read from server payloads follow defaulting rules for the
//! deeply partial shapes CRM backends produce: `null`/absent means no
//! links, a string is an id, an object resolves through the owning
//! collection's id pointer, and an array may mix both.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::collection::RecordCollection;
use crate::error::{Result, StoreError};
use crate::record::Record;
use crate::store::RegistryMap;
use crate::{EntityKind, RecordId};

/// How many targets one source references.
///
/// `OneToOne`: the source field holds a single target id (e.g. an
/// organization's `parent`); the reverse field is maintained as an array of
/// source ids (the parent's `subsidiaries`).
///
/// `OneToMany`: the source field holds an array of target ids (e.g. a
/// contract's `lineItems`); the reverse field is a single source id (the
/// line item's `contract`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Cardinality {
    OneToOne,
    OneToMany,
}

/// A named, directed relationship between two entity kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipDef {
    pub name: String,
    pub source_kind: EntityKind,
    pub source_field: String,
    pub target_kind: EntityKind,
    pub target_field: String,
    pub cardinality: Cardinality,
}

impl RelationshipDef {
    /// A one-to-one relationship: scalar source field, array reverse field.
    pub fn one_to_one(
        name: impl Into<String>,
        source_kind: impl Into<EntityKind>,
        source_field: impl Into<String>,
        target_kind: impl Into<EntityKind>,
        target_field: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            source_kind: source_kind.into(),
            source_field: source_field.into(),
            target_kind: target_kind.into(),
            target_field: target_field.into(),
            cardinality: Cardinality::OneToOne,
        }
    }

    /// A one-to-many relationship: array source field, scalar reverse field.
    pub fn one_to_many(
        name: impl Into<String>,
        source_kind: impl Into<EntityKind>,
        source_field: impl Into<String>,
        target_kind: impl Into<EntityKind>,
        target_field: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            source_kind: source_kind.into(),
            source_field: source_field.into(),
            target_kind: target_kind.into(),
            target_field: target_field.into(),
            cardinality: Cardinality::OneToMany,
        }
    }
}

/// Registry of declared relationships.
#[derive(Debug, Clone, Default)]
pub struct RelationshipIndex {
    defs: Arc<DashMap<String, RelationshipDef>>,
}

impl RelationshipIndex {
    /// Register a relationship. Idempotent for an identical re-declaration;
    /// re-declaring a name with a different shape is an error.
    pub fn declare(&self, def: RelationshipDef) -> Result<()> {
        if let Some(existing) = self.defs.get(&def.name) {
            if *existing == def {
                return Ok(());
            }
            return Err(StoreError::RelationshipConflict {
                name: def.name.clone(),
            });
        }
        self.defs.insert(def.name.clone(), def);
        Ok(())
    }

    /// All declared relationships.
    pub fn defs(&self) -> Vec<RelationshipDef> {
        self.defs.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Diff a successful commit against every declared relationship
    /// touching `kind` and patch the opposite side in place. Removals are
    /// applied before additions, so a one-to-one reassignment detaches the
    /// old counterpart before attaching the new one and never leaves both
    /// attached at once.
    pub(crate) fn on_commit_success(
        &self,
        registry: &RegistryMap,
        kind: &str,
        id: &str,
        before: &Value,
        after: &Value,
    ) {
        for def in self.defs() {
            if def.source_kind == kind {
                self.apply_source_diff(registry, &def, id, before, after);
            }
            if def.target_kind == kind {
                self.apply_target_diff(registry, &def, id, before, after);
            }
        }
    }

    /// The committed record is a source; its forward field changed.
    fn apply_source_diff(
        &self,
        registry: &RegistryMap,
        def: &RelationshipDef,
        source_id: &str,
        before: &Value,
        after: &Value,
    ) {
        let targets = registry.get(&def.target_kind);
        let sources = registry.get(&def.source_kind);
        let before_ids = link_ids(targets, before.get(&def.source_field));
        let after_ids = link_ids(targets, after.get(&def.source_field));
        let removed: Vec<_> = before_ids
            .iter()
            .filter(|t| !after_ids.contains(*t))
            .cloned()
            .collect();
        let added: Vec<_> = after_ids
            .iter()
            .filter(|t| !before_ids.contains(*t))
            .cloned()
            .collect();
        if removed.is_empty() && added.is_empty() {
            return;
        }
        let Some(targets) = targets else {
            tracing::warn!(
                relationship = %def.name,
                kind = %def.target_kind,
                "target collection not registered, dropping patch"
            );
            return;
        };

        for target_id in &removed {
            let Some(target) = targets.get(target_id) else {
                drop_patch(&def.name, target_id);
                continue;
            };
            target.apply_derived_patch(|value| match def.cardinality {
                Cardinality::OneToOne => array_remove(value, &def.target_field, source_id, sources),
                Cardinality::OneToMany => {
                    scalar_clear_if(value, &def.target_field, source_id, sources)
                }
            });
        }

        for target_id in &added {
            let Some(target) = targets.get(target_id) else {
                drop_patch(&def.name, target_id);
                continue;
            };
            match def.cardinality {
                Cardinality::OneToOne => {
                    target.apply_derived_patch(|value| {
                        array_insert(value, &def.target_field, source_id, sources)
                    });
                }
                Cardinality::OneToMany => {
                    // The target may currently belong to another source;
                    // detach it there before claiming it.
                    let previous = scalar_link(&target.read(), &def.target_field, sources);
                    if let Some(previous) = previous.filter(|p| p.as_str() != source_id) {
                        if let Some(prev_source) = sources.and_then(|s| s.get(&previous)) {
                            prev_source.apply_derived_patch(|value| {
                                array_remove(value, &def.source_field, target_id, Some(targets))
                            });
                        }
                    }
                    target.apply_derived_patch(|value| {
                        scalar_set(value, &def.target_field, source_id)
                    });
                }
            }
        }
    }

    /// The committed record is a target; its reverse field changed.
    fn apply_target_diff(
        &self,
        registry: &RegistryMap,
        def: &RelationshipDef,
        target_id: &str,
        before: &Value,
        after: &Value,
    ) {
        let sources = registry.get(&def.source_kind);
        let targets = registry.get(&def.target_kind);
        let before_ids = link_ids(sources, before.get(&def.target_field));
        let after_ids = link_ids(sources, after.get(&def.target_field));
        let removed: Vec<_> = before_ids
            .iter()
            .filter(|s| !after_ids.contains(*s))
            .cloned()
            .collect();
        let added: Vec<_> = after_ids
            .iter()
            .filter(|s| !before_ids.contains(*s))
            .cloned()
            .collect();
        if removed.is_empty() && added.is_empty() {
            return;
        }
        let Some(sources) = sources else {
            tracing::warn!(
                relationship = %def.name,
                kind = %def.source_kind,
                "source collection not registered, dropping patch"
            );
            return;
        };

        for source_id in &removed {
            let Some(source) = sources.get(source_id) else {
                drop_patch(&def.name, source_id);
                continue;
            };
            source.apply_derived_patch(|value| match def.cardinality {
                Cardinality::OneToOne => {
                    scalar_clear_if(value, &def.source_field, target_id, targets)
                }
                Cardinality::OneToMany => array_remove(value, &def.source_field, target_id, targets),
            });
        }

        for source_id in &added {
            let Some(source) = sources.get(source_id) else {
                drop_patch(&def.name, source_id);
                continue;
            };
            match def.cardinality {
                Cardinality::OneToOne => {
                    // Single-parent rule: detach the source from its
                    // previous target before attaching it here.
                    let previous = scalar_link(&source.read(), &def.source_field, targets);
                    if let Some(previous) = previous.filter(|p| p.as_str() != target_id) {
                        if let Some(prev_target) = targets.and_then(|t| t.get(&previous)) {
                            prev_target.apply_derived_patch(|value| {
                                array_remove(value, &def.target_field, source_id, Some(sources))
                            });
                        }
                    }
                    source.apply_derived_patch(|value| {
                        scalar_set(value, &def.source_field, target_id)
                    });
                }
                Cardinality::OneToMany => {
                    source.apply_derived_patch(|value| {
                        array_insert(value, &def.source_field, target_id, targets)
                    });
                }
            }
        }
    }

    /// Remove every link referencing a deleted record.
    pub(crate) fn sever(&self, registry: &RegistryMap, kind: &str, id: &str) {
        for def in self.defs() {
            if def.target_kind == kind {
                if let Some(sources) = registry.get(&def.source_kind) {
                    let targets = registry.get(&def.target_kind);
                    for source in sources.to_array() {
                        if record_references(&source, &def.source_field, id, targets) {
                            source.apply_derived_patch(|value| match def.cardinality {
                                Cardinality::OneToOne => {
                                    scalar_clear_if(value, &def.source_field, id, targets)
                                }
                                Cardinality::OneToMany => {
                                    array_remove(value, &def.source_field, id, targets)
                                }
                            });
                        }
                    }
                }
            }
            if def.source_kind == kind {
                if let Some(targets) = registry.get(&def.target_kind) {
                    let sources = registry.get(&def.source_kind);
                    for target in targets.to_array() {
                        if record_references(&target, &def.target_field, id, sources) {
                            target.apply_derived_patch(|value| match def.cardinality {
                                Cardinality::OneToOne => {
                                    array_remove(value, &def.target_field, id, sources)
                                }
                                Cardinality::OneToMany => {
                                    scalar_clear_if(value, &def.target_field, id, sources)
                                }
                            });
                        }
                    }
                }
            }
        }
        tracing::debug!(kind = %kind, id = %id, "severed relationships");
    }

    /// Rewrite every occurrence of a temporary id to the server-assigned
    /// one, across all declared relationships where `kind` participates.
    pub(crate) fn rewrite_temporary_id(
        &self,
        registry: &RegistryMap,
        kind: &str,
        temp_id: &str,
        real_id: &str,
    ) {
        for def in self.defs() {
            if def.target_kind == kind {
                if let Some(sources) = registry.get(&def.source_kind) {
                    let targets = registry.get(&def.target_kind);
                    for source in sources.to_array() {
                        if record_references(&source, &def.source_field, temp_id, targets) {
                            source.apply_derived_patch(|value| {
                                replace_link(value, &def.source_field, temp_id, real_id, targets)
                            });
                        }
                    }
                }
            }
            if def.source_kind == kind {
                if let Some(targets) = registry.get(&def.target_kind) {
                    let sources = registry.get(&def.source_kind);
                    for target in targets.to_array() {
                        if record_references(&target, &def.target_field, temp_id, sources) {
                            target.apply_derived_patch(|value| {
                                replace_link(value, &def.target_field, temp_id, real_id, sources)
                            });
                        }
                    }
                }
            }
        }
    }
}

fn drop_patch(relationship: &str, missing_id: &str) {
    tracing::warn!(
        relationship = %relationship,
        record = %missing_id,
        "patch target missing, dropping relationship patch"
    );
}

/// Resolve one link value to an id: strings are ids, objects resolve
/// through the linked collection's id pointer.
fn resolve_one(resolver: Option<&RecordCollection>, value: &Value) -> Option<RecordId> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(_) => resolver.and_then(|collection| collection.id_of(value)),
        _ => None,
    }
}

/// All link ids inside a relationship field value.
fn link_ids(resolver: Option<&RecordCollection>, value: Option<&Value>) -> Vec<RecordId> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| resolve_one(resolver, item))
            .collect(),
        Some(other) => resolve_one(resolver, other).into_iter().collect(),
    }
}

fn scalar_link(root: &Value, field: &str, resolver: Option<&RecordCollection>) -> Option<RecordId> {
    link_ids(resolver, root.get(field)).into_iter().next()
}

fn record_references(
    record: &Record,
    field: &str,
    id: &str,
    resolver: Option<&RecordCollection>,
) -> bool {
    let in_draft = link_ids(resolver, record.read().get(field))
        .iter()
        .any(|link| link.as_str() == id);
    in_draft
        || link_ids(resolver, record.server_value().get(field))
            .iter()
            .any(|link| link.as_str() == id)
}

fn set_field(root: &mut Value, field: &str, value: Value) {
    if let Some(object) = root.as_object_mut() {
        object.insert(field.to_string(), value);
    }
}

/// Insert `id` into an array-shaped field exactly once, normalizing the
/// field to an array of link values.
fn array_insert(root: &mut Value, field: &str, id: &str, resolver: Option<&RecordCollection>) {
    let mut items = match root.get(field) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(existing)) => existing.clone(),
        Some(other) => vec![other.clone()],
    };
    if !items
        .iter()
        .any(|item| resolve_one(resolver, item).as_deref() == Some(id))
    {
        items.push(Value::String(id.to_string()));
    }
    set_field(root, field, Value::Array(items));
}

/// Remove `id` from an array-shaped field, keeping other elements (embedded
/// objects included) untouched.
fn array_remove(root: &mut Value, field: &str, id: &str, resolver: Option<&RecordCollection>) {
    let items = match root.get(field) {
        None | Some(Value::Null) => return,
        Some(Value::Array(existing)) => existing.clone(),
        Some(other) => vec![other.clone()],
    };
    let filtered: Vec<Value> = items
        .into_iter()
        .filter(|item| resolve_one(resolver, item).as_deref() != Some(id))
        .collect();
    set_field(root, field, Value::Array(filtered));
}

fn scalar_set(root: &mut Value, field: &str, id: &str) {
    set_field(root, field, Value::String(id.to_string()));
}

fn scalar_clear_if(root: &mut Value, field: &str, id: &str, resolver: Option<&RecordCollection>) {
    if scalar_link(root, field, resolver).as_deref() == Some(id) {
        set_field(root, field, Value::Null);
    }
}

/// Replace `old` with `new` wherever it appears in a link field, preserving
/// the field's shape.
fn replace_link(
    root: &mut Value,
    field: &str,
    old: &str,
    new: &str,
    resolver: Option<&RecordCollection>,
) {
    let replaced = match root.get(field) {
        None | Some(Value::Null) => return,
        Some(Value::Array(items)) => Value::Array(
            items
                .iter()
                .map(|item| {
                    if resolve_one(resolver, item).as_deref() == Some(old) {
                        Value::String(new.to_string())
                    } else {
                        item.clone()
                    }
                })
                .collect(),
        ),
        Some(other) => {
            if resolve_one(resolver, other).as_deref() == Some(old) {
                Value::String(new.to_string())
            } else {
                return;
            }
        }
    };
    set_field(root, field, replaced);
}
