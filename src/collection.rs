//! Collections: keyed containers of records for one entity kind.
//!
//! A collection owns the records of a single kind and keeps a separate
//! insertion-order index so default iteration is stable. Hydration upserts
//! server pages without ever deleting locally-known records; pages are
//! partial views, not the source of truth for deletion.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use crate::record::{Record, TEMP_ID_PREFIX};
use crate::scheduler::MutationScheduler;
use crate::{EntityKind, RecordId};

/// Declaration of one entity kind for [`crate::Store::new`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSpec {
    /// Kind name, e.g. `"organizations"`.
    pub kind: EntityKind,
    /// JSON pointer locating the id inside a server payload,
    /// e.g. `"/metadata/id"`.
    pub id_pointer: String,
}

impl CollectionSpec {
    /// A spec with the default id pointer `"/id"`.
    pub fn new(kind: impl Into<EntityKind>) -> Self {
        Self {
            kind: kind.into(),
            id_pointer: "/id".to_string(),
        }
    }

    /// Override where ids live inside payloads of this kind.
    pub fn with_id_pointer(mut self, pointer: impl Into<String>) -> Self {
        self.id_pointer = pointer.into();
        self
    }
}

struct CollectionInner {
    kind: EntityKind,
    id_pointer: String,
    entries: DashMap<RecordId, Record>,
    order: RwLock<Vec<RecordId>>,
    scheduler: MutationScheduler,
}

/// Shared handle to the records of one entity kind.
#[derive(Clone)]
pub struct RecordCollection {
    inner: Arc<CollectionInner>,
}

impl fmt::Debug for RecordCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordCollection")
            .field("kind", &self.inner.kind)
            .field("len", &self.inner.entries.len())
            .finish()
    }
}

impl RecordCollection {
    pub(crate) fn new(spec: CollectionSpec, scheduler: MutationScheduler) -> Self {
        Self {
            inner: Arc::new(CollectionInner {
                kind: spec.kind,
                id_pointer: spec.id_pointer,
                entries: DashMap::new(),
                order: RwLock::new(Vec::new()),
                scheduler,
            }),
        }
    }

    /// The entity kind this collection holds.
    pub fn kind(&self) -> &EntityKind {
        &self.inner.kind
    }

    /// Extract the id from a server payload via this kind's id pointer.
    pub(crate) fn id_of(&self, payload: &Value) -> Option<RecordId> {
        payload
            .pointer(&self.inner.id_pointer)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Get a record by id.
    pub fn get(&self, id: &str) -> Option<Record> {
        self.inner.entries.get(id).map(|entry| entry.value().clone())
    }

    /// Get a record, inserting a fresh clean one seeded with `default` if
    /// absent.
    pub fn get_or_create(&self, id: impl Into<RecordId>, default: Value) -> Record {
        let id = id.into();
        let mut created = false;
        let record = self
            .inner
            .entries
            .entry(id.clone())
            .or_insert_with(|| {
                created = true;
                Record::new(
                    self.inner.kind.clone(),
                    id.clone(),
                    default,
                    self.inner.scheduler.clone(),
                )
            })
            .value()
            .clone();
        if created {
            self.push_order(id);
        }
        record
    }

    /// Create a record with a client-generated temporary id for optimistic
    /// creation flows. The id is rewritten in place once the server
    /// confirms the create.
    pub fn create_temporary(&self, default: Value) -> Record {
        let id = format!("{}{}", TEMP_ID_PREFIX, Uuid::new_v4());
        let record = Record::new(
            self.inner.kind.clone(),
            id.clone(),
            default,
            self.inner.scheduler.clone(),
        );
        self.inner.entries.insert(id.clone(), record.clone());
        self.push_order(id);
        record
    }

    /// Upsert a page of server entities: existing records get a server
    /// update, unknown ones are inserted clean. Records absent from the
    /// page are never deleted. Returns the number of records touched.
    pub fn hydrate(&self, page: Vec<Value>) -> usize {
        let mut touched = 0;
        for item in page {
            let Some(id) = self.id_of(&item) else {
                tracing::warn!(
                    kind = %self.inner.kind,
                    pointer = %self.inner.id_pointer,
                    "skipping hydrated item without an id"
                );
                continue;
            };
            if let Some(record) = self.get(&id) {
                record.apply_server_update(item);
            } else {
                let record = Record::new(
                    self.inner.kind.clone(),
                    id.clone(),
                    item,
                    self.inner.scheduler.clone(),
                );
                self.inner.entries.insert(id.clone(), record);
                self.push_order(id);
            }
            touched += 1;
        }
        tracing::debug!(kind = %self.inner.kind, touched, "hydrated page");
        touched
    }

    /// Delete a record and sever every declared relationship pointing at
    /// it. A queued (not in-flight) write for the record is dropped.
    pub fn remove(&self, id: &str) -> Option<Record> {
        let removed = self.inner.entries.remove(id).map(|(_, record)| record);
        if removed.is_some() {
            self.order_mut().retain(|entry| entry != id);
            self.inner.scheduler.cancel(&self.inner.kind, id);
            self.inner.scheduler.sever(&self.inner.kind, id);
        }
        removed
    }

    /// All records in stable insertion order.
    pub fn to_array(&self) -> Vec<Record> {
        let ids = self.order_snapshot();
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    /// Number of resident records.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    /// Whether the collection holds no records.
    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Whether a record with this id is resident.
    pub fn contains(&self, id: &str) -> bool {
        self.inner.entries.contains_key(id)
    }

    /// Move a record from a temporary id to its server-assigned id,
    /// preserving its position in the iteration order. Returns false when
    /// no record is resident under `old_id`.
    pub(crate) fn rekey(&self, old_id: &str, new_id: &str) -> bool {
        let Some((_, record)) = self.inner.entries.remove(old_id) else {
            return false;
        };
        record.set_id(new_id.to_string());
        self.inner.entries.insert(new_id.to_string(), record);
        let mut order = self.order_mut();
        if let Some(slot) = order.iter_mut().find(|entry| *entry == old_id) {
            *slot = new_id.to_string();
        }
        true
    }

    fn push_order(&self, id: RecordId) {
        self.order_mut().push(id);
    }

    fn order_mut(&self) -> std::sync::RwLockWriteGuard<'_, Vec<RecordId>> {
        self.inner
            .order
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn order_snapshot(&self) -> Vec<RecordId> {
        self.inner
            .order
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::error::{FetchError, WriteError};
    use crate::relationship::RelationshipIndex;
    use crate::source::{PageQuery, RemoteDataSource};
    use crate::record::UpdateOptions;
    use async_trait::async_trait;
    use serde_json::json;

    struct NullSource;

    #[async_trait]
    impl RemoteDataSource for NullSource {
        async fn fetch_page(
            &self,
            _kind: &str,
            _query: PageQuery,
        ) -> Result<Vec<Value>, FetchError> {
            Ok(Vec::new())
        }

        async fn write(&self, _kind: &str, _id: &str, payload: Value) -> Result<Value, WriteError> {
            Ok(payload)
        }
    }

    fn test_collection() -> RecordCollection {
        let scheduler = MutationScheduler::new(
            Arc::new(NullSource),
            StoreConfig::default(),
            RelationshipIndex::default(),
        );
        RecordCollection::new(CollectionSpec::new("organizations"), scheduler)
    }

    #[test]
    fn get_or_create_inserts_once() {
        let collection = test_collection();
        let first = collection.get_or_create("org-1", json!({"name": "Acme"}));
        let second = collection.get_or_create("org-1", json!({"name": "ignored"}));

        assert_eq!(collection.len(), 1);
        assert_eq!(first.read(), second.read());
        assert_eq!(first.read()["name"], "Acme");
    }

    #[test]
    fn hydrate_inserts_clean_and_updates_existing() {
        let collection = test_collection();
        let touched = collection.hydrate(vec![
            json!({"id": "org-1", "name": "Acme"}),
            json!({"id": "org-2", "name": "Globex"}),
        ]);
        assert_eq!(touched, 2);
        assert_eq!(collection.len(), 2);
        assert!(!collection.get("org-1").unwrap().status().dirty);

        // A second page updates in place and never deletes.
        let touched = collection.hydrate(vec![json!({"id": "org-1", "name": "Acme Corp"})]);
        assert_eq!(touched, 1);
        assert_eq!(collection.len(), 2);
        assert_eq!(collection.get("org-1").unwrap().read()["name"], "Acme Corp");
    }

    #[test]
    fn hydrate_keeps_dirty_drafts() {
        let collection = test_collection();
        collection.hydrate(vec![json!({"id": "org-1", "name": "Acme"})]);

        let record = collection.get("org-1").unwrap();
        record.update(UpdateOptions::default(), |draft| {
            draft["name"] = json!("Edited");
        });

        collection.hydrate(vec![json!({"id": "org-1", "name": "Server"})]);
        assert_eq!(record.read()["name"], "Edited");
        assert_eq!(record.server_value()["name"], "Server");
    }

    #[test]
    fn hydrate_skips_items_without_id() {
        let collection = test_collection();
        let touched = collection.hydrate(vec![
            json!({"name": "no id"}),
            json!({"id": "org-1", "name": "Acme"}),
        ]);
        assert_eq!(touched, 1);
        assert_eq!(collection.len(), 1);
    }

    #[test]
    fn custom_id_pointer() {
        let scheduler = MutationScheduler::new(
            Arc::new(NullSource),
            StoreConfig::default(),
            RelationshipIndex::default(),
        );
        let collection = RecordCollection::new(
            CollectionSpec::new("contracts").with_id_pointer("/metadata/id"),
            scheduler,
        );
        collection.hydrate(vec![json!({"metadata": {"id": "c-1"}, "name": "Annual"})]);
        assert!(collection.contains("c-1"));
    }

    #[test]
    fn to_array_preserves_insertion_order() {
        let collection = test_collection();
        collection.hydrate(vec![
            json!({"id": "org-3"}),
            json!({"id": "org-1"}),
            json!({"id": "org-2"}),
        ]);

        let ids: Vec<_> = collection.to_array().iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec!["org-3", "org-1", "org-2"]);
    }

    #[test]
    fn create_temporary_generates_unique_prefixed_ids() {
        let collection = test_collection();
        let a = collection.create_temporary(json!({}));
        let b = collection.create_temporary(json!({}));

        assert!(a.is_temporary());
        assert!(b.is_temporary());
        assert_ne!(a.id(), b.id());
        assert_eq!(collection.len(), 2);
    }

    #[test]
    fn remove_deletes_record() {
        let collection = test_collection();
        collection.hydrate(vec![json!({"id": "org-1"}), json!({"id": "org-2"})]);

        assert!(collection.remove("org-1").is_some());
        assert!(collection.remove("org-1").is_none());
        assert_eq!(collection.len(), 1);

        let ids: Vec<_> = collection.to_array().iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec!["org-2"]);
    }

    #[test]
    fn rekey_moves_record_in_place() {
        let collection = test_collection();
        collection.hydrate(vec![json!({"id": "org-1"})]);
        let temp = collection.create_temporary(json!({"name": "Draft"}));
        let temp_id = temp.id();

        assert!(collection.rekey(&temp_id, "org-2"));
        assert!(!collection.contains(&temp_id));

        let record = collection.get("org-2").unwrap();
        assert_eq!(record.id(), "org-2");
        assert!(!record.is_temporary());

        let ids: Vec<_> = collection.to_array().iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec!["org-1", "org-2"]);

        assert!(!collection.rekey("missing", "org-3"));
    }
}
