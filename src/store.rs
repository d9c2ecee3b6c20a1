//! The store: one collection per entity kind behind a single root handle.
//!
//! A `Store` is constructed once at application start and handed to the UI
//! layer (dependency injection, not a language-level global). It wires the
//! collections, the relationship index and the mutation scheduler together
//! and offers graph-aware hydration on top of the per-collection API.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::collection::{CollectionSpec, RecordCollection};
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::relationship::RelationshipIndex;
use crate::scheduler::MutationScheduler;
use crate::source::{PageQuery, RemoteDataSource};
use crate::EntityKind;

pub(crate) type RegistryMap = HashMap<EntityKind, RecordCollection>;

/// Root registry of collections, relationships and the write scheduler.
#[derive(Clone)]
pub struct Store {
    registry: Arc<RegistryMap>,
    relationships: RelationshipIndex,
    scheduler: MutationScheduler,
    source: Arc<dyn RemoteDataSource>,
}

impl Store {
    /// Build a store with one collection per spec. Kinds not declared here
    /// do not exist; [`Store::collection`] returns `None` for them.
    pub fn new(
        source: Arc<dyn RemoteDataSource>,
        config: StoreConfig,
        specs: Vec<CollectionSpec>,
    ) -> Self {
        let relationships = RelationshipIndex::default();
        let scheduler = MutationScheduler::new(source.clone(), config, relationships.clone());
        let registry: Arc<RegistryMap> = Arc::new(
            specs
                .into_iter()
                .map(|spec| {
                    (
                        spec.kind.clone(),
                        RecordCollection::new(spec, scheduler.clone()),
                    )
                })
                .collect(),
        );
        scheduler.attach(&registry);
        tracing::info!(kinds = registry.len(), "store initialized");

        Self {
            registry,
            relationships,
            scheduler,
            source,
        }
    }

    /// The collection for an entity kind.
    pub fn collection(&self, kind: &str) -> Option<RecordCollection> {
        self.registry.get(kind).cloned()
    }

    /// The relationship index, for declarations at startup.
    pub fn relationships(&self) -> &RelationshipIndex {
        &self.relationships
    }

    /// The mutation scheduler. Normal write entry points are the record
    /// methods; this is exposed for flush/cancel plumbing.
    pub fn scheduler(&self) -> &MutationScheduler {
        &self.scheduler
    }

    /// Hydrate a page into its collection, first seeding any entities
    /// embedded in declared relationship fields into their own
    /// collections. Embedded entities never overwrite records that are
    /// already resident; pages are partial and a skeleton `{id}` object
    /// must not clobber a fully loaded record.
    pub fn hydrate(&self, kind: &str, page: Vec<Value>) -> Result<usize> {
        let collection = self
            .registry
            .get(kind)
            .ok_or_else(|| StoreError::KindNotFound(kind.to_string()))?;

        for def in self.relationships.defs() {
            if def.source_kind == kind {
                if let Some(linked) = self.registry.get(&def.target_kind) {
                    self.ingest_embedded(&page, &def.source_field, linked);
                }
            }
            if def.target_kind == kind {
                if let Some(linked) = self.registry.get(&def.source_kind) {
                    self.ingest_embedded(&page, &def.target_field, linked);
                }
            }
        }

        Ok(collection.hydrate(page))
    }

    fn ingest_embedded(&self, page: &[Value], field: &str, linked: &RecordCollection) {
        let mut embedded = Vec::new();
        for item in page {
            match item.get(field) {
                Some(Value::Object(_)) => embedded.push(item[field].clone()),
                Some(Value::Array(entries)) => {
                    embedded.extend(entries.iter().filter(|e| e.is_object()).cloned())
                }
                _ => {}
            }
        }
        let fresh: Vec<Value> = embedded
            .into_iter()
            .filter(|value| match linked.id_of(value) {
                Some(id) => !linked.contains(&id),
                None => false,
            })
            .collect();
        if !fresh.is_empty() {
            tracing::debug!(
                kind = %linked.kind(),
                count = fresh.len(),
                "ingesting embedded entities"
            );
            linked.hydrate(fresh);
        }
    }

    /// Fetch a page from the remote source and hydrate it.
    pub async fn refresh(&self, kind: &str, query: PageQuery) -> Result<usize> {
        if !self.registry.contains_key(kind) {
            return Err(StoreError::KindNotFound(kind.to_string()));
        }
        let page = self.source.fetch_page(kind, query).await?;
        self.hydrate(kind, page)
    }

    /// Mark a record stale and refresh it in the background.
    pub fn invalidate(&self, kind: &str, id: &str) -> Result<()> {
        let collection = self
            .registry
            .get(kind)
            .ok_or_else(|| StoreError::KindNotFound(kind.to_string()))?;
        let record = collection
            .get(id)
            .ok_or_else(|| StoreError::RecordNotFound(id.to_string()))?;
        record.invalidate();
        Ok(())
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("kinds", &self.registry.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FetchError, WriteError};
    use crate::relationship::RelationshipDef;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Source serving fixed pages per kind.
    struct PageSource {
        pages: Mutex<HashMap<String, Vec<Value>>>,
    }

    impl PageSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                pages: Mutex::new(HashMap::new()),
            })
        }

        fn set_page(&self, kind: &str, page: Vec<Value>) {
            self.pages
                .lock()
                .expect("pages lock")
                .insert(kind.to_string(), page);
        }
    }

    #[async_trait]
    impl RemoteDataSource for PageSource {
        async fn fetch_page(
            &self,
            kind: &str,
            query: PageQuery,
        ) -> std::result::Result<Vec<Value>, FetchError> {
            let pages = self.pages.lock().expect("pages lock");
            let page = pages.get(kind).cloned().unwrap_or_default();
            Ok(match query.ids {
                Some(ids) => page
                    .into_iter()
                    .filter(|item| {
                        item.get("id")
                            .and_then(Value::as_str)
                            .map(|id| ids.iter().any(|wanted| wanted == id))
                            .unwrap_or(false)
                    })
                    .collect(),
                None => page,
            })
        }

        async fn write(
            &self,
            _kind: &str,
            _id: &str,
            payload: Value,
        ) -> std::result::Result<Value, WriteError> {
            Ok(payload)
        }
    }

    fn test_store(source: Arc<PageSource>) -> Store {
        Store::new(
            source,
            StoreConfig::default(),
            vec![
                CollectionSpec::new("organizations"),
                CollectionSpec::new("contracts"),
                CollectionSpec::new("line_items"),
            ],
        )
    }

    #[test]
    fn collection_lookup() {
        let store = test_store(PageSource::new());
        assert!(store.collection("organizations").is_some());
        assert!(store.collection("unknown").is_none());
    }

    #[test]
    fn hydrate_unknown_kind_fails() {
        let store = test_store(PageSource::new());
        assert!(matches!(
            store.hydrate("unknown", vec![]),
            Err(StoreError::KindNotFound(_))
        ));
    }

    #[test]
    fn hydrate_ingests_embedded_entities() {
        let store = test_store(PageSource::new());
        store
            .relationships()
            .declare(RelationshipDef::one_to_many(
                "contract-line-items",
                "contracts",
                "lineItems",
                "line_items",
                "contract",
            ))
            .unwrap();

        let touched = store
            .hydrate(
                "contracts",
                vec![json!({
                    "id": "c-1",
                    "name": "Annual",
                    "lineItems": [
                        {"id": "sli-1", "description": "Support"},
                        {"id": "sli-2", "description": "Hosting"},
                    ],
                })],
            )
            .unwrap();
        assert_eq!(touched, 1);

        let line_items = store.collection("line_items").unwrap();
        assert_eq!(line_items.len(), 2);
        assert_eq!(
            line_items.get("sli-1").unwrap().read()["description"],
            "Support"
        );
    }

    #[test]
    fn embedded_skeletons_do_not_clobber_resident_records() {
        let store = test_store(PageSource::new());
        store
            .relationships()
            .declare(RelationshipDef::one_to_many(
                "contract-line-items",
                "contracts",
                "lineItems",
                "line_items",
                "contract",
            ))
            .unwrap();

        let line_items = store.collection("line_items").unwrap();
        line_items.hydrate(vec![json!({"id": "sli-1", "description": "Full detail"})]);

        store
            .hydrate(
                "contracts",
                vec![json!({"id": "c-1", "lineItems": [{"id": "sli-1"}]})],
            )
            .unwrap();

        assert_eq!(
            line_items.get("sli-1").unwrap().read()["description"],
            "Full detail"
        );
    }

    #[tokio::test]
    async fn refresh_fetches_and_hydrates() {
        let source = PageSource::new();
        source.set_page(
            "organizations",
            vec![json!({"id": "org-1", "name": "Acme"})],
        );
        let store = test_store(source);

        let touched = store.refresh("organizations", PageQuery::all()).await.unwrap();
        assert_eq!(touched, 1);
        assert!(store.collection("organizations").unwrap().contains("org-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_refreshes_in_background() {
        let source = PageSource::new();
        source.set_page(
            "organizations",
            vec![json!({"id": "org-1", "name": "Fresh"})],
        );
        let store = test_store(source.clone());

        let orgs = store.collection("organizations").unwrap();
        orgs.hydrate(vec![json!({"id": "org-1", "name": "Stale"})]);

        store.invalidate("organizations", "org-1").unwrap();
        let record = orgs.get("org-1").unwrap();
        assert!(record.status().invalidated);

        for _ in 0..100 {
            if !record.status().invalidated {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(record.read()["name"], "Fresh");
        assert!(!record.status().invalidated);
    }

    #[test]
    fn invalidate_unknown_record_fails() {
        let store = test_store(PageSource::new());
        assert!(matches!(
            store.invalidate("organizations", "ghost"),
            Err(StoreError::RecordNotFound(_))
        ));
    }
}
