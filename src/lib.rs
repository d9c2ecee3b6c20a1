//! # Tether Store
//!
//! A reactive entity cache for CRM front ends.
//!
//! This crate provides the client-side state layer a browser (or desktop)
//! CRM sits on: a normalized, in-memory cache of server entities with
//! optimistic local mutation, deferred/batched persistence through a
//! pluggable remote source, and automatic maintenance of bidirectional
//! relationships between entities.
//!
//! ## Design Principles
//!
//! - **Transport-agnostic**: the store only knows the [`RemoteDataSource`]
//!   trait; GraphQL, REST or anything else lives behind it
//! - **Optimistic**: edits land in the local draft immediately, the server
//!   catches up asynchronously
//! - **Never lose edits**: failed writes keep the dirty draft and surface
//!   the error as record state, not as an exception in a render path
//! - **One writer per record**: writes for a record are coalesced, ordered
//!   and never concurrent
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! A [`Record`] wraps one entity with:
//! - the last server-confirmed value and the locally drafted value
//! - dirty/in-flight flags and a strictly increasing version counter
//! - a minimal pub/sub so UI code re-renders on change
//!
//! ### Collections
//!
//! A [`RecordCollection`] holds the records of one entity kind, hydrates
//! server pages without ever deleting local records, and creates
//! temporary (`"new-"`-prefixed) records for optimistic creation flows.
//!
//! ### Relationships
//!
//! A [`RelationshipIndex`] keeps both sides of declared links consistent:
//! committing a record that changes a relationship field patches the
//! opposite side's cached record in place, with no fresh fetch.
//!
//! ### The scheduler
//!
//! The [`MutationScheduler`] debounces free-text edits, coalesces queued
//! writes per record, retries transient failures with backoff, and
//! guarantees at most one in-flight write per record.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use serde_json::{json, Value};
//! use tether_store::{
//!     CollectionSpec, FetchError, PageQuery, RemoteDataSource, Store,
//!     StoreConfig, UpdateOptions, WriteError,
//! };
//!
//! // The transport is supplied by the application.
//! struct NullSource;
//!
//! #[async_trait::async_trait]
//! impl RemoteDataSource for NullSource {
//!     async fn fetch_page(
//!         &self,
//!         _kind: &str,
//!         _query: PageQuery,
//!     ) -> Result<Vec<Value>, FetchError> {
//!         Ok(Vec::new())
//!     }
//!
//!     async fn write(
//!         &self,
//!         _kind: &str,
//!         _id: &str,
//!         payload: Value,
//!     ) -> Result<Value, WriteError> {
//!         Ok(payload)
//!     }
//! }
//!
//! // 1. Build the store once at application start.
//! let store = Store::new(
//!     Arc::new(NullSource),
//!     StoreConfig::default(),
//!     vec![CollectionSpec::new("organizations")],
//! );
//!
//! // 2. Hydrate a server page.
//! let orgs = store.collection("organizations").unwrap();
//! orgs.hydrate(vec![json!({"id": "org-1", "name": "Acme"})]);
//!
//! // 3. Edit optimistically; the UI reads the draft right away.
//! let record = orgs.get("org-1").unwrap();
//! record.update(UpdateOptions::default(), |draft| {
//!     draft["name"] = json!("Acme Corp");
//! });
//! assert!(record.status().dirty);
//! assert_eq!(record.read()["name"], "Acme Corp");
//!
//! // 4. `record.commit()` (from within a tokio runtime) persists the
//! //    draft through the scheduler.
//! ```

pub mod collection;
pub mod config;
pub mod error;
pub mod record;
pub mod relationship;
pub mod scheduler;
pub mod source;
pub mod store;

// Re-export main types at crate root
pub use collection::{CollectionSpec, RecordCollection};
pub use config::StoreConfig;
pub use error::{FetchError, Result, StoreError, WriteError};
pub use record::{
    is_temporary_id, Record, RecordStatus, RecordWatcher, UpdateOptions, TEMP_ID_PREFIX,
};
pub use relationship::{Cardinality, RelationshipDef, RelationshipIndex};
pub use scheduler::{DispatchMode, MutationScheduler, PayloadBuilder};
pub use source::{PageQuery, RemoteDataSource};
pub use store::Store;

/// Type aliases for clarity
pub type RecordId = String;
pub type EntityKind = String;
pub type Version = u64;
