//! The remote data source boundary.
//!
//! The store never talks to the network itself. It consumes a
//! [`RemoteDataSource`] trait object supplied at construction; the GraphQL
//! (or other) transport lives behind it, opaque to the store.

use crate::error::{FetchError, WriteError};
use crate::RecordId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Query shape handed to the remote source when fetching a page.
///
/// The store only ever populates `ids` itself (single-record refresh);
/// callers driving pagination fill in `cursor`/`limit` and pass the query
/// through [`crate::Store::refresh`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageQuery {
    /// Restrict the page to these record ids.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<RecordId>>,
    /// Opaque pagination cursor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    /// Maximum number of items to return.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl PageQuery {
    /// An unrestricted query.
    pub fn all() -> Self {
        Self::default()
    }

    /// A query for a single record.
    pub fn by_id(id: impl Into<RecordId>) -> Self {
        Self {
            ids: Some(vec![id.into()]),
            ..Self::default()
        }
    }

    /// Limit the page size.
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// The transport the store persists through.
///
/// Implementations own their request timeouts; the scheduler treats a
/// timeout like any other transient failure.
#[async_trait]
pub trait RemoteDataSource: Send + Sync {
    /// Fetch a page of entities of the given kind.
    async fn fetch_page(&self, kind: &str, query: PageQuery) -> Result<Vec<Value>, FetchError>;

    /// Persist a payload for one record and return the authoritative
    /// post-write entity.
    async fn write(&self, kind: &str, id: &str, payload: Value) -> Result<Value, WriteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_builders() {
        let query = PageQuery::by_id("org-1").with_limit(1);
        assert_eq!(query.ids, Some(vec!["org-1".to_string()]));
        assert_eq!(query.limit, Some(1));
        assert!(query.cursor.is_none());
    }

    #[test]
    fn serialization_omits_unset_fields() {
        let json = serde_json::to_string(&PageQuery::all()).unwrap();
        assert_eq!(json, "{}");

        let json = serde_json::to_string(&PageQuery::by_id("org-1")).unwrap();
        assert!(json.contains("\"ids\":[\"org-1\"]"));
    }
}
