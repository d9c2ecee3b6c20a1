//! Error types for the Tether store.

use crate::{EntityKind, RecordId};
use thiserror::Error;

/// Failure reported by the remote data source for a write.
///
/// The scheduler retries transient failures with backoff; rejected writes
/// are surfaced immediately. In both cases the record keeps its dirty draft
/// so the user's edits are never silently lost.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WriteError {
    /// Network-level or 5xx failure; a retry may succeed.
    #[error("transient write failure: {message}")]
    Transient { message: String },

    /// Server-side validation or 4xx rejection; a retry will not help
    /// without changing the payload.
    #[error("write rejected: {message}")]
    Rejected { message: String },
}

impl WriteError {
    /// Build a transient failure.
    pub fn transient(message: impl Into<String>) -> Self {
        WriteError::Transient {
            message: message.into(),
        }
    }

    /// Build a rejected failure.
    pub fn rejected(message: impl Into<String>) -> Self {
        WriteError::Rejected {
            message: message.into(),
        }
    }

    /// Whether retrying this write may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, WriteError::Transient { .. })
    }
}

/// Failure reported by the remote data source for a page fetch.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("fetch failed: {0}")]
    Failed(String),
}

/// All possible errors from the store API surface.
///
/// Write and fetch failures that happen inside the scheduler never surface
/// here; they are converted into record state (`dirty`, `last_error`).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("unknown entity kind: {0}")]
    KindNotFound(EntityKind),

    #[error("record not found: {0}")]
    RecordNotFound(RecordId),

    #[error("relationship '{name}' already declared with a different shape")]
    RelationshipConflict { name: String },

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
