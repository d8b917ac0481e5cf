//! Error types shared across the engine.
//!
//! Search-path errors live in [`crate::search::SearchError`] and storage
//! errors in [`crate::storage::StoreError`]; this module holds the embedding,
//! taxonomy, catalog, and pipeline error enums plus the conversions between
//! layers.

use crate::search::SearchError;
use crate::storage::StoreError;
use crate::taxonomy::CategoryId;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by the external embedding collaborator.
///
/// Transient errors (network trouble, timeouts) are retried with bounded
/// exponential backoff; permanent rejections mark the entity as failed in
/// `health()` without blocking other entities.
#[derive(Debug, Clone, Error)]
pub enum EmbedError {
    /// The request did not complete within the configured timeout.
    #[error("embedding request timed out after {0:?}")]
    Timeout(Duration),
    /// Transient failure (network, service overload). Retryable.
    #[error("transient embedding failure: {0}")]
    Transient(String),
    /// The model permanently rejected the content. Not retryable.
    #[error("model rejected content: {0}")]
    Rejected(String),
}

impl EmbedError {
    /// Whether retrying the request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, EmbedError::Timeout(_) | EmbedError::Transient(_))
    }
}

/// Errors from category structure mutations.
#[derive(Debug, Clone, Error)]
pub enum TaxonomyError {
    /// Referenced category does not exist.
    #[error("unknown category: {0}")]
    UnknownCategory(CategoryId),
    /// Referenced parent does not exist.
    #[error("unknown parent category: {0}")]
    UnknownParent(CategoryId),
    /// A category with this id already exists.
    #[error("duplicate category: {0}")]
    DuplicateCategory(CategoryId),
    /// The move would make a node its own ancestor.
    #[error("move of {category} under {new_parent} would create a cycle")]
    CycleDetected {
        category: CategoryId,
        new_parent: CategoryId,
    },
    /// The category still has descendants and cannot be removed.
    #[error("category {0} still has descendants")]
    HasDescendants(CategoryId),
}

/// Errors from the catalog collaborator.
#[derive(Debug, Clone, Error)]
pub enum CatalogError {
    /// Entity lookup failed (not "entity absent" - that is `Ok(None)`).
    #[error("catalog lookup failed: {0}")]
    Lookup(String),
}

/// Errors surfaced by the indexing pipeline.
///
/// Per-entity failures are isolated: a failed reindex of one entity never
/// fails queries or indexing of unrelated entities.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Catalog collaborator failure.
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    /// Embedding failure after retries were exhausted (or a permanent
    /// rejection).
    #[error(transparent)]
    Embed(#[from] EmbedError),
    /// Persistence failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Index-side failure (dimension mismatch and friends).
    #[error(transparent)]
    Search(#[from] SearchError),
    /// The pipeline worker is gone and the event queue is closed.
    #[error("indexing queue closed")]
    QueueClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(EmbedError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(EmbedError::Transient("connection reset".into()).is_transient());
        assert!(!EmbedError::Rejected("content too long".into()).is_transient());
    }
}
