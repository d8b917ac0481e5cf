//! Core search types.

use crate::taxonomy::CategoryId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

/// Stable identifier of an indexed entity (a catalog material).
///
/// Ids are assigned by the catalog collaborator, not generated here.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct EntityId(u64);

impl EntityId {
    /// Creates an `EntityId` from a raw u64 value.
    pub fn from_u64(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw u64 value of this id.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An indexable catalog entity.
///
/// `text_fields` is an ordered list of `(field_name, content)` pairs fed to
/// the lexical index and to the content fingerprint; `category_ids` places
/// the entity in the classification taxonomy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    /// Stable identifier.
    pub id: EntityId,
    /// Ordered `(field_name, content)` pairs, e.g. name/description/tags.
    pub text_fields: Vec<(String, String)>,
    /// Classification categories this entity belongs to.
    pub category_ids: BTreeSet<CategoryId>,
    /// Logical version stamp from the catalog.
    pub updated_at: u64,
}

/// Fusion weights for the two ranking components.
///
/// Both weights must lie in [0, 1]. They need not sum to 1; they are applied
/// to independently min-max-normalized component scores.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FusionWeights {
    /// Weight of the normalized vector-similarity score.
    pub vector: f32,
    /// Weight of the normalized BM25 score.
    pub text: f32,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            vector: 0.6,
            text: 0.4,
        }
    }
}

/// A search request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Raw query text for the lexical leg, also embedded for the vector leg
    /// when no pre-computed `vector` is supplied.
    pub text: Option<String>,
    /// Pre-computed query embedding. Takes precedence over embedding `text`.
    pub vector: Option<Vec<f32>>,
    /// Restrict results to entities belonging to at least one of these
    /// categories or any of their descendants.
    pub category_filter: Option<BTreeSet<CategoryId>>,
    /// Component weights.
    pub weights: FusionWeights,
    /// Maximum number of results.
    pub limit: usize,
    /// Drop results with a fused score below this threshold.
    pub min_score: Option<f32>,
}

impl SearchQuery {
    /// A text query with default weights and the given limit.
    pub fn text(text: impl Into<String>, limit: usize) -> Self {
        Self {
            text: Some(text.into()),
            vector: None,
            category_filter: None,
            weights: FusionWeights::default(),
            limit,
            min_score: None,
        }
    }
}

/// One ranked search hit.
///
/// Both component scores are always reported - even when one contributed
/// zero - so callers and tests can see how the fused score decomposes.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    /// The matched entity.
    pub entity_id: EntityId,
    /// Weighted sum of the normalized component scores.
    pub fused_score: f32,
    /// Raw cosine similarity from the vector index (0.0 if the entity was
    /// not a vector candidate).
    pub vector_score: f32,
    /// Raw BM25 score from the lexical index (0.0 if the entity was not a
    /// lexical candidate).
    pub text_score: f32,
}

/// Error types for search operations.
#[derive(Debug, Clone, Error)]
pub enum SearchError {
    /// Vector dimension mismatch (expected vs actual).
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Expected embedding dimension.
        expected: usize,
        /// Actual embedding dimension received.
        actual: usize,
    },
    /// Malformed query: zero weights, unknown filter category, zero limit.
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(String),
    /// Query embedding failure that cannot be degraded around.
    #[error("embedding error: {0}")]
    Embedding(String),
}

/// Validates that an embedding has the expected dimension.
pub fn validate_dimension(expected: usize, actual: usize) -> Result<(), SearchError> {
    if actual == expected {
        Ok(())
    } else {
        Err(SearchError::DimensionMismatch { expected, actual })
    }
}

/// Engine health snapshot for operational monitoring.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHealth {
    /// Entities awaiting (re-)indexing, including those whose last attempt
    /// failed and will be retried.
    pub pending_reindex_count: usize,
    /// Entities whose last indexing attempt failed permanently or exhausted
    /// retries.
    pub failed_count: usize,
    /// Entities excluded from results after an invariant violation was
    /// detected (e.g. a candidate id unknown to the entity registry).
    pub corrupted_count: usize,
    /// Live entities in the index.
    pub index_size: usize,
    /// Rolling average search latency in milliseconds.
    pub avg_query_latency_ms: f64,
}
