//! Engine configuration.
//!
//! All tunables live in explicit structs passed in at construction time;
//! there is no process-wide mutable configuration. Defaults match the
//! constants documented below.

use crate::embedding::ModelId;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

// =============================================================================
// Fusion
// =============================================================================

/// Over-fetch multiplier applied to the query limit when gathering
/// per-index candidates.
///
/// Fusing only the raw top-`limit` of each index can miss a document whose
/// *combined* score belongs in the final top-`limit`, so both indices are
/// asked for `max(limit * OVERFETCH_FACTOR, OVERFETCH_FLOOR)` candidates
/// before fusion.
pub const DEFAULT_OVERFETCH_FACTOR: usize = 5;

/// Lower bound on the per-index candidate count, regardless of limit.
pub const DEFAULT_OVERFETCH_FLOOR: usize = 50;

// =============================================================================
// BM25
// =============================================================================

/// Standard BM25 term-frequency saturation parameter.
pub const DEFAULT_BM25_K1: f32 = 1.2;

/// Standard BM25 document-length normalization parameter.
pub const DEFAULT_BM25_B: f32 = 0.75;

// =============================================================================
// Embedding requests
// =============================================================================

/// Timeout applied to each call to the external embedding collaborator.
pub const DEFAULT_EMBED_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum embed attempts per indexing pass (initial call + retries).
pub const DEFAULT_MAX_EMBED_ATTEMPTS: u32 = 4;

/// First retry delay; doubles per attempt up to [`DEFAULT_MAX_BACKOFF`].
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(250);

/// Cap on the exponential backoff delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(10);

// =============================================================================
// Pipeline and cache
// =============================================================================

/// Bound on the change-event queue between the catalog and the indexing
/// worker. Senders back-pressure when the worker falls behind.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Maximum cached query results before LRU eviction.
pub const DEFAULT_CACHE_CAPACITY: usize = 512;

/// Recall target for the approximate vector index: the true nearest
/// neighbor must appear in the returned top-20 at least this often.
/// Verified against a synthetic corpus by the recall tests and benches.
pub const RECALL_TARGET: f64 = 0.95;

/// Fusion candidate-gathering configuration.
#[derive(Debug, Clone)]
pub struct FusionConfig {
    /// Per-index candidate count multiplier over the query limit.
    pub overfetch_factor: usize,
    /// Minimum per-index candidate count.
    pub overfetch_floor: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            overfetch_factor: DEFAULT_OVERFETCH_FACTOR,
            overfetch_floor: DEFAULT_OVERFETCH_FLOOR,
        }
    }
}

impl FusionConfig {
    /// Number of candidates to request from each index for a given limit.
    pub fn candidate_count(&self, limit: usize) -> usize {
        (limit * self.overfetch_factor).max(self.overfetch_floor)
    }
}

/// Lexical index configuration.
#[derive(Debug, Clone)]
pub struct Bm25Config {
    /// Term-frequency saturation (k1).
    pub k1: f32,
    /// Length normalization strength (b).
    pub b: f32,
    /// Stop words dropped during tokenization. `None` selects the built-in
    /// English set; `Some(empty)` disables stop-word filtering entirely.
    pub stop_words: Option<HashSet<String>>,
    /// Per-field score weights by field name. Unlisted fields weigh 1.0.
    pub field_weights: HashMap<String, f32>,
}

impl Default for Bm25Config {
    fn default() -> Self {
        Self {
            k1: DEFAULT_BM25_K1,
            b: DEFAULT_BM25_B,
            stop_words: None,
            field_weights: HashMap::new(),
        }
    }
}

/// Retry policy for transient embedding failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts (initial call + retries).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound on the doubling backoff.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_EMBED_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before retrying after the given zero-based attempt.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = self
            .initial_backoff
            .saturating_mul(1u32 << attempt.min(16));
        exp.min(self.max_backoff)
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// The embedding model this engine indexes under. One active embedding
    /// record exists per (entity, model).
    pub model: ModelId,
    /// Embedding dimension registered for `model`. Vectors of any other
    /// length are rejected with `DimensionMismatch`.
    pub dimension: usize,
    /// Candidate over-fetch for fusion.
    pub fusion: FusionConfig,
    /// Lexical index parameters.
    pub bm25: Bm25Config,
    /// Timeout per embedding request.
    pub embed_timeout: Duration,
    /// Retry policy for transient embed failures.
    pub retry: RetryPolicy,
    /// Change-event queue bound.
    pub queue_capacity: usize,
    /// Query-result cache capacity.
    pub cache_capacity: usize,
}

impl EngineConfig {
    /// Configuration with defaults for the given model and dimension.
    pub fn new(model: ModelId, dimension: usize) -> Self {
        Self {
            model,
            dimension,
            fusion: FusionConfig::default(),
            bm25: Bm25Config::default(),
            embed_timeout: DEFAULT_EMBED_TIMEOUT,
            retry: RetryPolicy::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}
