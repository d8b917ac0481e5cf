//! Query-result cache.
//!
//! Keyed by a normalized form of the query; shared and read-mostly. Any
//! entity or category mutation flushes the whole cache - the conservative
//! invalidation the consistency contract allows. Staleness beyond one
//! indexing cycle would be a correctness bug, so nothing is ever allowed to
//! outlive an index write.

use crate::search::{SearchQuery, SearchResult};
use lru::LruCache;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Mutex;

/// Normalized cache key for a search query.
///
/// Text is trimmed and case-folded (tokenization folds case anyway), f32
/// fields are keyed by their bit patterns, and the query vector collapses to
/// a hash of its bits.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct QueryKey {
    text: Option<String>,
    vector_hash: Option<u64>,
    categories: Option<Vec<u64>>,
    weight_bits: (u32, u32),
    limit: usize,
    min_score_bits: Option<u32>,
}

impl QueryKey {
    fn of(query: &SearchQuery) -> Self {
        let vector_hash = query.vector.as_ref().map(|v| {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            for value in v {
                value.to_bits().hash(&mut hasher);
            }
            hasher.finish()
        });
        Self {
            text: query
                .text
                .as_ref()
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty()),
            vector_hash,
            categories: query
                .category_filter
                .as_ref()
                .map(|set| set.iter().map(|c| c.as_u64()).collect()),
            weight_bits: (query.weights.vector.to_bits(), query.weights.text.to_bits()),
            limit: query.limit,
            min_score_bits: query.min_score.map(f32::to_bits),
        }
    }
}

/// LRU cache of search results.
pub struct QueryCache {
    entries: Mutex<LruCache<QueryKey, Vec<SearchResult>>>,
}

impl QueryCache {
    /// Creates a cache holding up to `capacity` queries. A zero capacity
    /// disables caching by holding a single slot that is flushed on every
    /// mutation anyway.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Cached results for a query, if present.
    pub fn get(&self, query: &SearchQuery) -> Option<Vec<SearchResult>> {
        let mut entries = self.entries.lock().ok()?;
        entries.get(&QueryKey::of(query)).cloned()
    }

    /// Stores results for a query.
    pub fn put(&self, query: &SearchQuery, results: Vec<SearchResult>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.put(QueryKey::of(query), results);
        }
    }

    /// Drops every cached entry. Called on any index mutation.
    pub fn flush(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    /// Number of cached queries.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// Returns `true` when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
