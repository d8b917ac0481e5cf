//! Hybrid retrieval engine: vector + lexical candidates fused into one
//! ranking.
//!
//! The engine owns both in-memory indices, the taxonomy, the entity
//! registry, and the query cache, all behind read/write locks with a
//! single-writer discipline: the indexing pipeline is the only writer, and
//! per-entity updates take both index write locks for the duration of one
//! swap so readers observe either the pre- or post-update state of an
//! entity, never a mix.
//!
//! Persistent state lives in an [`IndexStore`]; `try_load_or_new` rebuilds
//! the in-memory indices from it at startup and reports entities whose
//! stored fingerprints show a partially applied update.

use super::fusion::{self, FusedCandidate};
use super::lexical::LexicalIndex;
use super::types::{
    validate_dimension, Entity, EntityId, FusionWeights, IndexHealth, SearchError, SearchQuery,
    SearchResult,
};
use super::vector::VectorIndex;
use crate::cache::QueryCache;
use crate::config::EngineConfig;
use crate::embedding::{
    l2_normalize, ContentFingerprint, EmbedClient, EmbeddingRecordStore,
};
use crate::error::TaxonomyError;
use crate::metrics::QueryMetrics;
use crate::storage::{IndexStore, IndexedEntityRecord, StoreError};
use crate::taxonomy::{Category, CategoryId, Taxonomy};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

/// Per-entity registry entry: what the indices currently hold.
#[derive(Debug, Clone)]
pub(crate) struct RegistryEntry {
    pub(crate) categories: BTreeSet<CategoryId>,
    pub(crate) fingerprint: ContentFingerprint,
}

pub(crate) struct EngineShared<S: IndexStore> {
    pub(crate) config: EngineConfig,
    pub(crate) embedder: Arc<dyn EmbedClient>,
    pub(crate) vector: RwLock<VectorIndex>,
    pub(crate) lexical: RwLock<LexicalIndex>,
    pub(crate) taxonomy: RwLock<Taxonomy>,
    /// Entities currently represented in the indices.
    pub(crate) registry: RwLock<HashMap<EntityId, RegistryEntry>>,
    pub(crate) embeddings: EmbeddingRecordStore<S>,
    pub(crate) cache: QueryCache,
    pub(crate) metrics: QueryMetrics,
    /// Entities queued or mid-flight in the pipeline (`ReindexPending`).
    pub(crate) pending: Mutex<HashSet<EntityId>>,
    /// Entities whose last indexing attempt failed, with the failure text.
    pub(crate) failures: Mutex<HashMap<EntityId, String>>,
    /// Entities excluded from results after an invariant violation.
    pub(crate) corrupted: Mutex<HashSet<EntityId>>,
}

/// Hybrid retrieval engine over a persistent store.
///
/// Cheap to clone; clones share all state. Queries run concurrently from
/// any number of tasks; writes go through the indexing pipeline.
pub struct RetrievalEngine<S: IndexStore> {
    pub(crate) shared: Arc<EngineShared<S>>,
}

impl<S: IndexStore> Clone for RetrievalEngine<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

fn lock_poisoned(_: impl std::fmt::Debug) -> SearchError {
    SearchError::Storage("index lock poisoned".to_string())
}

impl<S: IndexStore> RetrievalEngine<S> {
    /// Creates an empty engine (no persistence load).
    ///
    /// Use [`try_load_or_new`](Self::try_load_or_new) in production so
    /// existing index data is rebuilt.
    pub fn new(store: Arc<S>, embedder: Arc<dyn EmbedClient>, config: EngineConfig) -> Self {
        let shared = EngineShared {
            vector: RwLock::new(VectorIndex::new(config.dimension)),
            lexical: RwLock::new(LexicalIndex::new(&config.bm25)),
            taxonomy: RwLock::new(Taxonomy::new()),
            registry: RwLock::new(HashMap::new()),
            embeddings: EmbeddingRecordStore::new(
                store,
                config.model.clone(),
                config.dimension,
            ),
            cache: QueryCache::new(config.cache_capacity),
            metrics: QueryMetrics::new(),
            pending: Mutex::new(HashSet::new()),
            failures: Mutex::new(HashMap::new()),
            corrupted: Mutex::new(HashSet::new()),
            embedder,
            config,
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Creates an engine, rebuilding indices from the store when it holds
    /// data.
    ///
    /// Returns the engine plus the entities detected as `ReindexPending`:
    /// those whose active embedding fingerprint disagrees with the applied
    /// entity-record fingerprint (a crash landed between pipeline steps), or
    /// whose embedding exists with no entity record at all. The caller feeds
    /// them back through the pipeline; every step is idempotent.
    pub async fn try_load_or_new(
        store: Arc<S>,
        embedder: Arc<dyn EmbedClient>,
        config: EngineConfig,
    ) -> Result<(Self, Vec<EntityId>), SearchError> {
        let engine = Self::new(store, embedder, config);

        let records = engine
            .shared
            .embeddings
            .backend()
            .iter_entity_records()
            .await
            .map_err(|e| SearchError::Storage(e.to_string()))?;
        let active = engine
            .shared
            .embeddings
            .iter_active(&engine.shared.config.model)
            .await?;

        if records.is_empty() && active.is_empty() {
            info!("no existing index data, starting empty");
            return Ok((engine, vec![]));
        }

        info!(
            entities = records.len(),
            embeddings = active.len(),
            "rebuilding indices from store"
        );

        let started = Instant::now();
        let embeddings_by_entity: HashMap<EntityId, _> = active
            .into_iter()
            .map(|r| (r.entity_id, r))
            .collect();

        let mut pending: BTreeSet<EntityId> = BTreeSet::new();
        {
            let mut vector = engine.shared.vector.write().map_err(lock_poisoned)?;
            let mut lexical = engine.shared.lexical.write().map_err(lock_poisoned)?;
            let mut registry = engine.shared.registry.write().map_err(lock_poisoned)?;

            for record in &records {
                let entity = &record.entity;
                match embeddings_by_entity.get(&entity.id) {
                    Some(embedding) if embedding.fingerprint == record.applied_fingerprint => {
                        if embedding.vector.len() != engine.shared.config.dimension {
                            warn!(
                                entity = entity.id.as_u64(),
                                expected = engine.shared.config.dimension,
                                actual = embedding.vector.len(),
                                "skipping embedding with wrong dimension"
                            );
                            pending.insert(entity.id);
                            continue;
                        }
                        vector.upsert(entity.id, embedding.vector.clone())?;
                        lexical.index(entity.id, &entity.text_fields);
                        registry.insert(
                            entity.id,
                            RegistryEntry {
                                categories: entity.category_ids.clone(),
                                fingerprint: record.applied_fingerprint.clone(),
                            },
                        );
                    }
                    _ => {
                        // Missing or stale embedding: crash mid-pipeline.
                        pending.insert(entity.id);
                    }
                }
            }
        }

        // Embeddings without an entity record crashed before the applied
        // marker was written.
        for entity_id in embeddings_by_entity.keys() {
            if !records.iter().any(|r| r.entity.id == *entity_id) {
                pending.insert(*entity_id);
            }
        }

        let categories = engine
            .shared
            .embeddings
            .backend()
            .list_categories()
            .await
            .map_err(|e| SearchError::Storage(e.to_string()))?;
        if !categories.is_empty() {
            let mut taxonomy = engine.shared.taxonomy.write().map_err(lock_poisoned)?;
            *taxonomy = Taxonomy::from_nodes(categories);
        }

        if !pending.is_empty() {
            warn!(
                count = pending.len(),
                "entities detected as reindex-pending at load"
            );
            let mut pending_set = engine
                .shared
                .pending
                .lock()
                .map_err(lock_poisoned)?;
            pending_set.extend(pending.iter().copied());
        }

        info!(
            live = engine.shared.registry.read().map_err(lock_poisoned)?.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "index rebuild complete"
        );

        Ok((engine, pending.into_iter().collect()))
    }

    /// Runs a hybrid search.
    ///
    /// # Errors
    ///
    /// [`SearchError::InvalidQuery`] when both effective fusion weights are
    /// zero, a weight lies outside [0, 1], the limit is zero, or the
    /// category filter names an unknown category.
    /// [`SearchError::DimensionMismatch`] when a caller-supplied query
    /// vector has the wrong length.
    #[must_use = "search results should be used or errors handled"]
    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>, SearchError> {
        let started = Instant::now();

        if query.limit == 0 {
            return Err(SearchError::InvalidQuery(
                "limit must be greater than 0".to_string(),
            ));
        }
        for (name, weight) in [
            ("vector_weight", query.weights.vector),
            ("text_weight", query.weights.text),
        ] {
            if !(0.0..=1.0).contains(&weight) {
                return Err(SearchError::InvalidQuery(format!(
                    "{name} must lie in [0, 1], got {weight}"
                )));
            }
        }

        if let Some(cached) = self.shared.cache.get(query) {
            debug!("query cache hit");
            self.shared.metrics.record(started.elapsed());
            return Ok(cached);
        }

        // Expand the category filter up front: a malformed filter is a
        // caller error, returned before any index work.
        let expanded_filter = match &query.category_filter {
            Some(filter) => {
                let taxonomy = self.shared.taxonomy.read().map_err(lock_poisoned)?;
                Some(taxonomy.expand_filter(filter).map_err(|e| match e {
                    TaxonomyError::UnknownCategory(id) => SearchError::InvalidQuery(format!(
                        "category filter references unknown category {id}"
                    )),
                    other => SearchError::InvalidQuery(other.to_string()),
                })?)
            }
            None => None,
        };

        let text = query
            .text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty());
        let text_weight = if text.is_some() { query.weights.text } else { 0.0 };

        let query_vector = if query.weights.vector > 0.0 {
            self.resolve_query_vector(query, text).await?
        } else {
            None
        };
        let vector_weight = if query_vector.is_some() {
            query.weights.vector
        } else {
            0.0
        };

        if vector_weight == 0.0 && text_weight == 0.0 {
            return Err(SearchError::InvalidQuery(
                "both fusion weights are zero; nothing to rank by".to_string(),
            ));
        }

        let candidate_count = self.shared.config.fusion.candidate_count(query.limit);

        let vector_candidates = match &query_vector {
            Some(vector) => {
                let index = self.shared.vector.read().map_err(lock_poisoned)?;
                index.query_top_k(vector, candidate_count)?
            }
            None => vec![],
        };
        let text_candidates = match text {
            Some(text) if text_weight > 0.0 => {
                let index = self.shared.lexical.read().map_err(lock_poisoned)?;
                index.query_top_k(text, candidate_count)
            }
            _ => vec![],
        };

        debug!(
            vector_candidates = vector_candidates.len(),
            text_candidates = text_candidates.len(),
            "gathered fusion candidates"
        );

        let fused = fusion::fuse(
            &vector_candidates,
            &text_candidates,
            FusionWeights {
                vector: vector_weight,
                text: text_weight,
            },
        );

        let results = self.finalize(fused, expanded_filter.as_ref(), query)?;

        self.shared.metrics.record(started.elapsed());
        self.shared.cache.put(query, results.clone());
        Ok(results)
    }

    /// Resolves the query vector: caller-supplied takes precedence, then
    /// the query text is embedded via the collaborator. An unembeddable
    /// text query degrades to lexical-only (logged), never to a fabricated
    /// vector.
    async fn resolve_query_vector(
        &self,
        query: &SearchQuery,
        text: Option<&str>,
    ) -> Result<Option<Vec<f32>>, SearchError> {
        if let Some(vector) = &query.vector {
            validate_dimension(self.shared.config.dimension, vector.len())?;
            let normalized = l2_normalize(vector.clone())
                .map_err(|e| SearchError::Embedding(e.to_string()))?;
            return Ok(Some(normalized));
        }

        let Some(text) = text else {
            return Ok(None);
        };

        let embedded = timeout(
            self.shared.config.embed_timeout,
            self.shared.embedder.embed(text),
        )
        .await;

        match embedded {
            Ok(Ok(raw)) => {
                if raw.len() != self.shared.config.dimension {
                    warn!(
                        expected = self.shared.config.dimension,
                        actual = raw.len(),
                        "query embedding has wrong dimension, skipping vector leg"
                    );
                    return Ok(None);
                }
                match l2_normalize(raw) {
                    Ok(vector) => Ok(Some(vector)),
                    Err(e) => {
                        warn!(error = %e, "query embedding not normalizable, skipping vector leg");
                        Ok(None)
                    }
                }
            }
            Ok(Err(e)) => {
                warn!(error = %e, "query embedding failed, skipping vector leg");
                Ok(None)
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.shared.config.embed_timeout.as_millis() as u64,
                    "query embedding timed out, skipping vector leg"
                );
                Ok(None)
            }
        }
    }

    /// Applies the category filter, corruption exclusion, threshold, and
    /// limit to fused candidates.
    fn finalize(
        &self,
        fused: Vec<FusedCandidate>,
        expanded_filter: Option<&HashSet<CategoryId>>,
        query: &SearchQuery,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let registry = self.shared.registry.read().map_err(lock_poisoned)?;
        let mut newly_corrupted = Vec::new();

        let mut results = Vec::with_capacity(query.limit);
        for candidate in fused {
            let Some(entry) = registry.get(&candidate.entity_id) else {
                // A candidate the indices know but the registry does not:
                // invariant violation. Exclude and surface via health.
                newly_corrupted.push(candidate.entity_id);
                continue;
            };

            if let Some(filter) = expanded_filter {
                if entry.categories.iter().all(|c| !filter.contains(c)) {
                    continue;
                }
            }

            if let Some(min_score) = query.min_score {
                if candidate.fused_score < min_score {
                    continue;
                }
            }

            results.push(SearchResult {
                entity_id: candidate.entity_id,
                fused_score: candidate.fused_score,
                vector_score: candidate.vector_score,
                text_score: candidate.text_score,
            });
            if results.len() == query.limit {
                break;
            }
        }
        drop(registry);

        if !newly_corrupted.is_empty() {
            warn!(
                count = newly_corrupted.len(),
                "candidates excluded: unknown to entity registry"
            );
            if let Ok(mut corrupted) = self.shared.corrupted.lock() {
                corrupted.extend(newly_corrupted);
            }
        }

        Ok(results)
    }

    /// Engine health snapshot.
    pub fn health(&self) -> IndexHealth {
        IndexHealth {
            pending_reindex_count: self.shared.pending.lock().map(|p| p.len()).unwrap_or(0),
            failed_count: self.shared.failures.lock().map(|f| f.len()).unwrap_or(0),
            corrupted_count: self.shared.corrupted.lock().map(|c| c.len()).unwrap_or(0),
            index_size: self.shared.registry.read().map(|r| r.len()).unwrap_or(0),
            avg_query_latency_ms: self.shared.metrics.average_ms(),
        }
    }

    /// Number of live indexed entities.
    pub fn len(&self) -> usize {
        self.shared.registry.read().map(|r| r.len()).unwrap_or(0)
    }

    /// Returns `true` when nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // =========================================================================
    // Write side (called by the indexing pipeline)
    // =========================================================================

    /// Applies one entity's index update atomically with respect to
    /// readers.
    ///
    /// `vector` is `Some` when the embedding changed; `None` refreshes only
    /// the lexical postings (fingerprint-unchanged path). The entity record
    /// with the applied fingerprint is persisted first; the in-memory swap
    /// then happens under both write locks, and the cache is flushed last.
    #[instrument(skip_all, fields(entity = entity.id.as_u64()))]
    pub(crate) async fn apply_index_swap(
        &self,
        entity: &Entity,
        fingerprint: &ContentFingerprint,
        vector: Option<Vec<f32>>,
    ) -> Result<(), SearchError> {
        if let Some(vector) = &vector {
            validate_dimension(self.shared.config.dimension, vector.len())?;
        }

        let record = IndexedEntityRecord {
            entity: entity.clone(),
            applied_fingerprint: fingerprint.clone(),
        };
        self.shared
            .embeddings
            .backend()
            .put_entity_record(&record)
            .await
            .map_err(|e| SearchError::Storage(e.to_string()))?;

        {
            let mut vector_index = self.shared.vector.write().map_err(lock_poisoned)?;
            let mut lexical_index = self.shared.lexical.write().map_err(lock_poisoned)?;
            let mut registry = self.shared.registry.write().map_err(lock_poisoned)?;

            if let Some(vector) = vector {
                vector_index.upsert(entity.id, vector)?;
            }
            lexical_index.index(entity.id, &entity.text_fields);
            registry.insert(
                entity.id,
                RegistryEntry {
                    categories: entity.category_ids.clone(),
                    fingerprint: fingerprint.clone(),
                },
            );
        }

        // A successful swap repairs any earlier corruption verdict.
        if let Ok(mut corrupted) = self.shared.corrupted.lock() {
            corrupted.remove(&entity.id);
        }

        self.shared.cache.flush();
        debug!("index swap applied");
        Ok(())
    }

    /// Removes an entity from the indices, its records from the store, and
    /// flushes the cache.
    #[instrument(skip_all, fields(entity = entity_id.as_u64()))]
    pub(crate) async fn remove_entity(&self, entity_id: EntityId) -> Result<(), SearchError> {
        self.shared
            .embeddings
            .backend()
            .delete_entity_record(entity_id)
            .await
            .map_err(|e| SearchError::Storage(e.to_string()))?;
        self.shared
            .embeddings
            .supersede(entity_id, &self.shared.config.model)
            .await?;

        {
            let mut vector_index = self.shared.vector.write().map_err(lock_poisoned)?;
            let mut lexical_index = self.shared.lexical.write().map_err(lock_poisoned)?;
            let mut registry = self.shared.registry.write().map_err(lock_poisoned)?;
            vector_index.remove(entity_id);
            lexical_index.remove(entity_id);
            registry.remove(&entity_id);
        }

        if let Ok(mut failures) = self.shared.failures.lock() {
            failures.remove(&entity_id);
        }
        if let Ok(mut corrupted) = self.shared.corrupted.lock() {
            corrupted.remove(&entity_id);
        }

        self.shared.cache.flush();
        info!("entity removed from index");
        Ok(())
    }

    // =========================================================================
    // Categories
    // =========================================================================

    /// Adds a category and persists it.
    pub async fn add_category(
        &self,
        id: CategoryId,
        parent: Option<CategoryId>,
    ) -> Result<Category, SearchError> {
        let node = {
            let mut taxonomy = self.shared.taxonomy.write().map_err(lock_poisoned)?;
            taxonomy
                .add(id, parent)
                .map_err(|e| SearchError::InvalidQuery(e.to_string()))?
        };
        self.shared
            .embeddings
            .backend()
            .put_categories(std::slice::from_ref(&node))
            .await
            .map_err(|e| SearchError::Storage(e.to_string()))?;
        self.shared.cache.flush();
        Ok(node)
    }

    /// Moves a category (with its subtree) under a new parent and persists
    /// every re-pathed node as one batch.
    pub async fn move_category(
        &self,
        id: CategoryId,
        new_parent: Option<CategoryId>,
    ) -> Result<(), SearchError> {
        let updated = {
            let mut taxonomy = self.shared.taxonomy.write().map_err(lock_poisoned)?;
            taxonomy
                .move_to(id, new_parent)
                .map_err(|e| SearchError::InvalidQuery(e.to_string()))?
        };
        self.shared
            .embeddings
            .backend()
            .put_categories(&updated)
            .await
            .map_err(|e| SearchError::Storage(e.to_string()))?;
        self.shared.cache.flush();
        Ok(())
    }

    /// Removes a leaf category and persists the deletion.
    pub async fn remove_category(&self, id: CategoryId) -> Result<(), SearchError> {
        {
            let mut taxonomy = self.shared.taxonomy.write().map_err(lock_poisoned)?;
            taxonomy
                .remove(id)
                .map_err(|e| SearchError::InvalidQuery(e.to_string()))?;
        }
        self.shared
            .embeddings
            .backend()
            .delete_category(id)
            .await
            .map_err(|e| SearchError::Storage(e.to_string()))?;
        self.shared.cache.flush();
        Ok(())
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Rebuilds the vector index when its tombstone ratio warrants it.
    ///
    /// Live embeddings are loaded from storage outside the lock; the
    /// rebuilt graph is swapped in under a brief exclusive phase. Returns
    /// the live entry count when compaction ran.
    pub async fn compact_if_needed(&self) -> Result<Option<usize>, SearchError> {
        let (needs, live) = {
            let vector = self.shared.vector.read().map_err(lock_poisoned)?;
            (vector.needs_compaction(), vector.live_entities())
        };
        if !needs {
            return Ok(None);
        }

        info!(live = live.len(), "compacting vector index");
        let mut entries = Vec::with_capacity(live.len());
        for entity_id in live {
            match self
                .shared
                .embeddings
                .get_active(entity_id, &self.shared.config.model)
                .await?
            {
                Some(record) => entries.push((entity_id, record.vector)),
                None => warn!(
                    entity = entity_id.as_u64(),
                    "live entity has no active embedding, dropping from rebuild"
                ),
            }
        }

        let count = {
            let mut vector = self.shared.vector.write().map_err(lock_poisoned)?;
            vector.rebuild(entries)?
        };
        info!(count, "vector index compaction complete");
        Ok(Some(count))
    }
}

impl From<StoreError> for SearchError {
    fn from(e: StoreError) -> Self {
        SearchError::Storage(e.to_string())
    }
}
