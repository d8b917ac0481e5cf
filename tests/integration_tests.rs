//! End-to-end tests for the indexing pipeline and hybrid search.
//!
//! These exercise the full workflow against the in-memory store:
//! fingerprinting -> embedding (mocked) -> record store -> index swap ->
//! fused search, plus the consistency properties: determinism, fingerprint
//! stability, at-most-one active embedding, crash recovery, category
//! filtering, deletion, and cache invalidation.

use async_trait::async_trait;
use lodestone::embedding::{l2_normalize, ContentFingerprint, EmbeddingRecord};
use lodestone::error::{CatalogError, EmbedError};
use lodestone::storage::IndexStore;
use lodestone::{
    Catalog, EmbedClient, Entity, EntityId, EngineConfig, FusionWeights, IndexingPipeline,
    InMemoryIndexStore, ModelId, RetrievalEngine, SearchError, SearchQuery,
};
use lodestone::taxonomy::CategoryId;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const DIM: usize = 8;

/// Deterministic pseudo-random vector for a text, so identical text always
/// embeds identically across engines and test phases.
fn seeded_vector(text: &str) -> Vec<f32> {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    (0..DIM as u64)
        .map(|i| {
            let mut hasher = DefaultHasher::new();
            text.hash(&mut hasher);
            i.hash(&mut hasher);
            (hasher.finish() as f32 / u64::MAX as f32) * 2.0 - 1.0
        })
        .collect()
}

/// Mock embed collaborator: deterministic vectors plus a call counter.
///
/// Embeds only the first line of the content - the entity name field - so
/// an entity and a bare-name query embed identically, giving tests a
/// predictable cosine similarity of 1.0 for exact-name matches.
#[derive(Default)]
struct CountingEmbedder {
    calls: AtomicUsize,
}

impl CountingEmbedder {
    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbedClient for CountingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let first_line = text.lines().next().unwrap_or("").trim();
        Ok(seeded_vector(first_line))
    }

    fn model(&self) -> ModelId {
        ModelId::new("mock-embed", "v1")
    }
}

/// Mock catalog collaborator backed by a mutable map.
#[derive(Default)]
struct MapCatalog {
    entities: Mutex<HashMap<u64, Entity>>,
}

impl MapCatalog {
    fn put(&self, entity: Entity) {
        self.entities
            .lock()
            .unwrap()
            .insert(entity.id.as_u64(), entity);
    }

    fn remove(&self, id: u64) {
        self.entities.lock().unwrap().remove(&id);
    }
}

#[async_trait]
impl Catalog for MapCatalog {
    async fn get_entity(&self, id: EntityId) -> Result<Option<Entity>, CatalogError> {
        Ok(self.entities.lock().unwrap().get(&id.as_u64()).cloned())
    }
}

fn make_entity(id: u64, name: &str, description: &str, categories: &[u64]) -> Entity {
    Entity {
        id: EntityId::from_u64(id),
        text_fields: vec![
            ("name".to_string(), name.to_string()),
            ("description".to_string(), description.to_string()),
        ],
        category_ids: categories
            .iter()
            .map(|c| CategoryId::from_u64(*c))
            .collect::<BTreeSet<_>>(),
        updated_at: 1,
    }
}

fn config() -> EngineConfig {
    let mut config = EngineConfig::new(ModelId::new("mock-embed", "v1"), DIM);
    config.retry.initial_backoff = Duration::from_millis(1);
    config.retry.max_backoff = Duration::from_millis(4);
    config
}

struct Fixture {
    store: Arc<InMemoryIndexStore>,
    embedder: Arc<CountingEmbedder>,
    catalog: Arc<MapCatalog>,
    engine: RetrievalEngine<InMemoryIndexStore>,
    pipeline: IndexingPipeline<InMemoryIndexStore, MapCatalog>,
}

fn fixture() -> Fixture {
    let store = Arc::new(InMemoryIndexStore::new());
    let embedder = Arc::new(CountingEmbedder::default());
    let catalog = Arc::new(MapCatalog::default());
    let engine = RetrievalEngine::new(store.clone(), embedder.clone(), config());
    let pipeline = IndexingPipeline::new(engine.clone(), catalog.clone());
    Fixture {
        store,
        embedder,
        catalog,
        engine,
        pipeline,
    }
}

/// Indexes an entity through the pipeline (catalog put + reindex).
async fn index(fx: &Fixture, entity: Entity) {
    let id = entity.id;
    fx.catalog.put(entity);
    fx.pipeline.reindex(id).await.unwrap();
}

// ============================================================================
// End-to-end search
// ============================================================================

#[tokio::test]
async fn index_and_search_ranks_exact_match_first() {
    let fx = fixture();
    index(&fx, make_entity(1, "steel rod", "cold rolled carbon steel", &[])).await;
    index(&fx, make_entity(2, "copper wire", "annealed copper conductor", &[])).await;
    index(&fx, make_entity(3, "oak plank", "kiln dried hardwood", &[])).await;

    let results = fx
        .engine
        .search(&SearchQuery::text("steel rod", 10))
        .await
        .unwrap();

    assert!(!results.is_empty());
    assert_eq!(results[0].entity_id, EntityId::from_u64(1));
    // Both component scores are reported on the top hit.
    assert!(results[0].vector_score > 0.99, "identical text embeds identically");
    assert!(results[0].text_score > 0.0);
}

#[tokio::test]
async fn text_only_and_vector_only_queries() {
    let fx = fixture();
    index(&fx, make_entity(1, "steel rod", "", &[])).await;
    index(&fx, make_entity(2, "copper wire", "", &[])).await;

    // Text-only: vector weight zero.
    let mut query = SearchQuery::text("steel", 10);
    query.weights = FusionWeights {
        vector: 0.0,
        text: 1.0,
    };
    let results = fx.engine.search(&query).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].entity_id, EntityId::from_u64(1));
    assert_eq!(results[0].vector_score, 0.0);

    // Vector-only: no text at all, caller-supplied query vector.
    let query = SearchQuery {
        text: None,
        vector: Some(seeded_vector("steel rod")),
        category_filter: None,
        weights: FusionWeights {
            vector: 1.0,
            text: 1.0, // forced to 0 because text is absent
        },
        limit: 10,
        min_score: None,
    };
    let results = fx.engine.search(&query).await.unwrap();
    assert_eq!(results[0].entity_id, EntityId::from_u64(1));
    assert_eq!(results[0].text_score, 0.0);
}

#[tokio::test]
async fn min_score_and_limit_are_applied() {
    let fx = fixture();
    for i in 1..=5 {
        index(&fx, make_entity(i, "steel product", "grade variant", &[])).await;
    }

    let mut query = SearchQuery::text("steel", 2);
    let results = fx.engine.search(&query).await.unwrap();
    assert_eq!(results.len(), 2);

    query.limit = 10;
    query.min_score = Some(2.0); // above any possible fused score
    let results = fx.engine.search(&query).await.unwrap();
    assert!(results.is_empty());
}

// ============================================================================
// Determinism
// ============================================================================

#[tokio::test]
async fn repeated_searches_return_identical_ordering() {
    let fx = fixture();
    // Two entities with identical content produce artificially equal
    // scores; the tie must break by ascending entity id.
    index(&fx, make_entity(9, "steel rod", "cold rolled", &[])).await;
    index(&fx, make_entity(5, "steel rod", "cold rolled", &[])).await;
    index(&fx, make_entity(7, "copper wire", "annealed", &[])).await;

    let query = SearchQuery::text("steel rod", 10);
    let first = fx.engine.search(&query).await.unwrap();
    assert_eq!(first[0].entity_id, EntityId::from_u64(5));
    assert_eq!(first[1].entity_id, EntityId::from_u64(9));
    assert_eq!(first[0].fused_score, first[1].fused_score);

    for _ in 0..5 {
        let again = fx.engine.search(&query).await.unwrap();
        assert_eq!(first, again);
    }
}

// ============================================================================
// Fingerprint stability and embedding lifecycle
// ============================================================================

#[tokio::test]
async fn unchanged_entity_never_reembeds() {
    let fx = fixture();
    let entity = make_entity(1, "steel rod", "cold rolled", &[]);
    index(&fx, entity.clone()).await;
    assert_eq!(fx.embedder.call_count(), 1);

    // Re-submit with a new version stamp but identical content.
    let mut touched = entity;
    touched.updated_at = 99;
    index(&fx, touched).await;
    assert_eq!(fx.embedder.call_count(), 1, "second submission must not embed");
}

#[tokio::test]
async fn content_change_reembeds_and_supersedes() {
    let fx = fixture();
    let model = ModelId::new("mock-embed", "v1");
    let id = EntityId::from_u64(1);

    for (i, description) in ["first", "second", "third", "fourth"].iter().enumerate() {
        index(&fx, make_entity(1, "steel rod", description, &[])).await;
        assert_eq!(fx.embedder.call_count(), i + 1);
    }

    // Exactly one active record; the other three retained as superseded.
    let active = fx.store.get_active_embedding(id, &model).await.unwrap();
    assert!(active.is_some());
    assert_eq!(fx.store.superseded_count(id, &model).await.unwrap(), 3);
    assert_eq!(fx.store.iter_active_embeddings(&model).await.unwrap().len(), 1);
}

#[tokio::test]
async fn category_change_alone_triggers_reembed() {
    let fx = fixture();
    index(&fx, make_entity(1, "steel rod", "cold rolled", &[1])).await;
    assert_eq!(fx.embedder.call_count(), 1);

    // Same text, different category set: fingerprint covers categories.
    index(&fx, make_entity(1, "steel rod", "cold rolled", &[1, 2])).await;
    assert_eq!(fx.embedder.call_count(), 2);
}

// ============================================================================
// Category filtering
// ============================================================================

#[tokio::test]
async fn filter_includes_descendants_and_excludes_siblings() {
    let fx = fixture();
    // root -> child -> grandchild, plus a sibling of child under root.
    let root = CategoryId::from_u64(1);
    let child = CategoryId::from_u64(2);
    let grandchild = CategoryId::from_u64(3);
    let sibling = CategoryId::from_u64(4);
    fx.engine.add_category(root, None).await.unwrap();
    fx.engine.add_category(child, Some(root)).await.unwrap();
    fx.engine
        .add_category(grandchild, Some(child))
        .await
        .unwrap();
    fx.engine.add_category(sibling, Some(root)).await.unwrap();

    // Entity tagged only with the grandchild.
    index(&fx, make_entity(1, "steel rod", "cold rolled", &[3])).await;

    let mut query = SearchQuery::text("steel", 10);

    // Filtering by the root must include it (ancestor inclusion).
    query.category_filter = Some([root].into_iter().collect());
    let results = fx.engine.search(&query).await.unwrap();
    assert_eq!(results.len(), 1);

    // Filtering by the child's sibling must exclude it.
    query.category_filter = Some([sibling].into_iter().collect());
    let results = fx.engine.search(&query).await.unwrap();
    assert!(results.is_empty());

    // Unknown category id is an invalid query, not an empty result.
    query.category_filter = Some([CategoryId::from_u64(99)].into_iter().collect());
    assert!(matches!(
        fx.engine.search(&query).await,
        Err(SearchError::InvalidQuery(_))
    ));
}

#[tokio::test]
async fn category_move_is_reflected_in_filtering() {
    let fx = fixture();
    let a = CategoryId::from_u64(1);
    let b = CategoryId::from_u64(2);
    let leaf = CategoryId::from_u64(3);
    fx.engine.add_category(a, None).await.unwrap();
    fx.engine.add_category(b, None).await.unwrap();
    fx.engine.add_category(leaf, Some(a)).await.unwrap();

    index(&fx, make_entity(1, "steel rod", "", &[3])).await;

    let mut query = SearchQuery::text("steel", 10);
    query.category_filter = Some([b].into_iter().collect());
    assert!(fx.engine.search(&query).await.unwrap().is_empty());

    // Move the leaf under b; the same filter now matches.
    fx.engine.move_category(leaf, Some(b)).await.unwrap();
    assert_eq!(fx.engine.search(&query).await.unwrap().len(), 1);
}

// ============================================================================
// Crash recovery
// ============================================================================

#[tokio::test]
async fn recovery_after_crash_between_put_and_upsert() {
    let store = Arc::new(InMemoryIndexStore::new());
    let embedder = Arc::new(CountingEmbedder::default());
    let catalog = Arc::new(MapCatalog::default());
    let model = ModelId::new("mock-embed", "v1");

    let entity = make_entity(1, "steel rod", "cold rolled", &[]);
    catalog.put(entity.clone());

    // Simulate a process that crashed after EmbeddingRecordStore.put but
    // before the index swap: the active record exists, the entity record
    // (the applied-fingerprint marker) does not.
    let fingerprint = ContentFingerprint::of_entity(&entity);
    // The vector the crashed pipeline would have stored: the mock embeds
    // the name line.
    let vector = l2_normalize(seeded_vector("steel rod")).unwrap();
    let record = EmbeddingRecord::new(entity.id, model.clone(), vector, fingerprint, None);
    store.put_active_embedding(&record).await.unwrap();

    // Load detects the partial application.
    let (engine, pending) =
        RetrievalEngine::try_load_or_new(store.clone(), embedder.clone(), config())
            .await
            .unwrap();
    assert_eq!(pending, vec![EntityId::from_u64(1)]);
    assert_eq!(engine.health().pending_reindex_count, 1);

    // Re-running the pipeline converges without a duplicate embedding
    // request: the stored fingerprint matches the entity content.
    let pipeline = IndexingPipeline::new(engine.clone(), catalog.clone());
    pipeline.recover(pending).await.unwrap();
    assert_eq!(embedder.call_count(), 0, "recovery must not re-embed");

    let id = EntityId::from_u64(1);
    assert!(store.get_active_embedding(id, &model).await.unwrap().is_some());
    assert_eq!(store.superseded_count(id, &model).await.unwrap(), 0);
    assert_eq!(engine.health().pending_reindex_count, 0);

    // The recovered entity is searchable (one embed call for the query).
    let results = engine
        .search(&SearchQuery::text("steel rod", 10))
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].entity_id, id);
}

#[tokio::test]
async fn rebuild_from_store_restores_search_without_reembedding() {
    let store = Arc::new(InMemoryIndexStore::new());
    let embedder = Arc::new(CountingEmbedder::default());
    let catalog = Arc::new(MapCatalog::default());

    {
        let engine = RetrievalEngine::new(store.clone(), embedder.clone(), config());
        let pipeline = IndexingPipeline::new(engine, catalog.clone());
        catalog.put(make_entity(1, "steel rod", "cold rolled", &[]));
        catalog.put(make_entity(2, "copper wire", "annealed", &[]));
        pipeline.reindex(EntityId::from_u64(1)).await.unwrap();
        pipeline.reindex(EntityId::from_u64(2)).await.unwrap();
    }
    let embeds_after_indexing = embedder.call_count();
    assert_eq!(embeds_after_indexing, 2);

    // "Restart": a fresh engine over the same store.
    let (engine, pending) =
        RetrievalEngine::try_load_or_new(store.clone(), embedder.clone(), config())
            .await
            .unwrap();
    assert!(pending.is_empty());
    assert_eq!(engine.len(), 2);

    let results = engine
        .search(&SearchQuery::text("steel rod", 10))
        .await
        .unwrap();
    assert_eq!(results[0].entity_id, EntityId::from_u64(1));
    // Only the query itself was embedded.
    assert_eq!(embedder.call_count(), embeds_after_indexing + 1);
}

// ============================================================================
// Deletion
// ============================================================================

#[tokio::test]
async fn deleted_entity_never_returns() {
    let fx = fixture();
    let model = ModelId::new("mock-embed", "v1");
    index(&fx, make_entity(1, "steel rod", "cold rolled", &[])).await;
    index(&fx, make_entity(2, "steel wire", "drawn", &[])).await;

    fx.catalog.remove(1);
    fx.pipeline.delete(EntityId::from_u64(1)).await.unwrap();

    let results = fx
        .engine
        .search(&SearchQuery::text("steel rod", 10))
        .await
        .unwrap();
    assert!(!results.iter().any(|r| r.entity_id == EntityId::from_u64(1)));
    assert_eq!(fx.engine.len(), 1);

    // Active embedding superseded, entity record gone.
    let id = EntityId::from_u64(1);
    assert!(fx.store.get_active_embedding(id, &model).await.unwrap().is_none());
    assert!(fx.store.get_entity_record(id).await.unwrap().is_none());

    // Vector-only and text-only paths both exclude it too.
    let query = SearchQuery {
        text: None,
        vector: Some(seeded_vector("steel rod")),
        category_filter: None,
        weights: FusionWeights {
            vector: 1.0,
            text: 0.0,
        },
        limit: 10,
        min_score: None,
    };
    let results = fx.engine.search(&query).await.unwrap();
    assert!(!results.iter().any(|r| r.entity_id == id));
}

// ============================================================================
// Cache invalidation
// ============================================================================

#[tokio::test]
async fn entity_update_invalidates_cached_results() {
    let fx = fixture();
    index(&fx, make_entity(1, "steel rod", "cold rolled", &[])).await;

    let query = SearchQuery::text("steel", 10);
    let before = fx.engine.search(&query).await.unwrap();
    assert_eq!(before.len(), 1);

    // The entity stops mentioning steel entirely.
    index(&fx, make_entity(1, "copper wire", "annealed", &[])).await;

    let after = fx.engine.search(&query).await.unwrap();
    assert!(
        after.is_empty() || after[0].text_score == 0.0,
        "stale cached hit survived an index update: {after:?}"
    );
}

// ============================================================================
// Failure surfacing
// ============================================================================

#[tokio::test]
async fn embed_failure_surfaces_in_health_and_blocks_indexing() {
    struct FailingEmbedder;

    #[async_trait]
    impl EmbedClient for FailingEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbedError> {
            Err(EmbedError::Transient("model serving down".into()))
        }

        fn model(&self) -> ModelId {
            ModelId::new("mock-embed", "v1")
        }
    }

    let store = Arc::new(InMemoryIndexStore::new());
    let catalog = Arc::new(MapCatalog::default());
    let engine = RetrievalEngine::new(store, Arc::new(FailingEmbedder), config());
    let pipeline = IndexingPipeline::new(engine.clone(), catalog.clone());

    catalog.put(make_entity(1, "steel rod", "", &[]));
    assert!(pipeline.reindex(EntityId::from_u64(1)).await.is_err());

    let health = engine.health();
    assert_eq!(health.pending_reindex_count, 1);
    assert_eq!(health.failed_count, 1);
    // No fabricated vector was indexed in place of the real embedding.
    assert_eq!(health.index_size, 0);
}

#[tokio::test]
async fn health_reports_index_size_and_latency() {
    let fx = fixture();
    index(&fx, make_entity(1, "steel rod", "", &[])).await;
    index(&fx, make_entity(2, "copper wire", "", &[])).await;

    fx.engine
        .search(&SearchQuery::text("steel", 10))
        .await
        .unwrap();

    let health = fx.engine.health();
    assert_eq!(health.index_size, 2);
    assert_eq!(health.pending_reindex_count, 0);
    assert_eq!(health.failed_count, 0);
    assert!(health.avg_query_latency_ms >= 0.0);
}
