//! # Lodestone
//!
//! Hybrid semantic retrieval engine for catalog entities.
//!
//! Entities are indexed two ways — dense embeddings in an HNSW vector index
//! and tokenized text in a field-weighted BM25 inverted index — and queries
//! fuse both candidate sets into a single ranked result via weighted min-max
//! score fusion. An indexing pipeline keeps the two indices consistent with
//! the catalog through content fingerprinting and idempotent, retryable
//! re-indexing steps.
//!
//! ## Modules
//!
//! - [`search`] - Hybrid search (HNSW vector + BM25 lexical + score fusion)
//! - [`embedding`] - Embedding records, fingerprints, and the embed client seam
//! - [`taxonomy`] - Materialized-path classification categories
//! - [`pipeline`] - Background indexing pipeline with retry/backoff
//! - [`storage`] - Pluggable persistence (in-memory, optional redb backend)
//! - [`cache`] - Query-result cache
//! - [`config`] - Engine configuration structs and defaults
//! - [`error`] - Error types for embedding, taxonomy, and pipeline operations
//! - [`metrics`] - Query latency tracking with rolling averages
//!
//! Embedding inference itself is out of scope: the engine consumes vectors
//! through the [`embedding::EmbedClient`] trait and never generates them.

pub mod cache;
pub mod config;
pub mod embedding;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod search;
pub mod storage;
pub mod taxonomy;

pub use config::EngineConfig;
pub use embedding::{ContentFingerprint, EmbedClient, EmbeddingRecord, ModelId};
pub use pipeline::{Catalog, ChangeEvent, IndexingPipeline, PipelineHandle};
pub use search::{
    Entity, EntityId, FusionWeights, IndexHealth, RetrievalEngine, SearchError, SearchQuery,
    SearchResult,
};
pub use storage::{IndexStore, InMemoryIndexStore, StoreError};
pub use taxonomy::{Category, CategoryId, Taxonomy};
