//! Hybrid search: vector similarity + lexical relevance, fused.
//!
//! - `types`: core types (EntityId, Entity, SearchQuery, SearchResult,
//!   SearchError, IndexHealth)
//! - `engine`: [`RetrievalEngine`] orchestrating both indices and fusion
//! - `vector`: HNSW-based cosine-similarity search
//! - `lexical`: field-weighted BM25 inverted index
//! - `fusion`: min-max normalization and weighted score fusion
//!
//! # Algorithm sketch
//!
//! Each query gathers over-fetched candidate sets from both indices,
//! min-max normalizes each set independently, combines them as
//! `vector_weight * norm_v + text_weight * norm_t` over the union, then
//! applies the category filter, score threshold, deterministic tie-break,
//! and limit. BM25 uses k1=1.2, b=0.75 by default; the vector index holds
//! HNSW's recall contract (tested) rather than exactness.

pub mod types;

pub mod vector;

#[doc(hidden)]
pub mod fusion;
#[doc(hidden)]
pub mod lexical;

mod engine;

pub use engine::RetrievalEngine;
pub use types::{
    validate_dimension, Entity, EntityId, FusionWeights, IndexHealth, SearchError, SearchQuery,
    SearchResult,
};
