//! Pluggable persistence for the retrieval engine.
//!
//! The [`IndexStore`] trait abstracts the logical storage layout: an
//! embeddings table keyed by (entity, model) with an active flag, an
//! indexed-entity table holding the text and categories both in-memory
//! indices are rebuilt from, and a category-paths table. Implementations:
//!
//! - [`InMemoryIndexStore`] - HashMap-backed, for tests and ephemeral use
//! - `RedbIndexStore` - redb B-tree database, behind the `redb-store` feature

mod index_store;

#[cfg(feature = "redb-store")]
mod redb_store;

pub use index_store::{IndexStore, IndexedEntityRecord, InMemoryIndexStore, StoreError};

#[cfg(feature = "redb-store")]
pub use redb_store::RedbIndexStore;
