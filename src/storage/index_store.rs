//! Store trait and the in-memory reference implementation.

use crate::embedding::{ContentFingerprint, EmbeddingRecord, ModelId};
use crate::search::{Entity, EntityId};
use crate::taxonomy::{Category, CategoryId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Key/record not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// I/O error (filesystem and friends).
    #[error("I/O error: {0}")]
    IoError(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Database error.
    #[error("database error: {0}")]
    DatabaseError(String),

    /// Lock poisoned by a panicked writer.
    #[error("store lock poisoned")]
    Poisoned,
}

/// A fully indexed entity as persisted: the catalog content the indices were
/// built from plus the fingerprint that content hashed to when the index
/// swap completed.
///
/// The `applied_fingerprint` is the durable marker of pipeline completion:
/// an active embedding record whose fingerprint differs from it means the
/// entity crashed mid-pipeline and is `ReindexPending`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedEntityRecord {
    /// The indexed entity (text fields and category ids).
    pub entity: Entity,
    /// Fingerprint the in-memory indices were last fully updated to.
    pub applied_fingerprint: ContentFingerprint,
}

/// Persistence backend for embeddings, indexed entities, and categories.
///
/// Each operation is self-contained; the pipeline sequences them and
/// recovers from partial application via fingerprint comparison, so no
/// cross-operation transaction primitive is exposed. The one exception is
/// [`put_categories`](IndexStore::put_categories), which must write its
/// batch atomically because a half-applied subtree re-path is a correctness
/// violation.
#[async_trait::async_trait]
pub trait IndexStore: Send + Sync + 'static {
    // =========================================================================
    // Embedding records
    // =========================================================================

    /// Retrieves the active embedding record for (entity, model).
    async fn get_active_embedding(
        &self,
        entity_id: EntityId,
        model: &ModelId,
    ) -> Result<Option<EmbeddingRecord>, StoreError>;

    /// Stores `record` as the active embedding for its (entity, model) pair.
    ///
    /// Any previously active record is retained as superseded - never left
    /// ambiguous.
    async fn put_active_embedding(&self, record: &EmbeddingRecord) -> Result<(), StoreError>;

    /// Marks the active record for (entity, model) superseded. Idempotent;
    /// no-op when no active record exists.
    async fn supersede_embedding(
        &self,
        entity_id: EntityId,
        model: &ModelId,
    ) -> Result<(), StoreError>;

    /// All active embedding records for a model, for index rebuild at load.
    async fn iter_active_embeddings(
        &self,
        model: &ModelId,
    ) -> Result<Vec<EmbeddingRecord>, StoreError>;

    /// Number of superseded records retained for (entity, model).
    async fn superseded_count(
        &self,
        entity_id: EntityId,
        model: &ModelId,
    ) -> Result<usize, StoreError>;

    // =========================================================================
    // Indexed entities
    // =========================================================================

    /// Retrieves the indexed-entity record.
    async fn get_entity_record(
        &self,
        entity_id: EntityId,
    ) -> Result<Option<IndexedEntityRecord>, StoreError>;

    /// Stores an indexed-entity record, overwriting any previous one.
    async fn put_entity_record(&self, record: &IndexedEntityRecord) -> Result<(), StoreError>;

    /// Deletes an indexed-entity record. Ok even if absent.
    async fn delete_entity_record(&self, entity_id: EntityId) -> Result<(), StoreError>;

    /// All indexed-entity records, for index rebuild at load.
    async fn iter_entity_records(&self) -> Result<Vec<IndexedEntityRecord>, StoreError>;

    /// Number of indexed entities.
    async fn entity_count(&self) -> Result<usize, StoreError>;

    // =========================================================================
    // Category paths
    // =========================================================================

    /// Writes a batch of categories atomically.
    ///
    /// Category moves re-path whole subtrees; all updated nodes land in one
    /// batch so a reader of the store never sees a partially re-pathed tree.
    async fn put_categories(&self, categories: &[Category]) -> Result<(), StoreError>;

    /// Deletes a category. Ok even if absent.
    async fn delete_category(&self, id: CategoryId) -> Result<(), StoreError>;

    /// All persisted categories.
    async fn list_categories(&self) -> Result<Vec<Category>, StoreError>;

    // =========================================================================
    // Utility
    // =========================================================================

    /// Clears all data.
    async fn clear(&self) -> Result<(), StoreError>;
}

/// In-memory store for tests and ephemeral deployments.
#[derive(Default)]
pub struct InMemoryIndexStore {
    /// (entity, model key) -> active record
    active: RwLock<HashMap<(u64, String), EmbeddingRecord>>,
    /// (entity, model key) -> superseded records, oldest first
    superseded: RwLock<HashMap<(u64, String), Vec<EmbeddingRecord>>>,
    entities: RwLock<HashMap<u64, IndexedEntityRecord>>,
    categories: RwLock<HashMap<u64, Category>>,
}

impl InMemoryIndexStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn key(entity_id: EntityId, model: &ModelId) -> (u64, String) {
        (entity_id.as_u64(), model.key())
    }
}

#[async_trait::async_trait]
impl IndexStore for InMemoryIndexStore {
    async fn get_active_embedding(
        &self,
        entity_id: EntityId,
        model: &ModelId,
    ) -> Result<Option<EmbeddingRecord>, StoreError> {
        let active = self.active.read().map_err(|_| StoreError::Poisoned)?;
        Ok(active.get(&Self::key(entity_id, model)).cloned())
    }

    async fn put_active_embedding(&self, record: &EmbeddingRecord) -> Result<(), StoreError> {
        let key = Self::key(record.entity_id, &record.model_id);
        let mut active = self.active.write().map_err(|_| StoreError::Poisoned)?;
        let mut superseded = self.superseded.write().map_err(|_| StoreError::Poisoned)?;
        if let Some(old) = active.insert(key.clone(), record.clone()) {
            superseded.entry(key).or_default().push(old);
        }
        Ok(())
    }

    async fn supersede_embedding(
        &self,
        entity_id: EntityId,
        model: &ModelId,
    ) -> Result<(), StoreError> {
        let key = Self::key(entity_id, model);
        let mut active = self.active.write().map_err(|_| StoreError::Poisoned)?;
        let mut superseded = self.superseded.write().map_err(|_| StoreError::Poisoned)?;
        if let Some(old) = active.remove(&key) {
            superseded.entry(key).or_default().push(old);
        }
        Ok(())
    }

    async fn iter_active_embeddings(
        &self,
        model: &ModelId,
    ) -> Result<Vec<EmbeddingRecord>, StoreError> {
        let active = self.active.read().map_err(|_| StoreError::Poisoned)?;
        let model_key = model.key();
        Ok(active
            .iter()
            .filter(|((_, m), _)| *m == model_key)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn superseded_count(
        &self,
        entity_id: EntityId,
        model: &ModelId,
    ) -> Result<usize, StoreError> {
        let superseded = self.superseded.read().map_err(|_| StoreError::Poisoned)?;
        Ok(superseded
            .get(&Self::key(entity_id, model))
            .map_or(0, Vec::len))
    }

    async fn get_entity_record(
        &self,
        entity_id: EntityId,
    ) -> Result<Option<IndexedEntityRecord>, StoreError> {
        let entities = self.entities.read().map_err(|_| StoreError::Poisoned)?;
        Ok(entities.get(&entity_id.as_u64()).cloned())
    }

    async fn put_entity_record(&self, record: &IndexedEntityRecord) -> Result<(), StoreError> {
        let mut entities = self.entities.write().map_err(|_| StoreError::Poisoned)?;
        entities.insert(record.entity.id.as_u64(), record.clone());
        Ok(())
    }

    async fn delete_entity_record(&self, entity_id: EntityId) -> Result<(), StoreError> {
        let mut entities = self.entities.write().map_err(|_| StoreError::Poisoned)?;
        entities.remove(&entity_id.as_u64());
        Ok(())
    }

    async fn iter_entity_records(&self) -> Result<Vec<IndexedEntityRecord>, StoreError> {
        let entities = self.entities.read().map_err(|_| StoreError::Poisoned)?;
        Ok(entities.values().cloned().collect())
    }

    async fn entity_count(&self) -> Result<usize, StoreError> {
        let entities = self.entities.read().map_err(|_| StoreError::Poisoned)?;
        Ok(entities.len())
    }

    async fn put_categories(&self, categories: &[Category]) -> Result<(), StoreError> {
        // Single write-lock acquisition makes the batch atomic.
        let mut stored = self.categories.write().map_err(|_| StoreError::Poisoned)?;
        for cat in categories {
            stored.insert(cat.id.as_u64(), cat.clone());
        }
        Ok(())
    }

    async fn delete_category(&self, id: CategoryId) -> Result<(), StoreError> {
        let mut stored = self.categories.write().map_err(|_| StoreError::Poisoned)?;
        stored.remove(&id.as_u64());
        Ok(())
    }

    async fn list_categories(&self) -> Result<Vec<Category>, StoreError> {
        let stored = self.categories.read().map_err(|_| StoreError::Poisoned)?;
        Ok(stored.values().cloned().collect())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.active.write().map_err(|_| StoreError::Poisoned)?.clear();
        self.superseded
            .write()
            .map_err(|_| StoreError::Poisoned)?
            .clear();
        self.entities
            .write()
            .map_err(|_| StoreError::Poisoned)?
            .clear();
        self.categories
            .write()
            .map_err(|_| StoreError::Poisoned)?
            .clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::ContentFingerprint;
    use std::collections::BTreeSet;

    fn record(entity: u64, fp: &str) -> EmbeddingRecord {
        EmbeddingRecord {
            entity_id: EntityId::from_u64(entity),
            model_id: ModelId::new("m", "v1"),
            dimension: 2,
            vector: vec![1.0, 0.0],
            fingerprint: fp_of(fp),
            quality_score: None,
            created_at: 0,
        }
    }

    fn fp_of(text: &str) -> ContentFingerprint {
        ContentFingerprint::of_entity(&Entity {
            id: EntityId::from_u64(0),
            text_fields: vec![("t".into(), text.into())],
            category_ids: BTreeSet::new(),
            updated_at: 0,
        })
    }

    #[tokio::test]
    async fn put_replaces_active_and_retains_superseded() {
        let store = InMemoryIndexStore::new();
        let model = ModelId::new("m", "v1");
        let id = EntityId::from_u64(1);

        store.put_active_embedding(&record(1, "a")).await.unwrap();
        store.put_active_embedding(&record(1, "b")).await.unwrap();
        store.put_active_embedding(&record(1, "c")).await.unwrap();

        let active = store.get_active_embedding(id, &model).await.unwrap().unwrap();
        assert_eq!(active.fingerprint, fp_of("c"));
        assert_eq!(store.superseded_count(id, &model).await.unwrap(), 2);
        assert_eq!(store.iter_active_embeddings(&model).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn supersede_is_idempotent() {
        let store = InMemoryIndexStore::new();
        let model = ModelId::new("m", "v1");
        let id = EntityId::from_u64(1);

        store.put_active_embedding(&record(1, "a")).await.unwrap();
        store.supersede_embedding(id, &model).await.unwrap();
        store.supersede_embedding(id, &model).await.unwrap();

        assert!(store.get_active_embedding(id, &model).await.unwrap().is_none());
        assert_eq!(store.superseded_count(id, &model).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn models_are_isolated() {
        let store = InMemoryIndexStore::new();
        let v1 = ModelId::new("m", "v1");
        let v2 = ModelId::new("m", "v2");
        let id = EntityId::from_u64(1);

        store.put_active_embedding(&record(1, "a")).await.unwrap();
        let mut r2 = record(1, "a");
        r2.model_id = v2.clone();
        store.put_active_embedding(&r2).await.unwrap();

        assert!(store.get_active_embedding(id, &v1).await.unwrap().is_some());
        assert!(store.get_active_embedding(id, &v2).await.unwrap().is_some());
        assert_eq!(store.iter_active_embeddings(&v1).await.unwrap().len(), 1);
    }
}
