//! Embedding record store: at-most-one-active enforcement over a backend.

use super::{EmbeddingRecord, ModelId};
use crate::search::{validate_dimension, EntityId, SearchError};
use crate::storage::IndexStore;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Persists one active embedding per (entity, model) pair.
///
/// The store does not touch the vector index; the indexing pipeline
/// sequences `put` and the index swap. Dimension validation happens here,
/// against the registered dimension of the record's model, so a
/// wrong-length vector never reaches persistence or the index.
pub struct EmbeddingRecordStore<S: IndexStore> {
    store: Arc<S>,
    /// Registered model dimensions. Records for unregistered models are
    /// rejected.
    models: HashMap<ModelId, usize>,
}

impl<S: IndexStore> EmbeddingRecordStore<S> {
    /// Creates a record store with a single registered model.
    pub fn new(store: Arc<S>, model: ModelId, dimension: usize) -> Self {
        let mut models = HashMap::new();
        models.insert(model, dimension);
        Self { store, models }
    }

    /// Registers an additional model and its dimension.
    pub fn register_model(&mut self, model: ModelId, dimension: usize) {
        self.models.insert(model, dimension);
    }

    /// The backend store.
    pub fn backend(&self) -> &Arc<S> {
        &self.store
    }

    /// Inserts or replaces the active record for (entity, model).
    ///
    /// # Errors
    ///
    /// [`SearchError::DimensionMismatch`] when the record's dimension (or
    /// its actual vector length) disagrees with the model's registered
    /// dimension; [`SearchError::Storage`] on backend failure.
    pub async fn put(&self, record: &EmbeddingRecord) -> Result<(), SearchError> {
        let registered = self.models.get(&record.model_id).copied().ok_or_else(|| {
            SearchError::Storage(format!("unregistered model: {}", record.model_id))
        })?;
        validate_dimension(registered, record.dimension)?;
        validate_dimension(registered, record.vector.len())?;

        self.store
            .put_active_embedding(record)
            .await
            .map_err(|e| SearchError::Storage(e.to_string()))?;
        debug!(
            entity = record.entity_id.as_u64(),
            model = %record.model_id,
            "stored active embedding"
        );
        Ok(())
    }

    /// The active record for (entity, model), if any.
    pub async fn get_active(
        &self,
        entity_id: EntityId,
        model: &ModelId,
    ) -> Result<Option<EmbeddingRecord>, SearchError> {
        self.store
            .get_active_embedding(entity_id, model)
            .await
            .map_err(|e| SearchError::Storage(e.to_string()))
    }

    /// Marks the current active record superseded. Idempotent.
    pub async fn supersede(
        &self,
        entity_id: EntityId,
        model: &ModelId,
    ) -> Result<(), SearchError> {
        self.store
            .supersede_embedding(entity_id, model)
            .await
            .map_err(|e| SearchError::Storage(e.to_string()))
    }

    /// All active records for a model, for index rebuild.
    pub async fn iter_active(
        &self,
        model: &ModelId,
    ) -> Result<Vec<EmbeddingRecord>, SearchError> {
        self.store
            .iter_active_embeddings(model)
            .await
            .map_err(|e| SearchError::Storage(e.to_string()))
    }
}
