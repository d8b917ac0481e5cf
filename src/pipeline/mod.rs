//! Consistency and indexing pipeline.
//!
//! Entity-change events flow through a bounded queue into a background
//! worker that re-indexes one entity at a time per event: fingerprint →
//! embed (only when the fingerprint changed) → record store put → atomic
//! index swap → durable applied-fingerprint marker → cache flush. Every
//! step is idempotent given the same fingerprint, so a crash between steps
//! leaves the entity `ReindexPending` and a retry converges without
//! duplicate embedding requests.
//!
//! Per-entity state machine: `Unindexed → Embedding → Indexed →
//! (ReindexPending | Deleted)`. The `pending` set in engine health covers
//! queued, in-flight, and failed-awaiting-retry entities; permanent
//! failures additionally land in the `failures` map.

use crate::embedding::{ContentFingerprint, EmbeddingRecord};
use crate::error::{CatalogError, EmbedError, PipelineError};
use crate::search::{Entity, EntityId, RetrievalEngine};
use crate::storage::IndexStore;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, instrument, warn};

/// Catalog/storage collaborator: the source of truth for entity content.
#[async_trait]
pub trait Catalog: Send + Sync + 'static {
    /// Fetches an entity by id. `Ok(None)` means the entity no longer
    /// exists (distinct from a lookup failure).
    async fn get_entity(&self, id: EntityId) -> Result<Option<Entity>, CatalogError>;
}

/// An entity-change notification from the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEvent {
    /// The entity was created or updated.
    Changed(EntityId),
    /// The entity was deleted.
    Deleted(EntityId),
}

impl ChangeEvent {
    fn entity_id(&self) -> EntityId {
        match self {
            ChangeEvent::Changed(id) | ChangeEvent::Deleted(id) => *id,
        }
    }
}

/// Sender half of the pipeline: the catalog pushes change events here.
///
/// The queue is bounded; senders back-pressure when the worker falls
/// behind rather than buffering unboundedly.
pub struct PipelineHandle<S: IndexStore> {
    tx: mpsc::Sender<ChangeEvent>,
    engine: RetrievalEngine<S>,
}

impl<S: IndexStore> Clone for PipelineHandle<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            engine: self.engine.clone(),
        }
    }
}

impl<S: IndexStore> PipelineHandle<S> {
    /// Notifies the pipeline that an entity was created or updated.
    pub async fn entity_changed(&self, id: EntityId) -> Result<(), PipelineError> {
        self.submit(ChangeEvent::Changed(id)).await
    }

    /// Notifies the pipeline that an entity was deleted.
    pub async fn entity_deleted(&self, id: EntityId) -> Result<(), PipelineError> {
        self.submit(ChangeEvent::Deleted(id)).await
    }

    /// Enqueues a change event.
    pub async fn submit(&self, event: ChangeEvent) -> Result<(), PipelineError> {
        // Marked pending on enqueue so health() counts queued work.
        if let Ok(mut pending) = self.engine.shared.pending.lock() {
            pending.insert(event.entity_id());
        }
        self.tx
            .send(event)
            .await
            .map_err(|_| PipelineError::QueueClosed)
    }
}

/// Background indexing pipeline.
///
/// One worker processes events in order; indexing different entities is
/// independent, so additional throughput comes from running pipelines per
/// logical partition, not from reordering within one.
pub struct IndexingPipeline<S: IndexStore, C: Catalog> {
    engine: RetrievalEngine<S>,
    catalog: Arc<C>,
}

impl<S: IndexStore, C: Catalog> IndexingPipeline<S, C> {
    /// Creates a pipeline over an engine and its catalog collaborator.
    pub fn new(engine: RetrievalEngine<S>, catalog: Arc<C>) -> Self {
        Self { engine, catalog }
    }

    /// Spawns the worker task, returning the event-sender handle and the
    /// worker's join handle.
    pub fn spawn(self) -> (PipelineHandle<S>, JoinHandle<()>) {
        let capacity = self.engine.shared.config.queue_capacity;
        let (tx, mut rx) = mpsc::channel::<ChangeEvent>(capacity);
        let handle = PipelineHandle {
            tx,
            engine: self.engine.clone(),
        };

        let worker = tokio::spawn(async move {
            info!("indexing pipeline worker started");
            while let Some(event) = rx.recv().await {
                match event {
                    ChangeEvent::Changed(id) => {
                        if let Err(e) = self.reindex(id).await {
                            warn!(entity = id.as_u64(), error = %e, "reindex failed");
                        }
                    }
                    ChangeEvent::Deleted(id) => {
                        if let Err(e) = self.delete(id).await {
                            warn!(entity = id.as_u64(), error = %e, "delete failed");
                        }
                    }
                }
            }
            info!("indexing pipeline worker stopped");
        });

        (handle, worker)
    }

    /// Re-enqueues entities detected as `ReindexPending` at engine load.
    pub async fn recover(&self, pending: Vec<EntityId>) -> Result<(), PipelineError> {
        for id in pending {
            self.reindex(id).await?;
        }
        Ok(())
    }

    /// Re-indexes one entity now. Also the manual repair trigger for admin
    /// tooling.
    ///
    /// On failure the entity stays `ReindexPending` with the failure
    /// recorded for `health()`; a later retry resumes from the last
    /// completed step because every step is idempotent under the stored
    /// fingerprint.
    #[instrument(skip(self), fields(entity = id.as_u64()))]
    pub async fn reindex(&self, id: EntityId) -> Result<(), PipelineError> {
        if let Ok(mut pending) = self.engine.shared.pending.lock() {
            pending.insert(id);
        }

        let result = self.reindex_inner(id).await;
        match &result {
            Ok(()) => {
                if let Ok(mut pending) = self.engine.shared.pending.lock() {
                    pending.remove(&id);
                }
                if let Ok(mut failures) = self.engine.shared.failures.lock() {
                    failures.remove(&id);
                }
            }
            Err(e) => {
                // Entity remains pending; the failure is surfaced until a
                // retry succeeds or the entity is deleted.
                if let Ok(mut failures) = self.engine.shared.failures.lock() {
                    failures.insert(id, e.to_string());
                }
            }
        }
        result
    }

    async fn reindex_inner(&self, id: EntityId) -> Result<(), PipelineError> {
        let entity = self.catalog.get_entity(id).await?;
        let Some(entity) = entity else {
            // The change event raced a deletion; converge on removal.
            debug!("entity gone from catalog, treating as delete");
            self.engine.remove_entity(id).await?;
            return Ok(());
        };

        let fingerprint = ContentFingerprint::of_entity(&entity);
        let model = self.engine.shared.config.model.clone();
        let active = self.engine.shared.embeddings.get_active(id, &model).await?;

        let vector_in_index = self
            .engine
            .shared
            .vector
            .read()
            .map(|v| v.contains(id))
            .unwrap_or(false);

        let vector = match &active {
            Some(record) if record.fingerprint == fingerprint => {
                // Unchanged content: no embedding request. The vector is
                // re-applied only if the index lost it (crash recovery);
                // lexical postings refresh either way.
                debug!("fingerprint unchanged, skipping embed");
                if vector_in_index {
                    None
                } else {
                    Some(record.vector.clone())
                }
            }
            _ => {
                let text = embedding_text(&entity);
                let raw = self.embed_with_retry(&text).await?;
                let normalized = crate::embedding::l2_normalize(raw)?;
                let record = EmbeddingRecord::new(
                    id,
                    model.clone(),
                    normalized.clone(),
                    fingerprint.clone(),
                    None,
                );
                // Dimension-validated put; the previous active record is
                // superseded in the same step.
                self.engine.shared.embeddings.put(&record).await?;
                Some(normalized)
            }
        };

        self.engine
            .apply_index_swap(&entity, &fingerprint, vector)
            .await?;
        Ok(())
    }

    /// Removes an entity everywhere: vector index, lexical index, embedding
    /// records, entity record, health bookkeeping, cache.
    #[instrument(skip(self), fields(entity = id.as_u64()))]
    pub async fn delete(&self, id: EntityId) -> Result<(), PipelineError> {
        let result = self.engine.remove_entity(id).await;
        if let Ok(mut pending) = self.engine.shared.pending.lock() {
            pending.remove(&id);
        }
        result.map_err(PipelineError::from)
    }

    /// Calls the embed collaborator with a timeout, retrying transient
    /// failures with bounded exponential backoff. Permanent rejections
    /// return immediately.
    async fn embed_with_retry(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let config = &self.engine.shared.config;
        let mut attempt: u32 = 0;
        loop {
            let outcome = timeout(
                config.embed_timeout,
                self.engine.shared.embedder.embed(text),
            )
            .await;

            let error = match outcome {
                Ok(Ok(vector)) => return Ok(vector),
                Ok(Err(e)) => e,
                Err(_) => EmbedError::Timeout(config.embed_timeout),
            };

            if !error.is_transient() {
                return Err(error);
            }

            attempt += 1;
            if attempt >= config.retry.max_attempts {
                warn!(attempts = attempt, "embed retries exhausted");
                return Err(error);
            }

            let backoff = config.retry.backoff_for(attempt - 1);
            warn!(
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "transient embed failure, backing off"
            );
            sleep(backoff).await;
        }
    }
}

/// The text sent to the embedding collaborator: field values joined by
/// newlines, in field order. Field names stay out of the embedded text;
/// they only shape the fingerprint and the lexical weighting.
fn embedding_text(entity: &Entity) -> String {
    entity
        .text_fields
        .iter()
        .map(|(_, value)| value.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}
