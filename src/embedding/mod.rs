//! Embedding records, content fingerprints, and the embed client seam.
//!
//! The engine never runs model inference itself. Vectors come from an
//! external model-serving collaborator through the [`EmbedClient`] trait;
//! this module owns the types that describe those vectors and the
//! fingerprinting that decides when a new one is needed.

mod store;

pub use store::EmbeddingRecordStore;

use crate::error::EmbedError;
use crate::search::{Entity, EntityId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identity of an embedding model: name plus version.
///
/// Embeddings from different model versions are never comparable, so the
/// full pair keys every embedding record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelId {
    /// Model name, e.g. `"catalog-embed"`.
    pub name: String,
    /// Model version, e.g. `"v2"`.
    pub version: String,
}

impl ModelId {
    /// Creates a model identity.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Stable string form used as a storage key component.
    pub fn key(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

impl std::fmt::Display for ModelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// Deterministic hash of an entity's indexed content.
///
/// Two entities with identical fingerprints (under the same model) never
/// trigger a second embedding request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentFingerprint(String);

impl ContentFingerprint {
    /// Fingerprints an entity.
    ///
    /// Constituent fields: every `(field_name, content)` pair in order,
    /// followed by the sorted category ids. Field names participate so that
    /// moving text between fields (which changes lexical weighting) is a
    /// content change. `updated_at` does not participate - a touch without a
    /// content change must not re-embed.
    pub fn of_entity(entity: &Entity) -> Self {
        let mut hasher = Sha256::new();
        for (name, value) in &entity.text_fields {
            hasher.update(name.as_bytes());
            hasher.update([0x1f]);
            hasher.update(value.as_bytes());
            hasher.update([0x1e]);
        }
        for cat in &entity.category_ids {
            hasher.update(cat.as_u64().to_le_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// Hex digest string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One embedding for one (entity, model) pair.
///
/// At most one *active* record exists per pair; superseded records are kept
/// inactive by the store, never left ambiguous.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    /// Entity this embedding belongs to.
    pub entity_id: EntityId,
    /// Model that produced the vector.
    pub model_id: ModelId,
    /// Vector length; always equals `vector.len()`.
    pub dimension: usize,
    /// L2-normalized embedding values.
    pub vector: Vec<f32>,
    /// Fingerprint of the content the vector was computed from.
    pub fingerprint: ContentFingerprint,
    /// Model self-reported confidence in [0, 1], when the model provides
    /// one.
    pub quality_score: Option<f32>,
    /// Unix timestamp (seconds) when the record was created.
    pub created_at: u64,
}

impl EmbeddingRecord {
    /// Builds a record from a normalized vector.
    pub fn new(
        entity_id: EntityId,
        model_id: ModelId,
        vector: Vec<f32>,
        fingerprint: ContentFingerprint,
        quality_score: Option<f32>,
    ) -> Self {
        Self {
            entity_id,
            model_id,
            dimension: vector.len(),
            vector,
            fingerprint,
            quality_score,
            created_at: unix_timestamp(),
        }
    }
}

/// Current Unix timestamp in seconds, 0 if the clock is before the epoch.
pub(crate) fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// External model-serving collaborator.
///
/// The returned vector's length is authoritative for dimension validation;
/// the engine normalizes it (unit L2) before indexing. Implementations must
/// be `Send + Sync` - the pipeline worker and query tasks share one client.
#[async_trait]
pub trait EmbedClient: Send + Sync {
    /// Embeds a piece of text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;

    /// Identity of the model behind this client.
    fn model(&self) -> ModelId;
}

/// Scales a vector to unit L2 norm.
///
/// A zero vector cannot be normalized and is rejected as a permanent
/// embedding failure - indexing a fabricated direction would silently
/// corrupt similarity scores.
pub fn l2_normalize(mut vector: Vec<f32>) -> Result<Vec<f32>, EmbedError> {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return Err(EmbedError::Rejected(format!(
            "embedding has non-normalizable L2 norm {norm}"
        )));
    }
    for x in &mut vector {
        *x /= norm;
    }
    Ok(vector)
}
