//! Weighted score fusion over normalized candidate sets.
//!
//! Vector similarity and BM25 live on incompatible scales, so each candidate
//! set is min-max normalized to [0, 1] independently before the weighted sum.
//! Normalization is computed over the candidate set actually returned by an
//! index; an entity absent from a set contributes 0 for that component
//! rather than being excluded from fusion.

use super::types::{EntityId, FusionWeights};
use std::cmp::Ordering;
use std::collections::HashMap;

/// A fused candidate: the combined score plus both raw component scores for
/// explainability.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedCandidate {
    /// The candidate entity.
    pub entity_id: EntityId,
    /// `vector_weight * norm_vector + text_weight * norm_text`.
    pub fused_score: f32,
    /// Raw cosine similarity, 0.0 when not a vector candidate.
    pub vector_score: f32,
    /// Raw BM25 score, 0.0 when not a lexical candidate.
    pub text_score: f32,
}

/// Min-max normalizes a candidate set onto [0, 1].
///
/// An empty set yields an empty map (callers treat missing entries as 0).
/// When all scores are equal - including a single-candidate set - every
/// entry normalizes to 1.0: the shared value is the set's maximum.
fn min_max_normalize(candidates: &[(EntityId, f32)]) -> HashMap<EntityId, f32> {
    let Some(first) = candidates.first() else {
        return HashMap::new();
    };
    let mut min = first.1;
    let mut max = first.1;
    for (_, score) in candidates {
        min = min.min(*score);
        max = max.max(*score);
    }
    let range = max - min;
    candidates
        .iter()
        .map(|(entity, score)| {
            let normalized = if range > 0.0 { (score - min) / range } else { 1.0 };
            (*entity, normalized)
        })
        .collect()
}

/// Fuses vector and lexical candidate sets into one ranked list.
///
/// Produces the union of both sets, ordered by fused score descending with
/// ties broken by ascending entity id for determinism. Thresholding and
/// truncation are left to the caller, which applies them after category
/// filtering.
pub fn fuse(
    vector_candidates: &[(EntityId, f32)],
    text_candidates: &[(EntityId, f32)],
    weights: FusionWeights,
) -> Vec<FusedCandidate> {
    let norm_vector = min_max_normalize(vector_candidates);
    let norm_text = min_max_normalize(text_candidates);

    let raw_vector: HashMap<EntityId, f32> = vector_candidates.iter().copied().collect();
    let raw_text: HashMap<EntityId, f32> = text_candidates.iter().copied().collect();

    let mut entities: Vec<EntityId> = raw_vector.keys().chain(raw_text.keys()).copied().collect();
    entities.sort_unstable();
    entities.dedup();

    let mut fused: Vec<FusedCandidate> = entities
        .into_iter()
        .map(|entity_id| {
            let nv = norm_vector.get(&entity_id).copied().unwrap_or(0.0);
            let nt = norm_text.get(&entity_id).copied().unwrap_or(0.0);
            FusedCandidate {
                entity_id,
                fused_score: weights.vector * nv + weights.text * nt,
                vector_score: raw_vector.get(&entity_id).copied().unwrap_or(0.0),
                text_score: raw_text.get(&entity_id).copied().unwrap_or(0.0),
            }
        })
        .collect();

    fused.sort_by(|a, b| {
        b.fused_score
            .partial_cmp(&a.fused_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.entity_id.cmp(&b.entity_id))
    });
    fused
}
