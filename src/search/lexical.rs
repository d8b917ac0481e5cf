//! Field-weighted BM25 inverted index.
//!
//! Tokenization is deliberately simple and identical for documents and
//! queries: case-fold, split on non-alphanumeric boundaries, drop stop
//! words. Postings are kept per (entity, field) so field weights apply at
//! score time, and corpus statistics (document frequency, average length)
//! update incrementally on index and remove.

use super::types::{EntityId, SearchError};
use crate::config::Bm25Config;
use once_cell::sync::Lazy;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use tracing::instrument;

/// Built-in stop words, used when the config does not supply a set.
static DEFAULT_STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "into",
        "is", "it", "no", "not", "of", "on", "or", "such", "that", "the", "their", "then",
        "there", "these", "they", "this", "to", "was", "will", "with",
    ]
    .into_iter()
    .collect()
});

/// One posting: an entity's term frequency within a single field.
#[derive(Debug, Clone)]
struct Posting {
    entity: EntityId,
    term_frequency: u32,
    field_weight: f32,
}

/// Inverted index scored by BM25 over the current corpus.
///
/// # Thread safety
///
/// Not internally synchronized; the engine wraps it in a `RwLock` with the
/// single-writer discipline the pipeline enforces.
pub struct LexicalIndex {
    k1: f32,
    b: f32,
    stop_words: HashSet<String>,
    field_weights: HashMap<String, f32>,
    /// term -> postings sorted by ascending entity id (entries for the same
    /// entity, one per field, sit adjacent).
    postings: HashMap<String, Vec<Posting>>,
    /// entity -> terms it contributes, for O(terms) removal.
    doc_terms: HashMap<EntityId, HashSet<String>>,
    /// entity -> field-weighted token count.
    doc_lengths: HashMap<EntityId, f32>,
    /// Sum of all document lengths, for the BM25 average.
    total_length: f64,
}

impl LexicalIndex {
    /// Creates an empty index with the given BM25 configuration.
    pub fn new(config: &Bm25Config) -> Self {
        let stop_words = match &config.stop_words {
            Some(words) => words.clone(),
            None => DEFAULT_STOP_WORDS.iter().map(|w| w.to_string()).collect(),
        };
        Self {
            k1: config.k1,
            b: config.b,
            stop_words,
            field_weights: config.field_weights.clone(),
            postings: HashMap::new(),
            doc_terms: HashMap::new(),
            doc_lengths: HashMap::new(),
            total_length: 0.0,
        }
    }

    /// Tokenizes text: case-fold, split on non-alphanumeric, drop stop
    /// words. Queries and documents go through this same function.
    pub fn tokenize(&self, text: &str) -> Vec<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .filter(|t| !self.stop_words.contains(*t))
            .map(str::to_string)
            .collect()
    }

    /// Indexes an entity's text fields, replacing any prior postings.
    #[instrument(skip_all, fields(entity = entity_id.as_u64(), fields = text_fields.len()))]
    pub fn index(&mut self, entity_id: EntityId, text_fields: &[(String, String)]) {
        self.remove(entity_id);

        let mut terms = HashSet::new();
        let mut doc_length = 0.0f32;

        for (field_name, content) in text_fields {
            let weight = self.field_weights.get(field_name).copied().unwrap_or(1.0);
            let tokens = self.tokenize(content);
            if tokens.is_empty() {
                continue;
            }
            doc_length += weight * tokens.len() as f32;

            let mut frequencies: HashMap<String, u32> = HashMap::new();
            for token in tokens {
                *frequencies.entry(token).or_insert(0) += 1;
            }

            for (term, tf) in frequencies {
                let list = self.postings.entry(term.clone()).or_default();
                let at = list.partition_point(|p| p.entity <= entity_id);
                list.insert(
                    at,
                    Posting {
                        entity: entity_id,
                        term_frequency: tf,
                        field_weight: weight,
                    },
                );
                terms.insert(term);
            }
        }

        self.total_length += doc_length as f64;
        self.doc_lengths.insert(entity_id, doc_length);
        self.doc_terms.insert(entity_id, terms);
    }

    /// Removes an entity's postings. Idempotent.
    pub fn remove(&mut self, entity_id: EntityId) {
        let Some(terms) = self.doc_terms.remove(&entity_id) else {
            return;
        };
        for term in terms {
            if let Some(list) = self.postings.get_mut(&term) {
                list.retain(|p| p.entity != entity_id);
                if list.is_empty() {
                    self.postings.remove(&term);
                }
            }
        }
        if let Some(length) = self.doc_lengths.remove(&entity_id) {
            self.total_length = (self.total_length - length as f64).max(0.0);
        }
    }

    /// Returns the top-k entities by BM25 score for a query.
    ///
    /// Entities matching none of the query terms are excluded, not scored
    /// zero. Results are ordered by score descending, ties broken by
    /// ascending entity id.
    pub fn query_top_k(&self, query_text: &str, k: usize) -> Vec<(EntityId, f32)> {
        if k == 0 || self.doc_lengths.is_empty() {
            return vec![];
        }

        let mut query_terms = self.tokenize(query_text);
        query_terms.sort();
        query_terms.dedup();
        if query_terms.is_empty() {
            return vec![];
        }

        let total_docs = self.doc_lengths.len() as f32;
        let avg_length = (self.total_length / self.doc_lengths.len() as f64).max(1.0) as f32;

        let mut scores: HashMap<EntityId, f32> = HashMap::new();
        for term in &query_terms {
            let Some(list) = self.postings.get(term) else {
                continue;
            };

            // Entries are entity-sorted; distinct entities give the document
            // frequency, and same-entity runs sum into a field-weighted tf.
            let df = count_distinct_entities(list) as f32;
            let idf = ((total_docs - df + 0.5) / (df + 0.5)).ln_1p().max(0.0);

            let mut i = 0;
            while i < list.len() {
                let entity = list[i].entity;
                let mut weighted_tf = 0.0f32;
                while i < list.len() && list[i].entity == entity {
                    weighted_tf += list[i].term_frequency as f32 * list[i].field_weight;
                    i += 1;
                }

                let doc_length = self.doc_lengths.get(&entity).copied().unwrap_or(0.0);
                let length_norm = 1.0 - self.b + self.b * doc_length / avg_length;
                let denom = weighted_tf + self.k1 * length_norm;
                if denom > 0.0 {
                    *scores.entry(entity).or_insert(0.0) +=
                        idf * weighted_tf * (self.k1 + 1.0) / denom;
                }
            }
        }

        let mut results: Vec<(EntityId, f32)> = scores.into_iter().collect();
        results.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        results.truncate(k);
        results
    }

    /// Number of indexed entities.
    pub fn len(&self) -> usize {
        self.doc_lengths.len()
    }

    /// Returns `true` if no entities are indexed.
    pub fn is_empty(&self) -> bool {
        self.doc_lengths.is_empty()
    }

    /// Returns `true` if the entity has postings.
    pub fn contains(&self, entity_id: EntityId) -> bool {
        self.doc_lengths.contains_key(&entity_id)
    }
}

fn count_distinct_entities(list: &[Posting]) -> usize {
    let mut count = 0;
    let mut previous = None;
    for posting in list {
        if previous != Some(posting.entity) {
            count += 1;
            previous = Some(posting.entity);
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> EntityId {
        EntityId::from_u64(n)
    }

    fn fields(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    fn index() -> LexicalIndex {
        LexicalIndex::new(&Bm25Config::default())
    }

    #[test]
    fn tokenize_folds_case_and_splits_punctuation() {
        let idx = index();
        let tokens = idx.tokenize("Cold-Rolled STEEL, grade 304!");
        assert_eq!(tokens, vec!["cold", "rolled", "steel", "grade", "304"]);
    }

    #[test]
    fn tokenize_drops_stop_words() {
        let idx = index();
        let tokens = idx.tokenize("the steel and the rod");
        assert_eq!(tokens, vec!["steel", "rod"]);
    }

    #[test]
    fn custom_stop_words_override_default() {
        let config = Bm25Config {
            stop_words: Some(["steel".to_string()].into_iter().collect()),
            ..Bm25Config::default()
        };
        let idx = LexicalIndex::new(&config);
        // "the" survives because the default set was replaced
        assert_eq!(idx.tokenize("the steel rod"), vec!["the", "rod"]);
    }

    #[test]
    fn zero_match_entities_are_excluded() {
        let mut idx = index();
        idx.index(id(1), &fields(&[("name", "steel rod")]));
        idx.index(id(2), &fields(&[("name", "copper wire")]));

        let results = idx.query_top_k("steel", 10);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, id(1));
    }

    #[test]
    fn higher_term_frequency_scores_higher() {
        let mut idx = index();
        idx.index(id(1), &fields(&[("desc", "steel product")]));
        idx.index(id(2), &fields(&[("desc", "steel steel steel product")]));
        idx.index(id(3), &fields(&[("desc", "plastic product")]));

        let results = idx.query_top_k("steel", 10);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, id(2));
        assert!(results[0].1 > results[1].1);
    }

    #[test]
    fn field_weights_boost_matches() {
        let config = Bm25Config {
            field_weights: [("name".to_string(), 3.0)].into_iter().collect(),
            ..Bm25Config::default()
        };
        let mut idx = LexicalIndex::new(&config);
        idx.index(id(1), &fields(&[("name", "steel"), ("desc", "generic")]));
        idx.index(id(2), &fields(&[("name", "generic"), ("desc", "steel")]));

        let results = idx.query_top_k("steel", 10);
        assert_eq!(results[0].0, id(1), "name match should outrank desc match");
    }

    #[test]
    fn reindex_replaces_postings() {
        let mut idx = index();
        idx.index(id(1), &fields(&[("name", "steel rod")]));
        idx.index(id(1), &fields(&[("name", "copper wire")]));

        assert_eq!(idx.len(), 1);
        assert!(idx.query_top_k("steel", 10).is_empty());
        assert_eq!(idx.query_top_k("copper", 10).len(), 1);
    }

    #[test]
    fn remove_updates_corpus_statistics() {
        let mut idx = index();
        idx.index(id(1), &fields(&[("name", "steel rod")]));
        idx.index(id(2), &fields(&[("name", "steel wire")]));

        idx.remove(id(1));
        idx.remove(id(1)); // idempotent

        assert_eq!(idx.len(), 1);
        assert!(!idx.contains(id(1)));
        let results = idx.query_top_k("steel", 10);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, id(2));

        idx.remove(id(2));
        assert!(idx.is_empty());
        assert_eq!(idx.total_length, 0.0);
        assert!(idx.postings.is_empty());
    }

    #[test]
    fn rare_terms_outweigh_common_terms() {
        let mut idx = index();
        // "alloy" appears everywhere, "titanium" in one document.
        idx.index(id(1), &fields(&[("desc", "titanium alloy")]));
        idx.index(id(2), &fields(&[("desc", "aluminum alloy")]));
        idx.index(id(3), &fields(&[("desc", "zinc alloy")]));

        let results = idx.query_top_k("titanium alloy", 10);
        assert_eq!(results[0].0, id(1));
        // Entity 1 should lead by a clear margin from the rare-term idf.
        assert!(results[0].1 > results[1].1);
    }

    #[test]
    fn equal_scores_tie_break_by_ascending_id() {
        let mut idx = index();
        idx.index(id(9), &fields(&[("name", "steel rod")]));
        idx.index(id(4), &fields(&[("name", "steel rod")]));

        let results = idx.query_top_k("steel", 10);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, id(4));
        assert_eq!(results[1].0, id(9));
        assert_eq!(results[0].1, results[1].1);
    }

    #[test]
    fn query_identical_tokenization() {
        let mut idx = index();
        idx.index(id(1), &fields(&[("name", "Cold-Rolled Steel")]));

        // Mixed case and punctuation in the query must still match.
        assert_eq!(idx.query_top_k("COLD rolled", 10).len(), 1);
        assert_eq!(idx.query_top_k("cold-rolled!", 10).len(), 1);
    }

    #[test]
    fn empty_query_returns_nothing() {
        let mut idx = index();
        idx.index(id(1), &fields(&[("name", "steel")]));
        assert!(idx.query_top_k("", 10).is_empty());
        assert!(idx.query_top_k("the and of", 10).is_empty());
    }

    #[test]
    fn truncates_to_k() {
        let mut idx = index();
        for i in 0..10 {
            idx.index(id(i), &fields(&[("name", "steel product")]));
        }
        assert_eq!(idx.query_top_k("steel", 3).len(), 3);
    }
}
