//! Significance Scorer (§4.C): a pure function from (previous snapshot,
//! current snapshot, weights) to a score in [0, 1] plus the list of
//! field contributions. Grounded on `enhanced_monitor.py`'s
//! `calculate_change_significance` / `_calculate_text_similarity` in
//! `original_source/`.

use std::collections::HashSet;

use sha2::{Digest, Sha256};

use crate::models::{FieldChange, Snapshot};

#[derive(Debug, Clone, Copy)]
pub struct Weights {
    pub title: f64,
    pub description: f64,
    pub state: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Weights {
            title: 0.8,
            description: 0.6,
            state: 0.2,
        }
    }
}

/// SHA-256 hex digest, used as the canonical `content_hash` (§3).
pub fn content_hash(canonical: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Lowercase, whitespace-split Jaccard similarity. Both empty -> 1.0; one
/// empty -> 0.0; otherwise |A∩B| / |A∪B|.
pub fn jaccard_word_similarity(a: &str, b: &str) -> f64 {
    let words_a: HashSet<&str> = a.split_whitespace().collect();
    let words_b: HashSet<&str> = b.split_whitespace().collect();

    if words_a.is_empty() && words_b.is_empty() {
        return 1.0;
    }
    if words_a.is_empty() || words_b.is_empty() {
        return 0.0;
    }

    let intersection = words_a.intersection(&words_b).count();
    let union = words_a.union(&words_b).count();
    intersection as f64 / union as f64
}

fn lowercase_words_similarity(a: &str, b: &str) -> f64 {
    jaccard_word_similarity(&a.to_lowercase(), &b.to_lowercase())
}

/// `score(prev, cur, weights) -> (f64, Vec<FieldChange>)`. Returns
/// `(1.0, [])` when `prev` is `None` — a new root is always significant.
pub fn score(
    prev: Option<&Snapshot>,
    cur: &Snapshot,
    weights: Weights,
) -> (f64, Vec<FieldChange>) {
    let Some(prev) = prev else {
        return (1.0, Vec::new());
    };

    let mut total = 0.0;
    let mut changes = Vec::new();

    if prev.title != cur.title {
        let similarity = lowercase_words_similarity(&prev.title, &cur.title);
        let contribution = (1.0 - similarity) * weights.title;
        total += contribution;
        changes.push(FieldChange {
            field: "title".to_string(),
            significance: contribution,
            old: prev.title.clone(),
            new: cur.title.clone(),
        });
    }

    if prev.description != cur.description {
        let similarity = lowercase_words_similarity(&prev.description, &cur.description);
        let contribution = (1.0 - similarity) * weights.description;
        total += contribution;
        changes.push(FieldChange {
            field: "description".to_string(),
            significance: contribution,
            old: prev.description.clone(),
            new: cur.description.clone(),
        });
    }

    if prev.state != cur.state {
        total += weights.state;
        changes.push(FieldChange {
            field: "state".to_string(),
            significance: weights.state,
            old: prev.state.clone(),
            new: cur.state.clone(),
        });
    }

    (total.min(1.0), changes)
}
