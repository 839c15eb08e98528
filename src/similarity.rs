//! Cosine similarity and Maximal Marginal Relevance (MMR) selection.
//!
//! MMR greedily builds the result list, trading relevance to the query against
//! redundancy with what has already been picked. Each step scores every
//! remaining candidate against the growing selection, so a call costs
//! `O(k * n)` similarity evaluations (`O(k^2 * n)` vector operations). That is
//! fine for a few hundred candidates and `k` around ten, but grows quickly
//! with large `k`.

use crate::vector_store::{ChunkPayload, ScoredPoint};

/// Vector-search hit carried through selection and fusion.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Point identifier in the vector store.
    pub id: String,
    /// Chunk metadata.
    pub payload: ChunkPayload,
    /// Stored embedding (empty when the store returned none).
    pub vector: Vec<f32>,
    /// Similarity score from the vector search.
    pub base_score: f32,
}

impl From<ScoredPoint> for Candidate {
    fn from(point: ScoredPoint) -> Self {
        Self {
            id: point.id,
            payload: point.payload,
            vector: point.vector.unwrap_or_default(),
            base_score: point.score,
        }
    }
}

/// Cosine similarity over the shared prefix of `a` and `b`; zero when either norm is zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0f64;
    let mut norm_a = 0f64;
    let mut norm_b = 0f64;
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = (norm_a * norm_b).sqrt();
    if denom == 0.0 {
        0.0
    } else {
        (dot / denom) as f32
    }
}

/// Picks up to `k` diverse, relevant candidates in selection order.
///
/// `lambda` is clamped to `[0, 1]`: 1 ranks purely by query similarity, 0 picks
/// whatever is least similar to the current selection. Ties keep the earlier
/// candidate.
pub fn mmr_select(query: &[f32], candidates: Vec<Candidate>, k: usize, lambda: f32) -> Vec<Candidate> {
    let lambda = f64::from(lambda.clamp(0.0, 1.0));
    let mut remaining: Vec<(f64, Candidate)> = candidates
        .into_iter()
        .map(|candidate| {
            let relevance = f64::from(cosine_similarity(query, &candidate.vector));
            (relevance, candidate)
        })
        .collect();
    let mut selected: Vec<Candidate> = Vec::with_capacity(k.min(remaining.len()));

    while selected.len() < k && !remaining.is_empty() {
        let mut best_idx = 0usize;
        let mut best_score = f64::NEG_INFINITY;
        for (idx, (relevance, candidate)) in remaining.iter().enumerate() {
            let redundancy = selected
                .iter()
                .map(|picked| f64::from(cosine_similarity(&candidate.vector, &picked.vector)))
                .fold(0.0, f64::max);
            let score = lambda * relevance - (1.0 - lambda) * redundancy;
            if score > best_score {
                best_score = score;
                best_idx = idx;
            }
        }
        let (_, picked) = remaining.remove(best_idx);
        selected.push(picked);
    }
    selected
}

/// MMR selector bound to a fixed `k` and `lambda`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MmrSelector {
    k: usize,
    lambda: f32,
}

impl MmrSelector {
    /// Builds a selector; `lambda` is clamped at selection time.
    pub fn new(k: usize, lambda: f32) -> Self {
        Self { k, lambda }
    }

    /// Runs [`mmr_select`] with the configured parameters.
    pub fn select(&self, query: &[f32], candidates: Vec<Candidate>) -> Vec<Candidate> {
        mmr_select(query, candidates, self.k, self.lambda)
    }
}
