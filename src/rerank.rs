//! Rerank-score fusion with graceful fallback to similarity order.

pub mod cohere;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::similarity::Candidate;

/// One score returned by a reranker, keyed by the document's position in the request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RerankScore {
    /// Position of the document in the submitted list.
    pub index: usize,
    /// Relevance score.
    pub score: f32,
}

/// Cross-encoder style reranker. Any error means "unavailable".
pub trait Reranker: Send + Sync {
    /// Scores `documents` against `query`; the result may be sparse and unordered.
    fn rerank(&self, query: &str, documents: &[&str]) -> Result<Vec<RerankScore>>;
}

/// Candidate with the score used for final ordering.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedCandidate {
    /// Underlying search hit.
    pub candidate: Candidate,
    /// Rerank score, or the similarity score when no reranker ran.
    pub fused_score: f32,
}

/// Which scoring path produced a [`Fusion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionMode {
    /// Scores came from the reranker.
    Reranked,
    /// No reranker (or it failed); similarity scores and MMR order kept.
    SimilarityFallback,
}

/// Output of [`fuse`].
#[derive(Debug, Clone, PartialEq)]
pub struct Fusion {
    /// Candidates ordered by descending fused score.
    pub ranked: Vec<RankedCandidate>,
    /// Path that produced the scores.
    pub mode: FusionMode,
}

/// Re-scores the MMR selection with `reranker`, or keeps it as-is when none is usable.
pub fn fuse(query: &str, selected: Vec<Candidate>, reranker: Option<&dyn Reranker>) -> Fusion {
    let Some(reranker) = reranker else {
        return fallback(selected);
    };
    if selected.is_empty() {
        return Fusion {
            ranked: Vec::new(),
            mode: FusionMode::Reranked,
        };
    }

    let documents: Vec<&str> = selected.iter().map(|c| c.payload.text.as_str()).collect();
    let scores = match reranker.rerank(query, &documents) {
        Ok(scores) => scores,
        Err(err) => {
            tracing::warn!(error = %err, "reranker unavailable; keeping similarity order");
            return fallback(selected);
        }
    };

    let mut by_position = vec![0f32; selected.len()];
    for RerankScore { index, score } in scores {
        if let Some(slot) = by_position.get_mut(index) {
            *slot = score;
        }
    }

    let mut ranked: Vec<RankedCandidate> = selected
        .into_iter()
        .zip(by_position)
        .map(|(candidate, fused_score)| RankedCandidate {
            candidate,
            fused_score,
        })
        .collect();
    ranked.sort_by(|a, b| b.fused_score.total_cmp(&a.fused_score));
    Fusion {
        ranked,
        mode: FusionMode::Reranked,
    }
}

fn fallback(selected: Vec<Candidate>) -> Fusion {
    let ranked = selected
        .into_iter()
        .map(|candidate| RankedCandidate {
            fused_score: candidate.base_score,
            candidate,
        })
        .collect();
    Fusion {
        ranked,
        mode: FusionMode::SimilarityFallback,
    }
}
