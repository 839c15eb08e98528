//! Evidence checks: the pre-MMR score floor and the answerability gate.

use crate::rerank::RankedCandidate;
use crate::vector_store::ScoredPoint;

/// Sources handed to the answer generator at most.
pub const MAX_ANSWER_SOURCES: usize = 6;

/// Fixed reply used when the evidence is too weak to answer.
pub const NOT_FOUND_ANSWER: &str = "I don't know based on the provided document text. Try ingesting more relevant content, or ask a more specific question.";

/// Whether to call the generator, and with which sources.
#[derive(Debug, Clone, PartialEq)]
pub struct GateDecision {
    /// True when there is evidence and the best score clears the threshold.
    pub proceed: bool,
    /// Fused score of the first candidate, or 0 when there is none.
    pub best_score: f32,
    /// Leading candidates, at most [`MAX_ANSWER_SOURCES`].
    pub top_candidates: Vec<RankedCandidate>,
}

/// Decides whether `ranked` carries enough evidence to answer.
pub fn gate(ranked: &[RankedCandidate], min_rerank_score: f32) -> GateDecision {
    let top_candidates: Vec<RankedCandidate> =
        ranked.iter().take(MAX_ANSWER_SOURCES).cloned().collect();
    let best_score = top_candidates.first().map_or(0.0, |c| c.fused_score);
    let proceed = !top_candidates.is_empty() && best_score >= min_rerank_score;
    GateDecision {
        proceed,
        best_score,
        top_candidates,
    }
}

/// Hits that survived the score floor.
#[derive(Debug, Clone, PartialEq)]
pub struct FloorOutcome {
    /// Hits passed on to MMR.
    pub retained: Vec<ScoredPoint>,
    /// True when every hit was below the floor and the raw top-k slice was kept instead.
    pub relaxed: bool,
}

/// Drops hits scoring below `min_score`.
///
/// When nothing survives and `relax` is set, the first `top_k` raw hits are kept.
pub fn apply_score_floor(
    hits: Vec<ScoredPoint>,
    min_score: f32,
    top_k: usize,
    relax: bool,
) -> FloorOutcome {
    let any_pass = hits.iter().any(|hit| hit.score >= min_score);
    if !any_pass && relax && !hits.is_empty() {
        let retained = hits.into_iter().take(top_k).collect();
        return FloorOutcome {
            retained,
            relaxed: true,
        };
    }
    let retained = hits.into_iter().filter(|hit| hit.score >= min_score).collect();
    FloorOutcome {
        retained,
        relaxed: false,
    }
}
