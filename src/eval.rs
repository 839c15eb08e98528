//! Keyword heuristic used by `rag_cli eval` to grade answers against gold text.

use std::collections::BTreeSet;

use serde::Deserialize;

/// Fraction of expected keywords an answer needs to pass.
pub const PASS_THRESHOLD: f64 = 0.5;

/// Shortest word counted as a keyword.
const MIN_KEYWORD_CHARS: usize = 4;

/// One gold question with its reference answer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GoldCase {
    /// Question sent to the service.
    pub q: String,
    /// Reference answer.
    pub expected: String,
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Fraction of distinct expected keywords (4+ chars) contained in `answer`; 0 when there are none.
pub fn score_contains(answer: &str, expected: &str) -> f64 {
    let answer = normalize(answer);
    let expected = normalize(expected);
    let keywords: BTreeSet<&str> = expected
        .split(' ')
        .filter(|word| word.chars().count() >= MIN_KEYWORD_CHARS)
        .collect();
    if keywords.is_empty() {
        return 0.0;
    }
    let hits = keywords.iter().filter(|word| answer.contains(**word)).count();
    hits as f64 / keywords.len() as f64
}

/// Pass verdict for one answer.
pub fn passes(score: f64, no_answer: bool) -> bool {
    score >= PASS_THRESHOLD && !no_answer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_distinct_long_words() {
        let score = score_contains(
            "The chunker  SPLITS text\ninto overlapping windows",
            "chunker splits splits the text",
        );
        assert!((score - 1.0).abs() < 1e-12);
    }

    #[test]
    fn partial_matches_score_fractionally() {
        let score = score_contains("uses cosine similarity", "cosine similarity and lambda weighting");
        assert!((score - 0.5).abs() < 1e-12);
    }

    #[test]
    fn short_expected_text_scores_zero() {
        assert_eq!(score_contains("yes it is", "yes it is"), 0.0);
    }

    #[test]
    fn no_answer_never_passes() {
        assert!(passes(0.5, false));
        assert!(!passes(1.0, true));
        assert!(!passes(0.49, false));
    }

    #[test]
    fn gold_file_shape_parses() {
        let cases: Vec<GoldCase> =
            serde_json::from_str(r#"[{"q": "What is MMR?", "expected": "maximal marginal relevance"}]"#)
                .unwrap();
        assert_eq!(cases[0].q, "What is MMR?");
    }
}
