//! Grounded answer generation over numbered sources.

pub mod anthropic;
pub mod openai;

use anyhow::Result;
use serde::Serialize;

pub use crate::cost::TokenUsage;
use crate::rerank::RankedCandidate;

/// System instructions shared by every chat provider.
pub const SYSTEM_PROMPT: &str = "You are a grounded assistant. \
You MUST answer using ONLY the sources provided. \
If the answer is explicitly present in the sources, you MUST provide it. \
Use citations like [1] or [1][2] that refer to the numbered sources. \
If none of the sources contain the answer, reply: I don't know based on the document.";

/// Source passage as presented to the model; `n` is what citations refer to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NumberedSource {
    /// 1-based citation number.
    pub n: usize,
    /// Passage text.
    pub text: String,
    /// Document title.
    pub title: Option<String>,
    /// Section heading.
    pub section: Option<String>,
    /// Chunk position within its document.
    pub chunk_index: usize,
}

impl NumberedSource {
    /// Numbers `ranked` from 1 in order.
    pub fn from_ranked(ranked: &[RankedCandidate]) -> Vec<Self> {
        ranked
            .iter()
            .enumerate()
            .map(|(i, r)| {
                let payload = &r.candidate.payload;
                Self {
                    n: i + 1,
                    text: payload.text.clone(),
                    title: payload.title.clone(),
                    section: payload.section.clone(),
                    chunk_index: payload.chunk_index,
                }
            })
            .collect()
    }
}

/// Model output.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Generation {
    /// Answer text, expected to cite `[n]`.
    pub answer: String,
    /// Provider-reported usage, when available.
    pub usage: Option<TokenUsage>,
}

/// Sampling knobs for chat providers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationSettings {
    /// Sampling temperature.
    pub temperature: f32,
    /// Completion token cap.
    pub max_tokens: usize,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            max_tokens: 300,
        }
    }
}

/// Produces an answer grounded in numbered sources.
pub trait AnswerGenerator: Send + Sync {
    /// Answers `question` citing `sources` by their numbers.
    fn generate(&self, question: &str, sources: &[NumberedSource]) -> Result<Generation>;
}

/// Formats the source block: a `[n] Title — Section (chunk i)` header above each passage.
pub fn render_sources(sources: &[NumberedSource]) -> String {
    sources
        .iter()
        .map(|s| {
            let title = s.title.as_deref().unwrap_or("Untitled");
            let section = s
                .section
                .as_deref()
                .map(|section| format!(" \u{2014} {section}"))
                .unwrap_or_default();
            format!(
                "[{}] {}{} (chunk {})\n{}",
                s.n, title, section, s.chunk_index, s.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// User turn sent alongside [`SYSTEM_PROMPT`].
pub fn build_user_prompt(question: &str, sources: &[NumberedSource]) -> String {
    format!(
        "QUESTION:\n{}\n\nSOURCES:\n{}\n\nANSWER (with citations):",
        question,
        render_sources(sources)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::similarity::tests::candidate;
    use pretty_assertions::assert_eq;

    fn source(n: usize, title: Option<&str>, section: Option<&str>) -> NumberedSource {
        NumberedSource {
            n,
            text: format!("passage {n}"),
            title: title.map(str::to_string),
            section: section.map(str::to_string),
            chunk_index: n * 2,
        }
    }

    #[test]
    fn renders_headers_with_fallback_title() {
        let rendered = render_sources(&[
            source(1, Some("Guide"), Some("Install")),
            source(2, None, None),
        ]);
        assert_eq!(
            rendered,
            "[1] Guide \u{2014} Install (chunk 2)\npassage 1\n\n[2] Untitled (chunk 4)\npassage 2"
        );
    }

    #[test]
    fn user_prompt_wraps_question_and_sources() {
        let prompt = build_user_prompt("why?", &[source(1, Some("T"), None)]);
        assert_eq!(
            prompt,
            "QUESTION:\nwhy?\n\nSOURCES:\n[1] T (chunk 2)\npassage 1\n\nANSWER (with citations):"
        );
    }

    #[test]
    fn numbering_starts_at_one() {
        let ranked: Vec<RankedCandidate> = ["x", "y"]
            .iter()
            .map(|id| RankedCandidate {
                candidate: candidate(id, 0.5, vec![1.0]),
                fused_score: 0.5,
            })
            .collect();
        let numbered = NumberedSource::from_ranked(&ranked);
        assert_eq!(numbered.iter().map(|s| s.n).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(numbered[1].text, "text of y");
    }
}
