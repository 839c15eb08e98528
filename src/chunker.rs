//! Boundary-aware text chunking for the ingest path.
//!
//! Documents are cut into fixed-size character windows derived from a token
//! budget. The right edge of each window is pulled back onto whitespace so words
//! stay intact, adjacent windows overlap by a configurable amount, and every
//! chunk is tagged with the markdown heading it falls under.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::ChunkingConfig;

/// Smallest window the chunker cuts, in characters.
pub const MIN_CHUNK_CHARS: usize = 200;

/// How far back a window's right edge may move to land on whitespace.
pub const SNAP_LOOKBACK_CHARS: usize = 200;

/// Contiguous, possibly overlapping slice of a source document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Position among the emitted chunks of one document.
    pub chunk_index: usize,
    /// Inclusive start offset, in characters of the normalized document.
    pub char_start: usize,
    /// Exclusive end offset, in characters of the normalized document.
    pub char_end: usize,
    /// Title of the last markdown heading starting before the chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    /// Window text with surrounding whitespace trimmed.
    pub text: String,
}

/// Splits documents into overlapping passages sized for the embedding model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunker {
    chunk_chars: usize,
    overlap_chars: usize,
}

impl Chunker {
    /// Converts token budgets into character budgets.
    pub fn new(config: &ChunkingConfig) -> Self {
        let chunk_chars = (config.tokens_per_chunk as f64 * config.chars_per_token).floor();
        let overlap_chars = (config.overlap_tokens as f64 * config.chars_per_token).floor();
        Self {
            chunk_chars: (chunk_chars as usize).max(MIN_CHUNK_CHARS),
            // `as` saturates negatives and NaN to zero.
            overlap_chars: overlap_chars as usize,
        }
    }

    /// Window width in characters.
    pub fn chunk_chars(&self) -> usize {
        self.chunk_chars
    }

    /// Overlap between adjacent windows in characters.
    pub fn overlap_chars(&self) -> usize {
        self.overlap_chars
    }

    /// Splits `input` into ordered chunks.
    ///
    /// `\r\n` line endings are normalized to `\n` first; all offsets refer to the
    /// normalized text.
    pub fn chunk(&self, input: &str) -> Vec<Chunk> {
        let text = input.replace("\r\n", "\n");
        let doc = CharMap::new(&text);
        let len = doc.len();
        let headings = Headings::scan(&text, &doc);

        let mut chunks = Vec::new();
        let mut start = 0usize;
        while start < len {
            let window_end = (start + self.chunk_chars).min(len);
            let mut end = snap_to_whitespace(&doc.chars, window_end);
            if end <= start {
                end = window_end;
            }

            let cleaned = doc.slice(&text, start, end).trim();
            if !cleaned.is_empty() {
                chunks.push(Chunk {
                    chunk_index: chunks.len(),
                    char_start: start,
                    char_end: end,
                    section: headings.section_before(start),
                    text: cleaned.to_string(),
                });
            }

            if end >= len {
                break;
            }
            let next = end.saturating_sub(self.overlap_chars);
            start = if next > start { next } else { end };
        }
        chunks
    }
}

/// Moves `idx` back to the nearest whitespace within the lookback window.
fn snap_to_whitespace(chars: &[char], idx: usize) -> usize {
    if idx >= chars.len() {
        return chars.len();
    }
    if idx == 0 {
        return 0;
    }
    let floor = idx.saturating_sub(SNAP_LOOKBACK_CHARS);
    (floor + 1..=idx)
        .rev()
        .find(|&i| matches!(chars[i], ' ' | '\n' | '\t' | '\r'))
        .unwrap_or(idx)
}

/// Character view of a string with the byte offset of every character.
struct CharMap {
    chars: Vec<char>,
    byte_offsets: Vec<usize>,
}

impl CharMap {
    fn new(text: &str) -> Self {
        let mut chars = Vec::with_capacity(text.len());
        let mut byte_offsets = Vec::with_capacity(text.len() + 1);
        for (offset, ch) in text.char_indices() {
            byte_offsets.push(offset);
            chars.push(ch);
        }
        byte_offsets.push(text.len());
        Self {
            chars,
            byte_offsets,
        }
    }

    fn len(&self) -> usize {
        self.chars.len()
    }

    fn slice<'t>(&self, text: &'t str, start: usize, end: usize) -> &'t str {
        &text[self.byte_offsets[start]..self.byte_offsets[end]]
    }

    fn char_index(&self, byte: usize) -> usize {
        self.byte_offsets.partition_point(|&offset| offset < byte)
    }
}

fn heading_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?m)^#{1,6}[ \t]+(.+)$").expect("heading pattern compiles")
    })
}

/// Markdown headings in document order, keyed by the character offset of their line.
struct Headings {
    entries: Vec<(usize, String)>,
}

impl Headings {
    fn scan(text: &str, doc: &CharMap) -> Self {
        let entries = heading_pattern()
            .captures_iter(text)
            .filter_map(|caps| {
                let line_start = caps.get(0)?.start();
                let title = caps.get(1)?.as_str().trim();
                if title.is_empty() {
                    return None;
                }
                Some((doc.char_index(line_start), title.to_string()))
            })
            .collect();
        Self { entries }
    }

    fn section_before(&self, start: usize) -> Option<String> {
        let count = self.entries.partition_point(|(line, _)| *line < start);
        count
            .checked_sub(1)
            .map(|idx| self.entries[idx].1.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker(tokens: usize, overlap: usize) -> Chunker {
        Chunker::new(&ChunkingConfig {
            tokens_per_chunk: tokens,
            overlap_tokens: overlap,
            chars_per_token: 4.0,
        })
    }

    fn prose(words: usize) -> String {
        let vocabulary = ["retrieval", "of", "diverse", "passages", "matters", "a", "lot"];
        (0..words)
            .map(|i| vocabulary[i % vocabulary.len()])
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn converts_token_budgets_with_floor() {
        let chunker = chunker(100, 10);
        assert_eq!(chunker.chunk_chars(), 400);
        assert_eq!(chunker.overlap_chars(), 40);
        assert_eq!(self::chunker(10, 0).chunk_chars(), MIN_CHUNK_CHARS);
    }

    #[test]
    fn empty_and_blank_inputs_produce_nothing() {
        let chunker = chunker(100, 10);
        assert!(chunker.chunk("").is_empty());
        assert!(chunker.chunk("   \n\t  ").is_empty());
    }

    #[test]
    fn short_input_is_a_single_trimmed_chunk() {
        let text = "  A short note about ranking.  ";
        let chunks = chunker(100, 10).chunk(text);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].char_start, 0);
        assert_eq!(chunks[0].char_end, text.chars().count());
        assert_eq!(chunks[0].text, "A short note about ranking.");
        assert_eq!(chunks[0].section, None);
    }

    #[test]
    fn unbroken_text_splits_into_fixed_windows() {
        let text = "x".repeat(3000);
        let chunks = chunker(100, 0).chunk(&text);
        assert_eq!(chunks.len(), 8);
        for chunk in &chunks {
            assert!(chunk.char_end - chunk.char_start <= 400);
        }
        assert_eq!(chunks.last().unwrap().char_end, 3000);
        assert_eq!(chunks.last().unwrap().text.len(), 200);
    }

    #[test]
    fn windows_respect_offsets_and_indices() {
        let text = prose(1200);
        let len = text.chars().count();
        for (tokens, overlap) in [(50, 0), (100, 20), (120, 60), (300, 100)] {
            let chunks = chunker(tokens, overlap).chunk(&text);
            assert!(!chunks.is_empty());
            for (expected, chunk) in chunks.iter().enumerate() {
                assert_eq!(chunk.chunk_index, expected);
                assert!(chunk.char_start < chunk.char_end);
                assert!(chunk.char_end <= len);
            }
            assert_eq!(chunks.last().unwrap().char_end, len);
        }
    }

    #[test]
    fn right_edges_land_on_whitespace() {
        let text = prose(900);
        let chars: Vec<char> = text.chars().collect();
        let chunks = chunker(100, 0).chunk(&text);
        for chunk in &chunks {
            assert!(
                chunk.char_end == chars.len() || chars[chunk.char_end].is_whitespace(),
                "chunk {} ends mid-word",
                chunk.chunk_index
            );
        }

        for chunk in &chunks {
            let rechunked = chunker(100, 0).chunk(&chunk.text);
            let rejoined: Vec<&str> = rechunked
                .iter()
                .flat_map(|c| c.text.split_whitespace())
                .collect();
            let original: Vec<&str> = chunk.text.split_whitespace().collect();
            assert_eq!(rejoined, original);
        }
    }

    #[test]
    fn blank_windows_do_not_consume_an_index() {
        let text = format!("a{}b", " ".repeat(500));
        let chunks = chunker(50, 0).chunk(&text);
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b"]);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[1].chunk_index, 1);
    }

    #[test]
    fn tags_chunks_with_preceding_heading() {
        let mut text = String::from("# Overview\n");
        text.push_str(&prose(120));
        text.push_str("\n\n## Ranking Details\n");
        text.push_str(&prose(400));

        let chunks = chunker(100, 0).chunk(&text);
        assert!(chunks.len() > 2);
        assert_eq!(chunks[0].section, None);
        assert_eq!(chunks[1].section.as_deref(), Some("Overview"));
        assert_eq!(
            chunks.last().unwrap().section.as_deref(),
            Some("Ranking Details")
        );
    }

    #[test]
    fn ignores_hash_runs_that_are_not_headings() {
        let mut text = String::from("####### too deep\n#hashtag\n");
        text.push_str(&prose(200));
        let chunks = chunker(50, 0).chunk(&text);
        assert!(chunks.iter().all(|c| c.section.is_none()));
    }

    #[test]
    fn large_overlap_still_terminates() {
        let chunker = Chunker::new(&ChunkingConfig {
            tokens_per_chunk: 10,
            overlap_tokens: 400,
            chars_per_token: 4.0,
        });
        let text = prose(600);
        let chunks = chunker.chunk(&text);
        assert!(!chunks.is_empty());
        assert!(chunks
            .windows(2)
            .all(|pair| pair[1].char_start > pair[0].char_start));
        assert_eq!(chunks.last().unwrap().char_end, text.chars().count());
    }

    #[test]
    fn offsets_count_characters_not_bytes() {
        let text = "é".repeat(450);
        let chunks = chunker(50, 0).chunk(&text);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].char_end, 450);
        assert_eq!(chunks[0].text.chars().count(), 200);
    }

    #[test]
    fn normalizes_crlf_before_measuring() {
        let chunks = chunker(50, 0).chunk("# Title\r\nbody text\r\n");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "# Title\nbody text");
        assert_eq!(chunks[0].char_end, "# Title\nbody text\n".chars().count());
    }
}
