//! Vector-store boundary: the versioned payload record, search hits, and the store trait.

pub mod qdrant;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::chunker::Chunk;

/// Current layout of [`ChunkPayload`].
pub const PAYLOAD_VERSION: u32 = 1;

/// Payload field holding the owning document id.
pub const DOC_ID_FIELD: &str = "doc_id";

/// Metadata stored alongside every chunk vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPayload {
    /// Layout version; records written before versioning read as 1.
    #[serde(default = "legacy_payload_version")]
    pub payload_version: u32,
    /// Owning document identifier.
    pub doc_id: String,
    /// Human-readable document title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Where the document came from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Closest preceding markdown heading.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    /// Chunk position within the document.
    pub chunk_index: usize,
    /// Inclusive character offset.
    pub char_start: usize,
    /// Exclusive character offset.
    pub char_end: usize,
    /// Chunk text.
    pub text: String,
    /// RFC 3339 timestamp of the ingest call.
    #[serde(default)]
    pub created_at: String,
}

fn legacy_payload_version() -> u32 {
    1
}

/// Document-level fields copied onto every chunk payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentMeta {
    /// Document identifier.
    pub doc_id: String,
    /// Optional title.
    pub title: Option<String>,
    /// Optional source label.
    pub source: Option<String>,
}

impl ChunkPayload {
    /// Builds the payload stored for `chunk`.
    pub fn from_chunk(doc: &DocumentMeta, chunk: &Chunk, created_at: &str) -> Self {
        Self {
            payload_version: PAYLOAD_VERSION,
            doc_id: doc.doc_id.clone(),
            title: doc.title.clone(),
            source: doc.source.clone(),
            section: chunk.section.clone(),
            chunk_index: chunk.chunk_index,
            char_start: chunk.char_start,
            char_end: chunk.char_end,
            text: chunk.text.clone(),
            created_at: created_at.to_string(),
        }
    }

    /// Decodes and validates a payload received from the store.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let payload: Self =
            serde_json::from_value(value).context("malformed chunk payload")?;
        payload.validate()?;
        Ok(payload)
    }

    /// Rejects payloads written by a newer layout or with impossible offsets.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.payload_version <= PAYLOAD_VERSION,
            "unsupported payload version {} (max {})",
            self.payload_version,
            PAYLOAD_VERSION
        );
        anyhow::ensure!(!self.doc_id.is_empty(), "payload is missing doc_id");
        anyhow::ensure!(
            self.char_start < self.char_end,
            "payload offsets {}..{} are empty",
            self.char_start,
            self.char_end
        );
        Ok(())
    }

    /// String value of a filterable payload field.
    pub fn field(&self, key: &str) -> Option<&str> {
        match key {
            DOC_ID_FIELD => Some(self.doc_id.as_str()),
            "title" => self.title.as_deref(),
            "source" => self.source.as_deref(),
            "section" => self.section.as_deref(),
            _ => None,
        }
    }
}

/// Point written to the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Point {
    /// Point identifier (UUID).
    pub id: String,
    /// Embedding vector.
    pub vector: Vec<f32>,
    /// Chunk metadata.
    pub payload: ChunkPayload,
}

/// Equality predicate on one payload field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMatch {
    /// Payload key.
    pub key: String,
    /// Required value.
    pub value: String,
}

/// Conjunction of payload equality predicates.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PayloadFilter {
    /// Every predicate must hold.
    pub must: Vec<FieldMatch>,
}

impl PayloadFilter {
    /// Filter selecting every point of one document.
    pub fn doc_id(doc_id: impl Into<String>) -> Self {
        Self {
            must: vec![FieldMatch {
                key: DOC_ID_FIELD.to_string(),
                value: doc_id.into(),
            }],
        }
    }

    /// Evaluates the filter against a payload.
    pub fn matches(&self, payload: &ChunkPayload) -> bool {
        self.must
            .iter()
            .all(|cond| payload.field(&cond.key) == Some(cond.value.as_str()))
    }
}

/// Nearest-neighbour query.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    /// Query embedding.
    pub vector: Vec<f32>,
    /// Maximum hits returned.
    pub limit: usize,
    /// Optional payload restriction.
    pub filter: Option<PayloadFilter>,
    /// Whether hits should carry their stored vectors.
    pub with_vector: bool,
}

/// Search hit with a validated payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPoint {
    /// Point identifier.
    pub id: String,
    /// Similarity score reported by the store (higher is closer).
    pub score: f32,
    /// Stored vector when requested.
    pub vector: Option<Vec<f32>>,
    /// Chunk metadata.
    pub payload: ChunkPayload,
}

/// Storage collaborator holding chunk vectors.
pub trait VectorStore: Send + Sync {
    /// Collection the store writes into.
    fn collection(&self) -> &str;

    /// Vector dimension the collection was created with.
    fn dimensions(&self) -> usize;

    /// Creates the collection and payload indexes when missing.
    fn ensure_collection(&self) -> Result<()>;

    /// Inserts or replaces points.
    fn upsert(&self, points: &[Point]) -> Result<()>;

    /// Returns hits ordered by descending score.
    fn search(&self, request: &SearchRequest) -> Result<Vec<ScoredPoint>>;

    /// Removes every point matching `filter`.
    fn delete_by_filter(&self, filter: &PayloadFilter) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> DocumentMeta {
        DocumentMeta {
            doc_id: "doc-1".into(),
            title: Some("Handbook".into()),
            source: None,
        }
    }

    #[test]
    fn payload_copies_chunk_and_document_fields() {
        let chunk = Chunk {
            chunk_index: 3,
            char_start: 10,
            char_end: 40,
            section: Some("Setup".into()),
            text: "install the thing".into(),
        };
        let payload = ChunkPayload::from_chunk(&doc(), &chunk, "2024-01-01T00:00:00Z");
        assert_eq!(payload.payload_version, PAYLOAD_VERSION);
        assert_eq!(payload.doc_id, "doc-1");
        assert_eq!(payload.section.as_deref(), Some("Setup"));
        assert_eq!(payload.chunk_index, 3);
        assert_eq!(payload.field("title"), Some("Handbook"));
        assert_eq!(payload.field("source"), None);
    }

    #[test]
    fn unversioned_payloads_read_as_version_one() {
        let payload = ChunkPayload::from_value(json!({
            "doc_id": "doc-1",
            "chunk_index": 0,
            "char_start": 0,
            "char_end": 5,
            "text": "hello"
        }))
        .expect("legacy payload");
        assert_eq!(payload.payload_version, 1);
        assert_eq!(payload.created_at, "");
    }

    #[test]
    fn rejects_newer_or_malformed_payloads() {
        let newer = ChunkPayload::from_value(json!({
            "payload_version": PAYLOAD_VERSION + 1,
            "doc_id": "doc-1",
            "chunk_index": 0,
            "char_start": 0,
            "char_end": 5,
            "text": "hello"
        }));
        assert!(newer.is_err());

        let missing_text = ChunkPayload::from_value(json!({
            "doc_id": "doc-1",
            "chunk_index": 0,
            "char_start": 0,
            "char_end": 5
        }));
        assert!(missing_text.is_err());

        let empty_span = ChunkPayload::from_value(json!({
            "doc_id": "doc-1",
            "chunk_index": 0,
            "char_start": 5,
            "char_end": 5,
            "text": "hello"
        }));
        assert!(empty_span.is_err());
    }

    #[test]
    fn doc_filter_matches_only_its_document() {
        let chunk = Chunk {
            chunk_index: 0,
            char_start: 0,
            char_end: 4,
            section: None,
            text: "text".into(),
        };
        let payload = ChunkPayload::from_chunk(&doc(), &chunk, "");
        assert!(PayloadFilter::doc_id("doc-1").matches(&payload));
        assert!(!PayloadFilter::doc_id("doc-2").matches(&payload));
        assert!(PayloadFilter::default().matches(&payload));
    }
}
