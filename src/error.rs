//! Pipeline error type surfaced to the HTTP layer.

use thiserror::Error;

/// Failures that abort an ingest or query request.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Request input was rejected before any side effect.
    #[error("invalid request: {0}")]
    Validation(String),
    /// The embedder returned a different number of vectors than texts sent.
    #[error("embedding count mismatch: got {got} vectors for {expected} chunks")]
    EmbeddingMismatch {
        /// Vectors returned.
        got: usize,
        /// Texts submitted.
        expected: usize,
    },
    /// Embedding provider failure.
    #[error("embedding failed: {0:#}")]
    Embedding(anyhow::Error),
    /// Vector store failure.
    #[error("vector store failed: {0:#}")]
    VectorStore(anyhow::Error),
    /// Answer generator failure.
    #[error("answer generation failed: {0:#}")]
    Generation(anyhow::Error),
}

impl PipelineError {
    /// True when the caller sent bad input.
    pub fn is_client_error(&self) -> bool {
        matches!(self, PipelineError::Validation(_))
    }
}

/// Result alias for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;
