#![warn(missing_docs)]
//! Core library for minirag: chunking, diversified retrieval, rerank fusion and
//! answerability gating for retrieval-augmented question answering.

pub mod chunker;
pub mod config;
pub mod cost;
pub mod embedder;
pub mod error;
pub mod eval;
pub mod gate;
pub mod generator;
pub mod pipeline;
pub mod rerank;
pub mod similarity;
pub mod telemetry;
pub mod vector_store;

pub use chunker::{Chunk, Chunker};
pub use config::{PipelineArgs, PipelineConfig};
pub use error::{PipelineError, PipelineResult};
pub use gate::{gate, GateDecision, MAX_ANSWER_SOURCES, NOT_FOUND_ANSWER};
pub use pipeline::{IngestReport, IngestRequest, Pipeline, QueryReport, QueryRequest};
pub use rerank::{fuse, Fusion, FusionMode, RankedCandidate, Reranker};
pub use similarity::{cosine_similarity, mmr_select, Candidate};
