//! Ingest and query orchestration over the collaborator traits.
//!
//! Both paths run their stages sequentially on the calling thread and record
//! wall-clock timings per stage. Any collaborator failure aborts the request;
//! a missing or failing reranker does not.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chunker::Chunker;
use crate::config::{ChunkingConfig, PipelineConfig};
use crate::cost::{CostEstimator, TokenUsage};
use crate::embedder::Embedder;
use crate::error::{PipelineError, PipelineResult};
use crate::gate::{apply_score_floor, gate, NOT_FOUND_ANSWER};
use crate::generator::{AnswerGenerator, NumberedSource};
use crate::rerank::{fuse, FusionMode, RankedCandidate, Reranker};
use crate::similarity::{mmr_select, Candidate};
use crate::vector_store::{
    ChunkPayload, DocumentMeta, PayloadFilter, Point, ScoredPoint, SearchRequest, VectorStore,
};

/// Title stored when an ingest request has none.
pub const DEFAULT_TITLE: &str = "Untitled";
/// Source label stored when an ingest request has none.
pub const DEFAULT_SOURCE: &str = "user";

/// Milliseconds spent per stage, keyed by stage name.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timings {
    stages: BTreeMap<String, f64>,
}

impl Timings {
    /// Runs `f` and records its duration under `stage`.
    pub fn time<T>(&mut self, stage: &str, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let out = f();
        self.record(stage, start.elapsed());
        out
    }

    /// Stores `elapsed` for `stage`, replacing an earlier value.
    pub fn record(&mut self, stage: &str, elapsed: Duration) {
        self.stages
            .insert(stage.to_string(), elapsed.as_secs_f64() * 1000.0);
    }

    /// Recorded milliseconds for `stage`.
    pub fn get(&self, stage: &str) -> Option<f64> {
        self.stages.get(stage).copied()
    }

    /// Stage names and milliseconds in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.stages.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// Whether ingest replaces a document's earlier chunks or adds to them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestMode {
    /// Delete the document's existing points first.
    #[default]
    Replace,
    /// Keep existing points.
    Append,
}

/// Document submitted for indexing.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IngestRequest {
    /// Raw document text.
    pub text: String,
    /// Display title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Source label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Document identifier; generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
    /// Replace or append.
    #[serde(default)]
    pub mode: IngestMode,
}

/// Token and cost estimates reported by ingest.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct IngestEstimates {
    /// Approximate tokens in the whole input.
    pub input_approx_tokens: usize,
    /// Approximate tokens summed over chunk texts.
    pub embedding_approx_tokens: usize,
    /// Estimated embedding cost.
    pub embedding_approx_cost_usd: f64,
}

/// Result of a successful ingest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    /// Document identifier, generated when the request had none.
    pub doc_id: String,
    /// Collection written to.
    pub collection: String,
    /// Chunks embedded and stored.
    pub chunks_added: usize,
    /// Vector dimension of the collection.
    pub dimensions: usize,
    /// Chunker budgets in effect.
    pub chunking: ChunkingConfig,
    /// Per-stage milliseconds.
    pub timings_ms: Timings,
    /// Token and cost estimates.
    pub estimates: IngestEstimates,
}

/// Question against the indexed collection.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Question text.
    pub query: String,
    /// Restricts retrieval to one document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
}

/// Chunk as exposed in query responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicChunk {
    /// Point identifier.
    pub id: String,
    /// Vector-search score.
    pub score: f32,
    /// Fused score, present on reranked chunks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,
    /// Stored chunk metadata.
    pub payload: ChunkPayload,
}

impl From<&ScoredPoint> for PublicChunk {
    fn from(hit: &ScoredPoint) -> Self {
        Self {
            id: hit.id.clone(),
            score: hit.score,
            rerank_score: None,
            payload: hit.payload.clone(),
        }
    }
}

impl From<&RankedCandidate> for PublicChunk {
    fn from(ranked: &RankedCandidate) -> Self {
        Self {
            id: ranked.candidate.id.clone(),
            score: ranked.candidate.base_score,
            rerank_score: Some(ranked.fused_score),
            payload: ranked.candidate.payload.clone(),
        }
    }
}

/// Generator usage and its estimated price.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct UsageReport {
    /// Prompt tokens reported by the generator.
    pub llm_prompt_tokens: usize,
    /// Completion tokens reported by the generator.
    pub llm_completion_tokens: usize,
    /// Total tokens reported by the generator.
    pub llm_total_tokens: usize,
    /// Prompt plus completion cost estimate.
    pub llm_approx_cost_usd: f64,
}

/// Result of a query, including the not-found outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryReport {
    /// Document filter applied, if any.
    pub doc_id: Option<String>,
    /// Question as received.
    pub query: String,
    /// Generated answer or the not-found text.
    pub answer: String,
    /// True when the gate refused and `answer` is the fixed not-found text.
    pub no_answer: bool,
    /// Hits that passed the score floor.
    pub retrieved: Vec<PublicChunk>,
    /// MMR selection in fused order.
    pub reranked: Vec<PublicChunk>,
    /// Scoring path used by fusion.
    pub fusion: FusionMode,
    /// True when the score floor removed every hit and the raw slice was used.
    pub floor_relaxed: bool,
    /// Per-stage milliseconds.
    pub timings_ms: Timings,
    /// Generator usage; absent on the not-found path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageReport>,
}

/// Retrieval-augmented pipeline bound to one set of collaborators.
pub struct Pipeline {
    config: PipelineConfig,
    chunker: Chunker,
    costs: CostEstimator,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    reranker: Option<Arc<dyn Reranker>>,
    generator: Arc<dyn AnswerGenerator>,
}

impl Pipeline {
    /// Builds a pipeline without a reranker.
    pub fn new(
        config: PipelineConfig,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        generator: Arc<dyn AnswerGenerator>,
    ) -> Self {
        Self {
            chunker: Chunker::new(&config.chunking),
            costs: CostEstimator::new(config.chunking.chars_per_token, config.pricing),
            config,
            embedder,
            store,
            reranker: None,
            generator,
        }
    }

    /// Enables rerank fusion.
    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    /// Configuration the pipeline was built with.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Collection the store writes into.
    pub fn collection(&self) -> &str {
        self.store.collection()
    }

    /// Chunks, embeds and stores one document.
    pub fn ingest(&self, request: IngestRequest) -> PipelineResult<IngestReport> {
        let total = Instant::now();
        let mut timings = Timings::default();

        if request.text.trim().is_empty() {
            return Err(PipelineError::Validation("text must not be empty".into()));
        }
        let doc = DocumentMeta {
            doc_id: non_blank(request.doc_id).unwrap_or_else(|| Uuid::new_v4().to_string()),
            title: Some(non_blank(request.title).unwrap_or_else(|| DEFAULT_TITLE.to_string())),
            source: Some(non_blank(request.source).unwrap_or_else(|| DEFAULT_SOURCE.to_string())),
        };

        self.store
            .ensure_collection()
            .map_err(PipelineError::VectorStore)?;

        if request.mode == IngestMode::Replace {
            timings
                .time("delete", || {
                    self.store
                        .delete_by_filter(&PayloadFilter::doc_id(doc.doc_id.as_str()))
                })
                .map_err(PipelineError::VectorStore)?;
        }

        let chunks = timings.time("chunk", || self.chunker.chunk(&request.text));
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        let embedding_estimate = self.costs.embedding(texts.iter().copied());

        let batch_size = self.config.batches.embed_batch_size.max(1);
        let vectors = timings
            .time("embed", || -> anyhow::Result<Vec<Vec<f32>>> {
                let mut vectors = Vec::with_capacity(texts.len());
                for batch in texts.chunks(batch_size) {
                    vectors.extend(self.embedder.embed_batch(batch)?);
                }
                Ok(vectors)
            })
            .map_err(PipelineError::Embedding)?;
        if vectors.len() != chunks.len() {
            return Err(PipelineError::EmbeddingMismatch {
                got: vectors.len(),
                expected: chunks.len(),
            });
        }

        let created_at = chrono::Utc::now().to_rfc3339();
        let points: Vec<Point> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| Point {
                id: Uuid::new_v4().to_string(),
                vector,
                payload: ChunkPayload::from_chunk(&doc, chunk, &created_at),
            })
            .collect();

        let upsert_batch = self.config.batches.upsert_batch_size.max(1);
        timings
            .time("upsert", || -> anyhow::Result<()> {
                for batch in points.chunks(upsert_batch) {
                    self.store.upsert(batch)?;
                }
                Ok(())
            })
            .map_err(PipelineError::VectorStore)?;

        timings.record("total", total.elapsed());
        tracing::info!(
            doc_id = %doc.doc_id,
            chunks = chunks.len(),
            mode = ?request.mode,
            "document ingested"
        );

        Ok(IngestReport {
            doc_id: doc.doc_id,
            collection: self.store.collection().to_string(),
            chunks_added: chunks.len(),
            dimensions: self.store.dimensions(),
            chunking: self.config.chunking,
            timings_ms: timings,
            estimates: IngestEstimates {
                input_approx_tokens: self.costs.tokens(&request.text),
                embedding_approx_tokens: embedding_estimate.approx_tokens,
                embedding_approx_cost_usd: embedding_estimate.approx_cost_usd,
            },
        })
    }

    /// Answers `request` from the indexed chunks, or returns the not-found answer.
    pub fn query(&self, request: QueryRequest) -> PipelineResult<QueryReport> {
        let total = Instant::now();
        let mut timings = Timings::default();
        let retrieval = &self.config.retrieval;

        if request.query.trim().is_empty() {
            return Err(PipelineError::Validation("query must not be empty".into()));
        }
        let doc_id = non_blank(request.doc_id);

        self.store
            .ensure_collection()
            .map_err(PipelineError::VectorStore)?;

        let query_vector = timings
            .time("embed", || self.embedder.embed_one(&request.query))
            .map_err(PipelineError::Embedding)?;

        let search = SearchRequest {
            vector: query_vector.clone(),
            limit: retrieval.fetch_k,
            filter: doc_id.as_deref().map(PayloadFilter::doc_id),
            with_vector: true,
        };
        let hits = timings
            .time("retrieve", || self.store.search(&search))
            .map_err(PipelineError::VectorStore)?;

        let floor = apply_score_floor(
            hits,
            retrieval.min_vdb_score,
            retrieval.top_k,
            retrieval.relax_empty_floor,
        );
        let retrieved: Vec<PublicChunk> = floor.retained.iter().map(PublicChunk::from).collect();

        let selected = select(
            &query_vector,
            floor.retained,
            retrieval.top_k,
            retrieval.mmr_lambda,
        );
        let fusion = timings.time("rerank", || {
            fuse(&request.query, selected, self.reranker.as_deref())
        });
        let decision = gate(&fusion.ranked, retrieval.min_rerank_score);
        let reranked: Vec<PublicChunk> = fusion.ranked.iter().map(PublicChunk::from).collect();

        tracing::debug!(
            retrieved = retrieved.len(),
            selected = reranked.len(),
            fusion = ?fusion.mode,
            floor_relaxed = floor.relaxed,
            best_score = decision.best_score,
            proceed = decision.proceed,
            "query ranked"
        );

        let (answer, usage) = if decision.proceed {
            let sources = NumberedSource::from_ranked(&decision.top_candidates);
            let generation = timings
                .time("llm", || self.generator.generate(&request.query, &sources))
                .map_err(PipelineError::Generation)?;
            let usage = generation.usage.unwrap_or_default();
            (generation.answer, Some(self.usage_report(&usage)))
        } else {
            tracing::info!(
                best_score = decision.best_score,
                threshold = retrieval.min_rerank_score,
                "insufficient evidence; skipping generation"
            );
            (NOT_FOUND_ANSWER.to_string(), None)
        };

        timings.record("total", total.elapsed());
        Ok(QueryReport {
            doc_id,
            query: request.query,
            answer,
            no_answer: !decision.proceed,
            retrieved,
            reranked,
            fusion: fusion.mode,
            floor_relaxed: floor.relaxed,
            timings_ms: timings,
            usage,
        })
    }

    fn usage_report(&self, usage: &TokenUsage) -> UsageReport {
        UsageReport {
            llm_prompt_tokens: usage.prompt_tokens,
            llm_completion_tokens: usage.completion_tokens,
            llm_total_tokens: usage.total_tokens,
            llm_approx_cost_usd: self.costs.generation(usage),
        }
    }
}

/// MMR over hits that carry vectors; the plain top-k slice when none do.
fn select(query: &[f32], hits: Vec<ScoredPoint>, top_k: usize, lambda: f32) -> Vec<Candidate> {
    let candidates: Vec<Candidate> = hits.into_iter().map(Candidate::from).collect();
    let (with_vectors, without): (Vec<Candidate>, Vec<Candidate>) =
        candidates.into_iter().partition(|c| !c.vector.is_empty());
    if with_vectors.is_empty() {
        return without.into_iter().take(top_k).collect();
    }
    mmr_select(query, with_vectors, top_k, lambda)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
