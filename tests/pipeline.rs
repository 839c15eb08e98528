use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use minirag::config::{ChunkingConfig, Pricing, RetrievalConfig};
use minirag::embedder::Embedder;
use minirag::generator::{AnswerGenerator, Generation, NumberedSource, TokenUsage};
use minirag::pipeline::IngestMode;
use minirag::rerank::RerankScore;
use minirag::vector_store::{PayloadFilter, Point, ScoredPoint, SearchRequest, VectorStore};
use minirag::{
    cosine_similarity, FusionMode, IngestRequest, Pipeline, PipelineConfig, PipelineError,
    QueryRequest, Reranker, NOT_FOUND_ANSWER,
};
use pretty_assertions::assert_eq;

const DIMS: usize = 64;

const HANDBOOK: &str = "# Chunking\n\
The chunker splits documents into overlapping windows and snaps each boundary back to whitespace so words stay whole.\n\n\
# Caching\n\
The embedding cache keeps recent query vectors in memory and evicts the least recently used entry when full.\n\n\
# Reranking\n\
A cross-encoder reranker rescores the diversified candidates; without it the similarity order is kept.\n";

/// Bag-of-words vectors hashed into a fixed number of buckets.
struct HashEmbedder;

fn hash_embed(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0; DIMS];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 3)
    {
        let hash = word
            .to_lowercase()
            .bytes()
            .fold(2_166_136_261u32, |h, b| (h ^ u32::from(b)).wrapping_mul(16_777_619));
        vector[hash as usize % DIMS] += 1.0;
    }
    vector
}

impl Embedder for HashEmbedder {
    fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
        Ok(inputs.iter().map(|text| hash_embed(text)).collect())
    }
}

struct ShortEmbedder;

impl Embedder for ShortEmbedder {
    fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
        Ok(inputs.iter().skip(1).map(|text| hash_embed(text)).collect())
    }
}

#[derive(Default)]
struct MemoryStore {
    points: Mutex<Vec<Point>>,
}

impl MemoryStore {
    fn len(&self) -> usize {
        self.points.lock().unwrap().len()
    }

    fn doc_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .points
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.payload.doc_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

impl VectorStore for MemoryStore {
    fn collection(&self) -> &str {
        "memory"
    }

    fn dimensions(&self) -> usize {
        DIMS
    }

    fn ensure_collection(&self) -> Result<()> {
        Ok(())
    }

    fn upsert(&self, points: &[Point]) -> Result<()> {
        self.points.lock().unwrap().extend_from_slice(points);
        Ok(())
    }

    fn search(&self, request: &SearchRequest) -> Result<Vec<ScoredPoint>> {
        let points = self.points.lock().unwrap();
        let mut hits: Vec<ScoredPoint> = points
            .iter()
            .filter(|p| {
                request
                    .filter
                    .as_ref()
                    .map_or(true, |f| f.matches(&p.payload))
            })
            .map(|p| ScoredPoint {
                id: p.id.clone(),
                score: cosine_similarity(&request.vector, &p.vector),
                vector: request.with_vector.then(|| p.vector.clone()),
                payload: p.payload.clone(),
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(request.limit);
        Ok(hits)
    }

    fn delete_by_filter(&self, filter: &PayloadFilter) -> Result<()> {
        self.points
            .lock()
            .unwrap()
            .retain(|p| !filter.matches(&p.payload));
        Ok(())
    }
}

struct DownStore;

impl VectorStore for DownStore {
    fn collection(&self) -> &str {
        "down"
    }

    fn dimensions(&self) -> usize {
        DIMS
    }

    fn ensure_collection(&self) -> Result<()> {
        Err(anyhow!("connection refused"))
    }

    fn upsert(&self, _points: &[Point]) -> Result<()> {
        unreachable!("upsert after failed ensure")
    }

    fn search(&self, _request: &SearchRequest) -> Result<Vec<ScoredPoint>> {
        unreachable!("search after failed ensure")
    }

    fn delete_by_filter(&self, _filter: &PayloadFilter) -> Result<()> {
        unreachable!("delete after failed ensure")
    }
}

#[derive(Default)]
struct RecordingGenerator {
    calls: AtomicUsize,
    last_sources: Mutex<Vec<NumberedSource>>,
}

impl AnswerGenerator for RecordingGenerator {
    fn generate(&self, _question: &str, sources: &[NumberedSource]) -> Result<Generation> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_sources.lock().unwrap() = sources.to_vec();
        Ok(Generation {
            answer: "The cache evicts the least recently used entry [1].".into(),
            usage: Some(TokenUsage {
                prompt_tokens: 100,
                completion_tokens: 10,
                total_tokens: 110,
            }),
        })
    }
}

struct PanickingGenerator;

impl AnswerGenerator for PanickingGenerator {
    fn generate(&self, _question: &str, _sources: &[NumberedSource]) -> Result<Generation> {
        panic!("generator must not be called when the gate refuses");
    }
}

struct BrokenReranker;

impl Reranker for BrokenReranker {
    fn rerank(&self, _query: &str, _documents: &[&str]) -> Result<Vec<RerankScore>> {
        Err(anyhow!("rerank timeout"))
    }
}

/// Gives the highest score to the last document submitted.
struct LastFirstReranker;

impl Reranker for LastFirstReranker {
    fn rerank(&self, _query: &str, documents: &[&str]) -> Result<Vec<RerankScore>> {
        Ok(vec![RerankScore {
            index: documents.len() - 1,
            score: 0.99,
        }])
    }
}

fn config() -> PipelineConfig {
    PipelineConfig {
        chunking: ChunkingConfig {
            tokens_per_chunk: 50,
            overlap_tokens: 0,
            chars_per_token: 4.0,
        },
        retrieval: RetrievalConfig {
            top_k: 4,
            fetch_k: 10,
            ..RetrievalConfig::default()
        },
        pricing: Pricing {
            prompt_usd_per_1m: 1.0,
            ..Pricing::default()
        },
        ..PipelineConfig::default()
    }
}

fn ingest_request(doc_id: &str, mode: IngestMode) -> IngestRequest {
    IngestRequest {
        text: HANDBOOK.to_string(),
        title: Some("Handbook".into()),
        source: None,
        doc_id: Some(doc_id.into()),
        mode,
    }
}

fn query(text: &str) -> QueryRequest {
    QueryRequest {
        query: text.to_string(),
        doc_id: None,
    }
}

#[test]
fn ingest_then_query_answers_with_numbered_sources() {
    let store = Arc::new(MemoryStore::default());
    let generator = Arc::new(RecordingGenerator::default());
    let pipeline = Pipeline::new(config(), Arc::new(HashEmbedder), store.clone(), generator.clone());

    let report = pipeline
        .ingest(ingest_request("handbook", IngestMode::Replace))
        .unwrap();
    assert_eq!(report.doc_id, "handbook");
    assert_eq!(report.collection, "memory");
    assert_eq!(report.dimensions, DIMS);
    assert!(report.chunks_added >= 2);
    assert_eq!(store.len(), report.chunks_added);
    assert!(report.estimates.embedding_approx_tokens > 0);
    for stage in ["delete", "chunk", "embed", "upsert", "total"] {
        assert!(report.timings_ms.get(stage).is_some(), "missing {stage}");
    }

    let answer = pipeline
        .query(query("How does the embedding cache evict entries?"))
        .unwrap();
    assert!(!answer.no_answer);
    assert_eq!(answer.answer, "The cache evicts the least recently used entry [1].");
    assert_eq!(answer.fusion, FusionMode::SimilarityFallback);
    assert!(!answer.retrieved.is_empty());
    assert!(answer.reranked.len() <= 4);
    assert_eq!(generator.calls.load(Ordering::SeqCst), 1);

    let sources = generator.last_sources.lock().unwrap();
    assert_eq!(sources[0].n, 1);
    assert_eq!(sources[0].title.as_deref(), Some("Handbook"));
    assert!(sources.len() <= minirag::MAX_ANSWER_SOURCES);

    let usage = answer.usage.unwrap();
    assert_eq!(usage.llm_total_tokens, 110);
    assert!((usage.llm_approx_cost_usd - 100.0 / 1_000_000.0).abs() < 1e-12);
    assert!(answer.timings_ms.get("llm").is_some());
}

#[test]
fn missing_metadata_gets_defaults() {
    let store = Arc::new(MemoryStore::default());
    let pipeline = Pipeline::new(
        config(),
        Arc::new(HashEmbedder),
        store.clone(),
        Arc::new(PanickingGenerator),
    );
    let report = pipeline
        .ingest(IngestRequest {
            text: "Plain note without headings.".into(),
            ..IngestRequest::default()
        })
        .unwrap();
    assert_eq!(report.chunks_added, 1);
    assert_eq!(report.doc_id.len(), 36);

    let points = store.points.lock().unwrap();
    let payload = &points[0].payload;
    assert_eq!(payload.title.as_deref(), Some("Untitled"));
    assert_eq!(payload.source.as_deref(), Some("user"));
    assert_eq!(payload.section, None);
    assert!(!payload.created_at.is_empty());
}

#[test]
fn replace_mode_drops_earlier_chunks_and_append_keeps_them() {
    let store = Arc::new(MemoryStore::default());
    let pipeline = Pipeline::new(
        config(),
        Arc::new(HashEmbedder),
        store.clone(),
        Arc::new(PanickingGenerator),
    );
    let first = pipeline
        .ingest(ingest_request("doc", IngestMode::Replace))
        .unwrap();
    pipeline
        .ingest(ingest_request("doc", IngestMode::Replace))
        .unwrap();
    assert_eq!(store.len(), first.chunks_added);

    pipeline
        .ingest(ingest_request("doc", IngestMode::Append))
        .unwrap();
    assert_eq!(store.len(), first.chunks_added * 2);
}

#[test]
fn doc_filter_restricts_retrieval() {
    let store = Arc::new(MemoryStore::default());
    let pipeline = Pipeline::new(
        config(),
        Arc::new(HashEmbedder),
        store.clone(),
        Arc::new(RecordingGenerator::default()),
    );
    pipeline.ingest(ingest_request("a", IngestMode::Replace)).unwrap();
    pipeline.ingest(ingest_request("b", IngestMode::Replace)).unwrap();
    assert_eq!(store.doc_ids(), vec!["a".to_string(), "b".to_string()]);

    let report = pipeline
        .query(QueryRequest {
            query: "reranker similarity order".into(),
            doc_id: Some("b".into()),
        })
        .unwrap();
    assert_eq!(report.doc_id.as_deref(), Some("b"));
    assert!(!report.retrieved.is_empty());
    assert!(report.retrieved.iter().all(|c| c.payload.doc_id == "b"));
    assert!(report.reranked.iter().all(|c| c.payload.doc_id == "b"));
}

#[test]
fn gate_refusal_skips_the_generator() {
    let mut config = config();
    config.retrieval.min_rerank_score = 2.0;
    let pipeline = Pipeline::new(
        config,
        Arc::new(HashEmbedder),
        Arc::new(MemoryStore::default()),
        Arc::new(PanickingGenerator),
    );
    pipeline
        .ingest(ingest_request("doc", IngestMode::Replace))
        .unwrap();

    let report = pipeline.query(query("What does the chunker do?")).unwrap();
    assert!(report.no_answer);
    assert_eq!(report.answer, NOT_FOUND_ANSWER);
    assert!(report.usage.is_none());
    assert!(!report.reranked.is_empty());
    assert!(report.timings_ms.get("llm").is_none());
}

#[test]
fn empty_collection_yields_not_found() {
    let pipeline = Pipeline::new(
        config(),
        Arc::new(HashEmbedder),
        Arc::new(MemoryStore::default()),
        Arc::new(PanickingGenerator),
    );
    let report = pipeline.query(query("anything at all?")).unwrap();
    assert!(report.no_answer);
    assert!(report.retrieved.is_empty());
    assert!(report.reranked.is_empty());
    assert!(!report.floor_relaxed);
}

#[test]
fn unreachable_floor_relaxes_to_raw_hits() {
    let mut config = config();
    config.retrieval.min_vdb_score = 1.5;
    let pipeline = Pipeline::new(
        config,
        Arc::new(HashEmbedder),
        Arc::new(MemoryStore::default()),
        Arc::new(RecordingGenerator::default()),
    );
    pipeline
        .ingest(ingest_request("doc", IngestMode::Replace))
        .unwrap();

    let report = pipeline.query(query("embedding cache")).unwrap();
    assert!(report.floor_relaxed);
    assert!(!report.retrieved.is_empty());
    assert!(report.retrieved.len() <= 4);
    assert!(!report.no_answer);
}

#[test]
fn failing_reranker_keeps_similarity_order() {
    let pipeline = Pipeline::new(
        config(),
        Arc::new(HashEmbedder),
        Arc::new(MemoryStore::default()),
        Arc::new(RecordingGenerator::default()),
    )
    .with_reranker(Arc::new(BrokenReranker));
    pipeline
        .ingest(ingest_request("doc", IngestMode::Replace))
        .unwrap();

    let report = pipeline.query(query("cross-encoder reranker")).unwrap();
    assert_eq!(report.fusion, FusionMode::SimilarityFallback);
    assert!(!report.no_answer);
    for chunk in &report.reranked {
        assert_eq!(chunk.rerank_score, Some(chunk.score));
    }
}

#[test]
fn reranker_scores_drive_the_order() {
    let pipeline = Pipeline::new(
        config(),
        Arc::new(HashEmbedder),
        Arc::new(MemoryStore::default()),
        Arc::new(RecordingGenerator::default()),
    )
    .with_reranker(Arc::new(LastFirstReranker));
    pipeline
        .ingest(ingest_request("doc", IngestMode::Replace))
        .unwrap();

    let report = pipeline.query(query("whitespace boundary windows")).unwrap();
    assert_eq!(report.fusion, FusionMode::Reranked);
    assert_eq!(report.reranked[0].rerank_score, Some(0.99));
    assert!(report.reranked[1..]
        .iter()
        .all(|c| c.rerank_score == Some(0.0)));
}

#[test]
fn blank_inputs_are_validation_errors() {
    let store = Arc::new(MemoryStore::default());
    let pipeline = Pipeline::new(
        config(),
        Arc::new(HashEmbedder),
        store.clone(),
        Arc::new(PanickingGenerator),
    );
    let err = pipeline
        .ingest(IngestRequest {
            text: "  \n ".into(),
            ..IngestRequest::default()
        })
        .unwrap_err();
    assert!(err.is_client_error());
    assert_eq!(store.len(), 0);

    let err = pipeline.query(query("   ")).unwrap_err();
    assert!(matches!(err, PipelineError::Validation(_)));
}

#[test]
fn embedding_count_mismatch_aborts_ingest() {
    let store = Arc::new(MemoryStore::default());
    let pipeline = Pipeline::new(
        config(),
        Arc::new(ShortEmbedder),
        store.clone(),
        Arc::new(PanickingGenerator),
    );
    let err = pipeline
        .ingest(ingest_request("doc", IngestMode::Replace))
        .unwrap_err();
    assert!(matches!(err, PipelineError::EmbeddingMismatch { .. }));
    assert_eq!(store.len(), 0);
}

#[test]
fn store_failures_are_server_errors() {
    let pipeline = Pipeline::new(
        config(),
        Arc::new(HashEmbedder),
        Arc::new(DownStore),
        Arc::new(PanickingGenerator),
    );
    let err = pipeline
        .ingest(ingest_request("doc", IngestMode::Replace))
        .unwrap_err();
    assert!(matches!(err, PipelineError::VectorStore(_)));
    assert!(!err.is_client_error());
    assert!(err.to_string().contains("connection refused"));
}
