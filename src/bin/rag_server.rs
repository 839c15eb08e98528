use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::{Parser, ValueEnum};
use minirag::embedder::cache::CachedEmbedder;
use minirag::embedder::openai::OpenAiEmbedder;
use minirag::embedder::qdrant::QdrantEmbedder;
use minirag::embedder::{Embedder, RetryPolicy};
use minirag::generator::anthropic::AnthropicGenerator;
use minirag::generator::openai::{OpenAiChatGenerator, DEFAULT_CHAT_MODEL, GROQ_BASE_URL};
use minirag::generator::{AnswerGenerator, GenerationSettings};
use minirag::rerank::cohere::CohereReranker;
use minirag::telemetry::init_tracing;
use minirag::vector_store::qdrant::QdrantStore;
use minirag::{
    IngestReport, IngestRequest, Pipeline, PipelineArgs, PipelineError, QueryReport, QueryRequest,
};
use serde::Serialize;
use tokio::sync::Mutex;

#[derive(Parser, Debug)]
#[command(
    name = "rag_server",
    about = "HTTP API for document ingest and grounded question answering"
)]
struct ServerCli {
    /// Address to bind the HTTP server to (host:port).
    #[arg(long, env = "RAG_BIND", default_value = "127.0.0.1:8080")]
    bind: String,

    #[command(flatten)]
    pipeline: PipelineArgs,

    /// Qdrant cluster URL.
    #[arg(long, env = "QDRANT_URL")]
    qdrant_url: String,

    /// Qdrant API key (omit for unauthenticated local clusters).
    #[arg(long, env = "QDRANT_API_KEY")]
    qdrant_api_key: Option<String>,

    /// Collection holding chunk vectors.
    #[arg(long, env = "QDRANT_COLLECTION", default_value = "rag_chunks")]
    collection: String,

    /// Vector dimension used when creating the collection.
    #[arg(long, env = "VECTOR_DIMENSIONS", default_value_t = 384)]
    vector_dimensions: usize,

    /// Seconds before Qdrant requests time out.
    #[arg(long, env = "QDRANT_TIMEOUT_SECS", default_value_t = 30)]
    qdrant_timeout_secs: u64,

    /// Embedding backend.
    #[arg(long, env = "EMBED_PROVIDER", value_enum, default_value_t = EmbedProvider::Openai)]
    embed_provider: EmbedProvider,

    /// API key for the embedding backend (falls back to QDRANT_API_KEY for Qdrant inference).
    #[arg(long, env = "EMBED_API_KEY")]
    embed_api_key: Option<String>,

    /// Base URL for OpenAI-compatible embeddings, or the full Qdrant inference endpoint.
    #[arg(long, env = "EMBED_BASE_URL", default_value = "https://api.openai.com/v1")]
    embed_base_url: String,

    /// Embedding model identifier.
    #[arg(long, env = "EMBED_MODEL", default_value = "text-embedding-3-small")]
    embed_model: String,

    /// Request this many dimensions from OpenAI-compatible embeddings (defaults to the collection size).
    #[arg(long, env = "EMBED_DIMENSIONS")]
    embed_dimensions: Option<usize>,

    /// Seconds before embedding requests time out.
    #[arg(long, env = "EMBED_TIMEOUT_SECS", default_value_t = 30)]
    embed_timeout_secs: u64,

    /// Attempts per embedding request (1 = no retries).
    #[arg(long, env = "EMBED_MAX_RETRIES", default_value_t = 1)]
    max_retries: usize,

    /// Max cached query embeddings kept in-memory (0 disables caching).
    #[arg(long, env = "EMBED_CACHE_SIZE", default_value_t = 1024)]
    embedding_cache_size: usize,

    /// Cohere API key; reranking is skipped when unset.
    #[arg(long, env = "COHERE_API_KEY")]
    cohere_api_key: Option<String>,

    /// Cohere rerank model.
    #[arg(long, env = "COHERE_RERANK_MODEL", default_value = "rerank-english-v3.0")]
    cohere_model: String,

    /// Answer generation backend.
    #[arg(long, env = "LLM_PROVIDER", value_enum, default_value_t = LlmProvider::Openai)]
    llm_provider: LlmProvider,

    /// API key for the answer generator.
    #[arg(long, env = "LLM_API_KEY")]
    llm_api_key: String,

    /// Base URL for OpenAI-compatible chat completions.
    #[arg(long, env = "LLM_BASE_URL", default_value = GROQ_BASE_URL)]
    llm_base_url: String,

    /// Chat model identifier.
    #[arg(long, env = "LLM_MODEL", default_value = DEFAULT_CHAT_MODEL)]
    llm_model: String,

    /// Completion token cap.
    #[arg(long, env = "LLM_MAX_TOKENS", default_value_t = 300)]
    llm_max_tokens: usize,

    /// Seconds before generation requests time out.
    #[arg(long, env = "LLM_TIMEOUT_SECS", default_value_t = 60)]
    llm_timeout_secs: u64,

    /// Max requests per minute allowed (0 disables rate limiting).
    #[arg(long, default_value_t = 120)]
    max_requests_per_minute: u32,

    /// Rate-limit burst size (tokens available instantly).
    #[arg(long, default_value_t = 12)]
    rate_limit_burst: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum EmbedProvider {
    Openai,
    Qdrant,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum LlmProvider {
    Openai,
    Anthropic,
}

#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
    rate_limiter: Option<RateLimiter>,
}

#[derive(Debug, Serialize)]
struct Envelope<T> {
    ok: bool,
    #[serde(flatten)]
    body: T,
}

impl<T> Envelope<T> {
    fn ok(body: T) -> Json<Self> {
        Json(Self { ok: true, body })
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    ok: bool,
    message: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing("info");
    let cli = ServerCli::parse();
    let pipeline = build_pipeline(&cli)?;
    let state = AppState {
        pipeline: Arc::new(pipeline),
        rate_limiter: RateLimiter::new(cli.max_requests_per_minute, cli.rate_limit_burst),
    };
    let addr: SocketAddr = cli
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", cli.bind))?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?
        .block_on(serve(state, addr))
}

/// Blocking HTTP clients must be created outside the async runtime.
fn build_pipeline(cli: &ServerCli) -> Result<Pipeline> {
    let config = cli.pipeline.build_config()?;
    let retry = RetryPolicy::new(cli.max_retries);
    let embed_timeout = Duration::from_secs(cli.embed_timeout_secs.max(1));
    let embed_batch = config.batches.embed_batch_size;

    let embedder: Arc<dyn Embedder> = match cli.embed_provider {
        EmbedProvider::Openai => {
            let inner = OpenAiEmbedder::new(
                cli.embed_api_key.clone(),
                cli.embed_base_url.clone(),
                cli.embed_model.clone(),
                Some(cli.embed_dimensions.unwrap_or(cli.vector_dimensions)),
                embed_timeout,
                retry,
                embed_batch,
            )?;
            Arc::new(CachedEmbedder::new(inner, cli.embedding_cache_size))
        }
        EmbedProvider::Qdrant => {
            let api_key = cli
                .embed_api_key
                .clone()
                .or_else(|| cli.qdrant_api_key.clone())
                .unwrap_or_default();
            let inner = QdrantEmbedder::new(
                api_key,
                cli.embed_base_url.clone(),
                cli.embed_model.clone(),
                embed_timeout,
                retry,
                embed_batch,
            )?;
            Arc::new(CachedEmbedder::new(inner, cli.embedding_cache_size))
        }
    };

    let store = Arc::new(QdrantStore::new(
        cli.qdrant_url.clone(),
        cli.qdrant_api_key.clone(),
        cli.collection.clone(),
        cli.vector_dimensions,
        Duration::from_secs(cli.qdrant_timeout_secs.max(1)),
    )?);

    let settings = GenerationSettings {
        max_tokens: cli.llm_max_tokens.max(1),
        ..GenerationSettings::default()
    };
    let llm_timeout = Duration::from_secs(cli.llm_timeout_secs.max(1));
    let generator: Arc<dyn AnswerGenerator> = match cli.llm_provider {
        LlmProvider::Openai => Arc::new(OpenAiChatGenerator::new(
            cli.llm_api_key.clone(),
            &cli.llm_base_url,
            cli.llm_model.clone(),
            settings,
            llm_timeout,
        )?),
        LlmProvider::Anthropic => Arc::new(AnthropicGenerator::new(
            cli.llm_api_key.clone(),
            cli.llm_model.clone(),
            settings,
            llm_timeout,
        )?),
    };

    let top_k = config.retrieval.top_k;
    let mut pipeline = Pipeline::new(config, embedder, store, generator);
    match cli.cohere_api_key.as_deref().filter(|key| !key.trim().is_empty()) {
        Some(key) => {
            let reranker = CohereReranker::new(
                key.to_string(),
                cli.cohere_model.clone(),
                top_k,
                Duration::from_secs(30),
            )?;
            pipeline = pipeline.with_reranker(Arc::new(reranker));
            tracing::info!(model = %cli.cohere_model, "cohere reranking enabled");
        }
        None => tracing::info!("COHERE_API_KEY unset; using similarity order"),
    }
    Ok(pipeline)
}

async fn serve(state: AppState, addr: SocketAddr) -> Result<()> {
    let collection = state.pipeline.collection().to_string();
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/ingest", post(ingest_handler))
        .route("/v1/query", post(query_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, %collection, "rag_server listening");
    axum::serve(listener, app)
        .await
        .context("server shutdown")?;
    Ok(())
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn ingest_handler(
    State(state): State<AppState>,
    payload: Result<Json<IngestRequest>, JsonRejection>,
) -> Result<Json<Envelope<IngestReport>>, ApiError> {
    let Json(request) = payload.map_err(|err| bad_request(err.body_text()))?;
    state.throttle().await?;
    let pipeline = state.pipeline.clone();
    let report = tokio::task::spawn_blocking(move || pipeline.ingest(request))
        .await
        .map_err(|err| internal_error(format!("ingest task join error: {err}")))?
        .map_err(pipeline_error)?;
    Ok(Envelope::ok(report))
}

async fn query_handler(
    State(state): State<AppState>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<Envelope<QueryReport>>, ApiError> {
    let Json(request) = payload.map_err(|err| bad_request(err.body_text()))?;
    state.throttle().await?;
    let pipeline = state.pipeline.clone();
    let report = tokio::task::spawn_blocking(move || pipeline.query(request))
        .await
        .map_err(|err| internal_error(format!("query task join error: {err}")))?
        .map_err(pipeline_error)?;
    Ok(Envelope::ok(report))
}

impl AppState {
    async fn throttle(&self) -> Result<(), ApiError> {
        match &self.rate_limiter {
            Some(limiter) if !limiter.acquire().await => {
                Err(too_many_requests("rate limit exceeded"))
            }
            _ => Ok(()),
        }
    }
}

fn pipeline_error(err: PipelineError) -> ApiError {
    if err.is_client_error() {
        tracing::debug!(error = %err, "rejected request");
        bad_request(err.to_string())
    } else {
        tracing::error!(error = %err, "request failed");
        internal_error(err.to_string())
    }
}

fn error_body(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorBody {
            ok: false,
            message: message.into(),
        }),
    )
}

fn bad_request(message: impl Into<String>) -> ApiError {
    error_body(StatusCode::BAD_REQUEST, message)
}

fn internal_error(message: impl Into<String>) -> ApiError {
    error_body(StatusCode::INTERNAL_SERVER_ERROR, message)
}

fn too_many_requests(message: impl Into<String>) -> ApiError {
    error_body(StatusCode::TOO_MANY_REQUESTS, message)
}

#[derive(Clone)]
struct RateLimiter {
    state: Arc<Mutex<RateState>>,
    capacity: f64,
    refill_per_sec: f64,
}

struct RateState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    fn new(max_per_minute: u32, burst: u32) -> Option<Self> {
        if max_per_minute == 0 || burst == 0 {
            return None;
        }
        let capacity = burst as f64;
        let refill_per_sec = max_per_minute as f64 / 60.0;
        Some(Self {
            state: Arc::new(Mutex::new(RateState {
                tokens: capacity,
                last_refill: Instant::now(),
            })),
            capacity,
            refill_per_sec,
        })
    }

    async fn acquire(&self) -> bool {
        let mut guard = self.state.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(guard.last_refill).as_secs_f64();
        guard.last_refill = now;
        guard.tokens = (guard.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if guard.tokens >= 1.0 {
            guard.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_limits_disable_the_limiter() {
        assert!(RateLimiter::new(0, 10).is_none());
        assert!(RateLimiter::new(60, 0).is_none());
    }

    #[tokio::test]
    async fn burst_is_exhausted_then_rejected() {
        let limiter = RateLimiter::new(1, 2).unwrap();
        assert!(limiter.acquire().await);
        assert!(limiter.acquire().await);
        assert!(!limiter.acquire().await);
    }

    #[test]
    fn envelope_flattens_the_body() {
        #[derive(Serialize)]
        struct Body {
            doc_id: &'static str,
        }
        let Json(envelope) = Envelope::ok(Body { doc_id: "d" });
        assert_eq!(
            serde_json::to_value(&envelope).unwrap(),
            serde_json::json!({ "ok": true, "doc_id": "d" })
        );
    }

    #[test]
    fn validation_errors_map_to_400() {
        let (status, Json(body)) = pipeline_error(PipelineError::Validation("empty".into()));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!body.ok);
        let (status, _) = pipeline_error(PipelineError::Generation(anyhow::anyhow!("down")));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
