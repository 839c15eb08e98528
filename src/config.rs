//! Pipeline tuning knobs assembled once at startup and shared read-only.

use anyhow::Result;
use clap::{ArgAction, Args};
use serde::{Deserialize, Serialize};

/// Token budgets that drive the chunker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Approximate tokens per emitted chunk.
    pub tokens_per_chunk: usize,
    /// Approximate tokens shared between adjacent chunks.
    pub overlap_tokens: usize,
    /// Characters assumed per token when converting budgets.
    pub chars_per_token: f64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            tokens_per_chunk: 1000,
            overlap_tokens: 120,
            chars_per_token: 4.0,
        }
    }
}

/// Candidate counts and score thresholds for the query path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrievalConfig {
    /// Candidates kept after MMR selection.
    pub top_k: usize,
    /// Hits requested from the vector store.
    pub fetch_k: usize,
    /// Relevance/diversity balance for MMR, within `[0, 1]`.
    pub mmr_lambda: f32,
    /// Vector-search hits below this score are dropped before MMR.
    pub min_vdb_score: f32,
    /// Best fused score required before an answer is generated.
    pub min_rerank_score: f32,
    /// Fall back to the raw top-k slice when the score floor removes every hit.
    pub relax_empty_floor: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 8,
            fetch_k: 40,
            mmr_lambda: 0.5,
            min_vdb_score: 0.15,
            min_rerank_score: 0.0,
            relax_empty_floor: true,
        }
    }
}

/// USD prices per million tokens; zero means "not priced".
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Pricing {
    /// Embedding input price.
    pub embed_usd_per_1m: f64,
    /// Generation prompt price.
    pub prompt_usd_per_1m: f64,
    /// Generation completion price.
    pub completion_usd_per_1m: f64,
}

/// Request sizes used when talking to the embedding and storage collaborators.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchLimits {
    /// Chunk texts per embedding call.
    pub embed_batch_size: usize,
    /// Points per upsert call.
    pub upsert_batch_size: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            embed_batch_size: 64,
            upsert_batch_size: 128,
        }
    }
}

/// Immutable configuration handed to every pipeline component.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PipelineConfig {
    /// Chunker budgets.
    pub chunking: ChunkingConfig,
    /// Query-path knobs.
    pub retrieval: RetrievalConfig,
    /// Cost accounting prices.
    pub pricing: Pricing,
    /// Collaborator batch sizes.
    pub batches: BatchLimits,
}

/// Command-line/environment surface for [`PipelineConfig`], flattened into binaries.
#[derive(Args, Debug, Clone)]
pub struct PipelineArgs {
    /// Approximate tokens per chunk
    #[arg(long, env = "CHUNK_TOKENS", default_value_t = 1000)]
    pub chunk_tokens: usize,

    /// Approximate tokens shared between adjacent chunks
    #[arg(long, env = "CHUNK_OVERLAP_TOKENS", default_value_t = 120)]
    pub chunk_overlap_tokens: usize,

    /// Characters assumed per token
    #[arg(long, env = "APPROX_CHARS_PER_TOKEN", default_value_t = 4.0)]
    pub chars_per_token: f64,

    /// Candidates kept after MMR selection
    #[arg(long, env = "TOP_K", default_value_t = 8)]
    pub top_k: usize,

    /// Hits requested from the vector store before filtering
    #[arg(long, env = "FETCH_K", default_value_t = 40)]
    pub fetch_k: usize,

    /// MMR relevance weight in [0, 1] (1 = pure relevance, 0 = pure diversity)
    #[arg(long, env = "MMR_LAMBDA", default_value_t = 0.5)]
    pub mmr_lambda: f32,

    /// Minimum vector-search score kept before MMR
    #[arg(long, env = "MIN_VDB_SCORE", default_value_t = 0.15)]
    pub min_vdb_score: f32,

    /// Minimum fused score required to generate an answer
    #[arg(long, env = "MIN_RERANK_SCORE", default_value_t = 0.0)]
    pub min_rerank_score: f32,

    /// Keep an unfiltered top-k slice when the score floor removes every hit
    #[arg(long, env = "RELAX_EMPTY_FLOOR", default_value_t = true, action = ArgAction::Set)]
    pub relax_empty_floor: bool,

    /// Chunk texts per embedding request
    #[arg(long, env = "EMBED_BATCH", default_value_t = 64)]
    pub embed_batch_size: usize,

    /// Points per vector-store upsert
    #[arg(long, env = "UPSERT_BATCH", default_value_t = 128)]
    pub upsert_batch_size: usize,

    /// Embedding price in USD per million tokens (0 = unpriced)
    #[arg(long, env = "EMBED_USD_PER_1M", default_value_t = 0.0)]
    pub embed_usd_per_1m: f64,

    /// Prompt price in USD per million tokens (0 = unpriced)
    #[arg(long, env = "PROMPT_USD_PER_1M", default_value_t = 0.0)]
    pub prompt_usd_per_1m: f64,

    /// Completion price in USD per million tokens (0 = unpriced)
    #[arg(long, env = "COMPLETION_USD_PER_1M", default_value_t = 0.0)]
    pub completion_usd_per_1m: f64,
}

impl PipelineArgs {
    /// Validates the parsed knobs and converts them into a [`PipelineConfig`].
    pub fn build_config(&self) -> Result<PipelineConfig> {
        anyhow::ensure!(self.chunk_tokens > 0, "chunk tokens must be positive");
        anyhow::ensure!(
            self.chunk_overlap_tokens < self.chunk_tokens,
            "chunk overlap ({}) must be smaller than the chunk size ({})",
            self.chunk_overlap_tokens,
            self.chunk_tokens
        );
        anyhow::ensure!(
            self.chars_per_token.is_finite() && self.chars_per_token > 0.0,
            "chars per token must be a positive number"
        );
        anyhow::ensure!(self.top_k > 0, "top-k must be positive");
        anyhow::ensure!(
            self.fetch_k >= self.top_k,
            "fetch-k ({}) must be at least top-k ({})",
            self.fetch_k,
            self.top_k
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.mmr_lambda),
            "mmr lambda {} is outside [0, 1]",
            self.mmr_lambda
        );
        anyhow::ensure!(
            self.min_vdb_score.is_finite() && self.min_rerank_score.is_finite(),
            "score thresholds must be finite"
        );
        anyhow::ensure!(
            self.embed_batch_size > 0 && self.upsert_batch_size > 0,
            "batch sizes must be positive"
        );
        for price in [
            self.embed_usd_per_1m,
            self.prompt_usd_per_1m,
            self.completion_usd_per_1m,
        ] {
            anyhow::ensure!(
                price.is_finite() && price >= 0.0,
                "prices must be non-negative"
            );
        }

        Ok(PipelineConfig {
            chunking: ChunkingConfig {
                tokens_per_chunk: self.chunk_tokens,
                overlap_tokens: self.chunk_overlap_tokens,
                chars_per_token: self.chars_per_token,
            },
            retrieval: RetrievalConfig {
                top_k: self.top_k,
                fetch_k: self.fetch_k,
                mmr_lambda: self.mmr_lambda,
                min_vdb_score: self.min_vdb_score,
                min_rerank_score: self.min_rerank_score,
                relax_empty_floor: self.relax_empty_floor,
            },
            pricing: Pricing {
                embed_usd_per_1m: self.embed_usd_per_1m,
                prompt_usd_per_1m: self.prompt_usd_per_1m,
                completion_usd_per_1m: self.completion_usd_per_1m,
            },
            batches: BatchLimits {
                embed_batch_size: self.embed_batch_size,
                upsert_batch_size: self.upsert_batch_size,
            },
        })
    }
}
