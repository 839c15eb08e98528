//! Approximate token counts and USD estimates. Pure accounting.

use serde::Serialize;

use crate::config::Pricing;

/// Approximate token count of `text`, rounding up.
pub fn approx_tokens(text: &str, chars_per_token: f64) -> usize {
    let chars = text.chars().count() as f64;
    (chars / chars_per_token.max(1.0)).ceil() as usize
}

/// Price of `tokens` at `usd_per_1m`; zero when the price is unset.
pub fn cost_usd(tokens: usize, usd_per_1m: f64) -> f64 {
    if usd_per_1m == 0.0 {
        return 0.0;
    }
    tokens as f64 / 1_000_000.0 * usd_per_1m
}

/// Token and cost estimate for an embedding call.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct EmbeddingEstimate {
    /// Summed approximate tokens.
    pub approx_tokens: usize,
    /// Estimated USD.
    pub approx_cost_usd: f64,
}

/// Token usage reported by an answer generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TokenUsage {
    /// Prompt tokens.
    pub prompt_tokens: usize,
    /// Completion tokens.
    pub completion_tokens: usize,
    /// Total tokens as reported by the provider.
    pub total_tokens: usize,
}

/// Applies one pricing table and token ratio to pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostEstimator {
    chars_per_token: f64,
    pricing: Pricing,
}

impl CostEstimator {
    /// Builds an estimator for one token ratio and price table.
    pub fn new(chars_per_token: f64, pricing: Pricing) -> Self {
        Self {
            chars_per_token,
            pricing,
        }
    }

    /// Approximate tokens in `text`.
    pub fn tokens(&self, text: &str) -> usize {
        approx_tokens(text, self.chars_per_token)
    }

    /// Sums token estimates over `texts` and prices them at the embedding rate.
    pub fn embedding<'a>(&self, texts: impl IntoIterator<Item = &'a str>) -> EmbeddingEstimate {
        let approx_tokens = texts.into_iter().map(|t| self.tokens(t)).sum();
        EmbeddingEstimate {
            approx_tokens,
            approx_cost_usd: cost_usd(approx_tokens, self.pricing.embed_usd_per_1m),
        }
    }

    /// Prompt plus completion cost of one generation.
    pub fn generation(&self, usage: &TokenUsage) -> f64 {
        cost_usd(usage.prompt_tokens, self.pricing.prompt_usd_per_1m)
            + cost_usd(usage.completion_tokens, self.pricing.completion_usd_per_1m)
    }
}
