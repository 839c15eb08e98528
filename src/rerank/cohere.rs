//! Cohere `/v1/rerank` client.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::{RerankScore, Reranker};

/// Public Cohere rerank endpoint.
pub const COHERE_RERANK_URL: &str = "https://api.cohere.ai/v1/rerank";

/// Blocking Cohere reranker.
pub struct CohereReranker {
    client: Client,
    endpoint: String,
    model: String,
    top_n: usize,
}

impl CohereReranker {
    /// Builds a client that asks for at most `top_n` results per call.
    pub fn new(api_key: String, model: String, top_n: usize, timeout: Duration) -> Result<Self> {
        Self::with_endpoint(api_key, model, top_n, timeout, COHERE_RERANK_URL.to_string())
    }

    /// Same as [`CohereReranker::new`] against a custom endpoint.
    pub fn with_endpoint(
        api_key: String,
        model: String,
        top_n: usize,
        timeout: Duration,
        endpoint: String,
    ) -> Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing Cohere API key");
        let mut headers = HeaderMap::new();
        let auth = format!("Bearer {}", api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth).context("invalid Cohere API key")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build Cohere HTTP client")?;
        Ok(Self {
            client,
            endpoint,
            model,
            top_n: top_n.max(1),
        })
    }
}

impl Reranker for CohereReranker {
    fn rerank(&self, query: &str, documents: &[&str]) -> Result<Vec<RerankScore>> {
        let body = RerankRequest {
            model: &self.model,
            query,
            documents,
            top_n: self.top_n.min(documents.len()),
            return_documents: false,
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .context("failed to call Cohere rerank")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            let snippet: String = text.chars().take(500).collect();
            bail!("Cohere rerank failed ({}): {}", status, snippet);
        }
        let parsed: RerankResponse = resp.json().context("failed to parse Cohere response")?;
        Ok(parsed.into_scores())
    }
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [&'a str],
    top_n: usize,
    return_documents: bool,
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    #[serde(default)]
    results: Vec<RerankResult>,
}

#[derive(Debug, Deserialize)]
struct RerankResult {
    index: usize,
    relevance_score: f32,
}

impl RerankResponse {
    fn into_scores(self) -> Vec<RerankScore> {
        self.results
            .into_iter()
            .map(|r| RerankScore {
                index: r.index,
                score: r.relevance_score,
            })
            .collect()
    }
}
