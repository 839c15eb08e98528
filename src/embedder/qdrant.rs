//! Qdrant Cloud Inference embedding client (e.g. `sentence-transformers/all-MiniLM-L6-v2`, 384 dims).

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::{post_json, Embedder, RetryPolicy};

/// Blocking embeddings client for Qdrant Cloud Inference endpoints.
#[derive(Clone)]
pub struct QdrantEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    retry: RetryPolicy,
    batch_size: usize,
}

impl QdrantEmbedder {
    /// Builds a new inference client.
    ///
    /// # Arguments
    /// * `api_key` - Value for the `api-key` header (usually `QDRANT_API_KEY`)
    /// * `endpoint` - Full inference endpoint, e.g. `https://cluster-id.cloud.qdrant.io/inference/text`
    /// * `model` - Model identifier advertised by the cluster
    pub fn new(
        api_key: String,
        endpoint: String,
        model: String,
        timeout: Duration,
        retry: RetryPolicy,
        batch_size: usize,
    ) -> Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing Qdrant API key");
        anyhow::ensure!(
            endpoint.starts_with("http://") || endpoint.starts_with("https://"),
            "Qdrant inference endpoint must be an http(s) URL"
        );
        anyhow::ensure!(!model.trim().is_empty(), "missing Qdrant model name");
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "api-key",
            HeaderValue::from_str(api_key.trim()).context("invalid Qdrant API key")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build Qdrant inference HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model,
            retry,
            batch_size: batch_size.max(1),
        })
    }
}

impl Embedder for QdrantEmbedder {
    fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(inputs.len());
        for batch in inputs.chunks(self.batch_size) {
            let request = InferenceRequest {
                model: &self.model,
                inputs: batch,
            };
            let resp = post_json(&self.client, &self.endpoint, &request, self.retry, "Qdrant")?;
            let payload: InferenceResponse = resp
                .json()
                .context("failed to parse Qdrant inference response")?;
            out.extend(payload.into_embeddings(batch.len())?);
        }
        Ok(out)
    }
}

#[derive(Serialize)]
struct InferenceRequest<'a> {
    model: &'a str,
    #[serde(rename = "input")]
    inputs: &'a [&'a str],
}

/// The inference API has answered with either `data[]` or a bare `embeddings[]`.
#[derive(Debug, Deserialize)]
struct InferenceResponse {
    #[serde(default)]
    data: Vec<InferenceData>,
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
struct InferenceData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

impl InferenceResponse {
    fn into_embeddings(self, expected_len: usize) -> Result<Vec<Vec<f32>>> {
        let vectors = if !self.data.is_empty() {
            let mut data = self.data;
            data.sort_by_key(|d| d.index.unwrap_or(0));
            data.into_iter().map(|d| d.embedding).collect::<Vec<_>>()
        } else if !self.embeddings.is_empty() {
            self.embeddings
        } else {
            return Err(anyhow!("Qdrant response missing embedding payloads"));
        };
        anyhow::ensure!(
            vectors.len() == expected_len,
            "Qdrant returned {} embeddings for {} inputs",
            vectors.len(),
            expected_len
        );
        Ok(vectors)
    }
}
