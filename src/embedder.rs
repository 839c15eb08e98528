//! Embedding providers and the trait the pipeline consumes.

pub mod cache;
pub mod openai;
pub mod qdrant;

use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use serde::Serialize;

/// Turns texts into fixed-dimension vectors.
pub trait Embedder: Send + Sync {
    /// Embeds `inputs`, returning one vector per input in the same order.
    fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>>;

    /// Embeds a single text.
    fn embed_one(&self, input: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[input])?;
        anyhow::ensure!(
            vectors.len() == 1,
            "embedder returned {} vectors for one input",
            vectors.len()
        );
        vectors
            .pop()
            .ok_or_else(|| anyhow!("embedder returned no vector"))
    }
}

/// Attempt budget for transient HTTP failures (429, 5xx, connect/timeout errors).
///
/// The default is a single attempt; callers opt into retries explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: usize,
}

impl RetryPolicy {
    /// Allows up to `max_attempts` requests (at least one).
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// Total requests allowed per call.
    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    fn should_retry(&self, status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
    }

    fn is_retryable_error(&self, err: &reqwest::Error) -> bool {
        err.is_timeout() || err.is_connect() || err.is_body() || err.is_request()
    }

    fn backoff(&self, attempt: usize) -> Duration {
        let capped = attempt.min(5) as u32;
        Duration::from_millis(500 * (1 << capped))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(1)
    }
}

/// POSTs `body` as JSON, retrying per `policy`, and returns the first successful response.
pub(crate) fn post_json<B: Serialize + ?Sized>(
    client: &Client,
    endpoint: &str,
    body: &B,
    policy: RetryPolicy,
    provider: &str,
) -> Result<Response> {
    let mut attempt = 0usize;
    loop {
        match client.post(endpoint).json(body).send() {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    return Ok(resp);
                }
                let text = resp
                    .text()
                    .unwrap_or_else(|_| "<body unavailable>".to_string());
                if policy.should_retry(status) && attempt + 1 < policy.max_attempts {
                    attempt += 1;
                    tracing::warn!(provider, %status, attempt, "retrying embedding request");
                    thread::sleep(policy.backoff(attempt));
                    continue;
                }
                anyhow::bail!("{} embeddings request failed ({}): {}", provider, status, text);
            }
            Err(err) => {
                if policy.is_retryable_error(&err) && attempt + 1 < policy.max_attempts {
                    attempt += 1;
                    tracing::warn!(provider, error = %err, attempt, "retrying embedding request");
                    thread::sleep(policy.backoff(attempt));
                    continue;
                }
                return Err(err).with_context(|| format!("failed to call {provider} embeddings"));
            }
        }
    }
}
