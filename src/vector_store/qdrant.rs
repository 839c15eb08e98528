//! Qdrant REST client implementing [`VectorStore`].

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    ChunkPayload, PayloadFilter, Point, ScoredPoint, SearchRequest, VectorStore, DOC_ID_FIELD,
};

/// Blocking client for a single Qdrant collection using cosine distance.
#[derive(Clone)]
pub struct QdrantStore {
    client: Client,
    base_url: String,
    collection: String,
    dimensions: usize,
}

impl QdrantStore {
    /// Builds a client for `collection` on the cluster at `base_url`.
    ///
    /// # Arguments
    /// * `base_url` - Cluster URL, e.g. `https://cluster-id.cloud.qdrant.io:6333`
    /// * `api_key` - Value for the `api-key` header, when the cluster requires one
    /// * `dimensions` - Vector size used when the collection has to be created
    pub fn new(
        base_url: String,
        api_key: Option<String>,
        collection: String,
        dimensions: usize,
        timeout: Duration,
    ) -> Result<Self> {
        anyhow::ensure!(
            base_url.starts_with("http://") || base_url.starts_with("https://"),
            "Qdrant URL must be an http(s) URL"
        );
        anyhow::ensure!(!collection.trim().is_empty(), "missing Qdrant collection");
        anyhow::ensure!(dimensions > 0, "vector dimensions must be positive");
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(key) = api_key.as_deref().map(str::trim).filter(|key| !key.is_empty()) {
            headers.insert(
                "api-key",
                HeaderValue::from_str(key).context("invalid Qdrant API key")?,
            );
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build Qdrant HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            collection,
            dimensions,
        })
    }

    fn collection_url(&self, suffix: &str) -> String {
        format!("{}/collections/{}{}", self.base_url, self.collection, suffix)
    }

    fn execute<T: DeserializeOwned>(&self, request: RequestBuilder, action: &str) -> Result<T> {
        let resp = request
            .send()
            .with_context(|| format!("failed to call Qdrant ({action})"))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            anyhow::bail!("Qdrant {} failed ({}): {}", action, status, body);
        }
        let parsed: QdrantResponse<T> = resp
            .json()
            .with_context(|| format!("failed to parse Qdrant {action} response"))?;
        Ok(parsed.result)
    }

    fn ensure_doc_id_index(&self) -> Result<()> {
        let body = IndexRequest {
            field_name: DOC_ID_FIELD,
            field_schema: "keyword",
        };
        let resp = self
            .client
            .put(self.collection_url("/index?wait=true"))
            .json(&body)
            .send()
            .context("failed to call Qdrant (create payload index)")?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let text = resp
            .text()
            .unwrap_or_else(|_| "<body unavailable>".to_string());
        if text.to_lowercase().contains("exists") {
            return Ok(());
        }
        anyhow::bail!("Qdrant payload index creation failed ({}): {}", status, text)
    }
}

impl VectorStore for QdrantStore {
    fn collection(&self) -> &str {
        &self.collection
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn ensure_collection(&self) -> Result<()> {
        let resp = self
            .client
            .get(self.collection_url(""))
            .send()
            .context("failed to call Qdrant (get collection)")?;
        match resp.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => {
                tracing::info!(
                    collection = %self.collection,
                    dimensions = self.dimensions,
                    "creating Qdrant collection"
                );
                let body = CreateCollection {
                    vectors: VectorParams {
                        size: self.dimensions,
                        distance: "Cosine",
                    },
                };
                let _: Value = self.execute(
                    self.client.put(self.collection_url("")).json(&body),
                    "create collection",
                )?;
            }
            status => {
                let body = resp
                    .text()
                    .unwrap_or_else(|_| "<body unavailable>".to_string());
                anyhow::bail!("Qdrant get collection failed ({}): {}", status, body);
            }
        }
        self.ensure_doc_id_index()
    }

    fn upsert(&self, points: &[Point]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let body = UpsertRequest { points };
        let _: Value = self.execute(
            self.client
                .put(self.collection_url("/points?wait=true"))
                .json(&body),
            "upsert",
        )?;
        Ok(())
    }

    fn search(&self, request: &SearchRequest) -> Result<Vec<ScoredPoint>> {
        let body = SearchBody {
            vector: &request.vector,
            limit: request.limit,
            with_payload: true,
            with_vector: request.with_vector,
            filter: request.filter.as_ref().map(WireFilter::from),
        };
        let hits: Vec<WirePoint> = self.execute(
            self.client
                .post(self.collection_url("/points/search"))
                .json(&body),
            "search",
        )?;
        hits.into_iter().map(WirePoint::into_scored).collect()
    }

    fn delete_by_filter(&self, filter: &PayloadFilter) -> Result<()> {
        let body = DeleteRequest {
            filter: WireFilter::from(filter),
        };
        let _: Value = self.execute(
            self.client
                .post(self.collection_url("/points/delete?wait=true"))
                .json(&body),
            "delete",
        )?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct QdrantResponse<T> {
    result: T,
}

#[derive(Serialize)]
struct CreateCollection {
    vectors: VectorParams,
}

#[derive(Serialize)]
struct VectorParams {
    size: usize,
    distance: &'static str,
}

#[derive(Serialize)]
struct IndexRequest {
    field_name: &'static str,
    field_schema: &'static str,
}

#[derive(Serialize)]
struct UpsertRequest<'a> {
    points: &'a [Point],
}

#[derive(Serialize)]
struct SearchBody<'a> {
    vector: &'a [f32],
    limit: usize,
    with_payload: bool,
    with_vector: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<WireFilter<'a>>,
}

#[derive(Serialize)]
struct DeleteRequest<'a> {
    filter: WireFilter<'a>,
}

#[derive(Debug, Serialize)]
struct WireFilter<'a> {
    must: Vec<WireCondition<'a>>,
}

#[derive(Debug, Serialize)]
struct WireCondition<'a> {
    key: &'a str,
    #[serde(rename = "match")]
    matches: WireMatch<'a>,
}

#[derive(Debug, Serialize)]
struct WireMatch<'a> {
    value: &'a str,
}

impl<'a> From<&'a PayloadFilter> for WireFilter<'a> {
    fn from(filter: &'a PayloadFilter) -> Self {
        Self {
            must: filter
                .must
                .iter()
                .map(|cond| WireCondition {
                    key: &cond.key,
                    matches: WireMatch { value: &cond.value },
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PointId {
    Num(u64),
    Uuid(String),
}

impl PointId {
    fn into_string(self) -> String {
        match self {
            Self::Num(id) => id.to_string(),
            Self::Uuid(id) => id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WirePoint {
    id: PointId,
    #[serde(default)]
    score: f32,
    #[serde(default)]
    vector: Option<Vec<f32>>,
    #[serde(default)]
    payload: Option<Value>,
}

impl WirePoint {
    fn into_scored(self) -> Result<ScoredPoint> {
        let id = self.id.into_string();
        let payload = self
            .payload
            .ok_or_else(|| anyhow!("Qdrant point {id} has no payload"))?;
        let payload = ChunkPayload::from_value(payload)
            .with_context(|| format!("invalid payload on Qdrant point {id}"))?;
        Ok(ScoredPoint {
            id,
            score: self.score,
            vector: self.vector,
            payload,
        })
    }
}
