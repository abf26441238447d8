//! Vector index client and size-bounded upsert batching.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::metadata::MetadataMap;
use crate::retry::Backoff;

/// Serialized-size ceiling the index enforces per upsert call.
pub const MAX_UPSERT_BYTES: usize = 2 * 1024 * 1024;

/// Base delay between retried index requests.
const RETRY_BASE: Duration = Duration::from_millis(500);

/// One vector plus metadata, the unit upserted to the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    /// Stable identity; upserts with the same id overwrite in place.
    pub id: String,
    /// Embedding values.
    pub values: Vec<f32>,
    /// Coerced source-row fields.
    pub metadata: MetadataMap,
}

impl VectorRecord {
    /// Byte length of this record's JSON encoding.
    pub fn serialized_size(&self) -> usize {
        serde_json::to_vec(self).map(|bytes| bytes.len()).unwrap_or(0)
    }
}

/// Groups records into upsert batches bounded by serialized size.
///
/// Records are appended while the running size stays within `max_bytes`;
/// a record that would overflow the current batch starts a new one, and the
/// final partial batch is flushed. No record is ever dropped.
pub fn batch_by_size(records: Vec<VectorRecord>, max_bytes: usize) -> Vec<Vec<VectorRecord>> {
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut current_bytes = 0usize;
    for record in records {
        let size = record.serialized_size();
        if !current.is_empty() && current_bytes + size > max_bytes {
            batches.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += size;
        current.push(record);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// HTTP client for a Pinecone-style vector index data plane.
pub struct VectorIndex {
    client: Client,
    upsert_url: String,
    query_url: String,
    namespace: String,
    max_retries: usize,
}

impl VectorIndex {
    /// Builds a new index client scoped to the given namespace.
    pub fn new(
        host: String,
        api_key: String,
        namespace: String,
        timeout: Duration,
        max_retries: usize,
    ) -> Result<Self> {
        anyhow::ensure!(!host.trim().is_empty(), "missing vector index host");
        anyhow::ensure!(!api_key.trim().is_empty(), "missing vector index API key");
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "Api-Key",
            HeaderValue::from_str(api_key.trim()).context("invalid vector index API key")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build vector index HTTP client")?;
        let trimmed = host.trim().trim_end_matches('/');
        let base = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            trimmed.to_string()
        } else {
            format!("https://{trimmed}")
        };
        Ok(Self {
            client,
            upsert_url: format!("{base}/vectors/upsert"),
            query_url: format!("{base}/query"),
            namespace,
            max_retries,
        })
    }

    /// Namespace shared by producer and consumer.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Upserts one batch of records, returning the index's accepted count.
    pub async fn upsert(&self, records: &[VectorRecord]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        let request = UpsertRequest {
            vectors: records,
            namespace: &self.namespace,
        };
        let response: UpsertResponse = self.post(&self.upsert_url, &request).await?;
        Ok(response.upserted_count.unwrap_or(records.len() as u64))
    }

    /// Similarity query against the configured namespace.
    pub async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<QueryMatch>> {
        let request = QueryRequest {
            vector,
            top_k,
            namespace: &self.namespace,
            include_metadata: true,
        };
        let response: QueryResponse = self.post(&self.query_url, &request).await?;
        Ok(response.matches)
    }

    async fn post<Req, Resp>(&self, url: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: for<'de> Deserialize<'de>,
    {
        let mut backoff = Backoff::new(RETRY_BASE);
        loop {
            let response = self.client.post(url).json(request).send().await;
            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp
                            .json()
                            .await
                            .context("failed to parse vector index response");
                    }
                    let body = resp
                        .text()
                        .await
                        .unwrap_or_else(|_| "<body unavailable>".to_string());
                    if should_retry(status) && (backoff.failures() as usize) + 1 < self.max_retries
                    {
                        tokio::time::sleep(backoff.record_failure()).await;
                        continue;
                    }
                    anyhow::bail!("vector index request failed ({}): {}", status, body);
                }
                Err(err) => {
                    if is_retryable_error(&err)
                        && (backoff.failures() as usize) + 1 < self.max_retries
                    {
                        tokio::time::sleep(backoff.record_failure()).await;
                        continue;
                    }
                    return Err(err.into());
                }
            }
        }
    }
}

fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_body() || err.is_request() || err.is_decode()
}

#[derive(Serialize)]
struct UpsertRequest<'a> {
    vectors: &'a [VectorRecord],
    namespace: &'a str,
}

#[derive(Debug, Deserialize)]
struct UpsertResponse {
    #[serde(rename = "upsertedCount")]
    upserted_count: Option<u64>,
}

#[derive(Serialize)]
struct QueryRequest<'a> {
    vector: &'a [f32],
    #[serde(rename = "topK")]
    top_k: usize,
    namespace: &'a str,
    #[serde(rename = "includeMetadata")]
    include_metadata: bool,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<QueryMatch>,
}

/// One similarity hit returned by the index.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryMatch {
    /// Record identity.
    pub id: String,
    /// Similarity score.
    pub score: f32,
    /// Metadata stored with the record, when requested.
    #[serde(default)]
    pub metadata: Option<MetadataMap>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataValue;
    use pretty_assertions::assert_eq;

    fn record(id: &str, values: usize) -> VectorRecord {
        VectorRecord {
            id: id.to_string(),
            values: vec![0.25; values],
            metadata: [(
                "sku".to_string(),
                MetadataValue::Str(format!("SKU-{id}")),
            )]
            .into_iter()
            .collect(),
        }
    }

    #[test]
    fn batches_respect_the_size_bound() {
        let records: Vec<VectorRecord> =
            (0..40).map(|i| record(&i.to_string(), 16)).collect();
        let max_bytes = records[0].serialized_size() * 4;
        let batches = batch_by_size(records.clone(), max_bytes);
        assert!(batches.len() > 1);
        for batch in &batches {
            let total: usize = batch.iter().map(VectorRecord::serialized_size).sum();
            assert!(total <= max_bytes, "batch of {total} bytes exceeds {max_bytes}");
        }
    }

    #[test]
    fn no_record_is_dropped_and_order_is_kept() {
        let records: Vec<VectorRecord> =
            (0..17).map(|i| record(&i.to_string(), 8)).collect();
        let batches = batch_by_size(records.clone(), record("0", 8).serialized_size() * 3);
        let flattened: Vec<VectorRecord> = batches.into_iter().flatten().collect();
        assert_eq!(flattened, records);
    }

    #[test]
    fn overflowing_record_starts_the_next_batch() {
        let small = record("small", 4);
        let big = record("big", 64);
        let max_bytes = small.serialized_size() + big.serialized_size() - 1;
        let batches = batch_by_size(vec![small.clone(), big.clone()], max_bytes);
        assert_eq!(batches, vec![vec![small], vec![big]]);
    }

    #[test]
    fn single_batch_when_everything_fits() {
        let records: Vec<VectorRecord> = (0..5).map(|i| record(&i.to_string(), 8)).collect();
        let batches = batch_by_size(records.clone(), MAX_UPSERT_BYTES);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0], records);
    }

    #[test]
    fn empty_input_yields_no_batches() {
        assert!(batch_by_size(Vec::new(), MAX_UPSERT_BYTES).is_empty());
    }
}
