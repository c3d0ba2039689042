//! driftline-feed — upstream record stream client.
//!
//! Talks to a FastAPI-style record server over plain HTTP: a single GET to
//! the base URL is used as a startup connectivity probe, and
//! `GET /record/{count}` returns a Server-Sent-Events stream of one JSON
//! record per `data: ` line (spec §6.4).

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::Request;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("upstream returned HTTP {status} for {url}")]
    BadStatus { status: u16, url: String },
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: hyper_util::client::legacy::Error,
    },
    #[error("failed to read response body from {url}: {source}")]
    Body {
        url: String,
        #[source]
        source: hyper::Error,
    },
    #[error("invalid upstream URL {0}")]
    InvalidUrl(String),
}

/// Pacing knobs for continuous consumption (spec §6.4).
#[derive(Debug, Clone)]
pub struct ConsumeConfig {
    pub batch_size: u32,
    pub total_batches: u32,
    pub delay: Duration,
    pub batch_timeout: Duration,
}

impl Default for ConsumeConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            total_batches: 10,
            delay: Duration::from_millis(500),
            batch_timeout: Duration::from_secs(30),
        }
    }
}

/// Outcome of fetching one batch: records successfully parsed, plus how many
/// lines were dropped for being malformed JSON (spec §7, "Upstream feed
/// interruption").
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub records: Vec<Value>,
    pub malformed: u32,
}

/// Client for the upstream record-stream server.
pub struct RecordStream {
    base_url: String,
    client: Client<HttpConnector, Empty<Bytes>>,
    batch_timeout: Duration,
}

impl RecordStream {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_timeout(base_url, Duration::from_secs(30))
    }

    pub fn with_timeout(base_url: impl Into<String>, batch_timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self {
            base_url: base_url.into(),
            client,
            batch_timeout,
        }
    }

    /// Startup connectivity check against the server root (spec §6.4 —
    /// mirrors the original consumer's pre-flight `GET /` check).
    pub async fn probe(&self) -> Result<(), FeedError> {
        let uri = self
            .base_url
            .parse()
            .map_err(|_| FeedError::InvalidUrl(self.base_url.clone()))?;
        let request = Request::get(uri)
            .body(Empty::<Bytes>::new())
            .map_err(|_| FeedError::InvalidUrl(self.base_url.clone()))?;

        let response = tokio::time::timeout(Duration::from_secs(5), self.client.request(request))
            .await
            .map_err(|_| FeedError::BadStatus {
                status: 0,
                url: self.base_url.clone(),
            })?
            .map_err(|source| FeedError::Request {
                url: self.base_url.clone(),
                source,
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(FeedError::BadStatus {
                status: response.status().as_u16(),
                url: self.base_url.clone(),
            })
        }
    }

    /// Fetch one batch of `count` records from `/record/{count}` (spec
    /// §6.4). Malformed lines are skipped and logged, never fatal.
    pub async fn fetch_batch(&self, count: u32) -> Result<BatchResult, FeedError> {
        let url = format!("{}/record/{count}", self.base_url.trim_end_matches('/'));
        let uri = url.parse().map_err(|_| FeedError::InvalidUrl(url.clone()))?;
        let request = Request::get(uri)
            .body(Empty::<Bytes>::new())
            .map_err(|_| FeedError::InvalidUrl(url.clone()))?;

        tracing::info!(%url, count, "fetching batch");

        let response = tokio::time::timeout(self.batch_timeout, self.client.request(request))
            .await
            .map_err(|_| FeedError::BadStatus {
                status: 0,
                url: url.clone(),
            })?
            .map_err(|source| FeedError::Request {
                url: url.clone(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(FeedError::BadStatus {
                status: response.status().as_u16(),
                url,
            });
        }

        let body = collect_body(response.into_body(), &url).await?;
        Ok(parse_sse_records(&body))
    }

    /// Continuously fetch and hand off batches of records, sleeping
    /// `config.delay` between batches (spec §6.4). Errors fetching one
    /// batch are logged and the loop continues with the next batch rather
    /// than aborting the whole run. `stop` is checked between batches, never
    /// mid-record, so a caller (e.g. a ctrl-c handler) can request an early
    /// exit without tearing a batch in half (spec §5).
    pub async fn consume_continuous<F>(&self, config: &ConsumeConfig, stop: &AtomicBool, mut on_record: F) -> u64
    where
        F: FnMut(Value),
    {
        let mut total = 0u64;
        for batch_num in 1..=config.total_batches {
            if stop.load(Ordering::Relaxed) {
                tracing::info!(batch_num, "stop requested, ending consumption before next batch");
                break;
            }
            tracing::info!(batch_num, total_batches = config.total_batches, "starting batch");
            match self.fetch_batch(config.batch_size).await {
                Ok(result) => {
                    if result.malformed > 0 {
                        tracing::warn!(malformed = result.malformed, "dropped malformed records in batch");
                    }
                    for (i, record) in result.records.into_iter().enumerate() {
                        on_record(record);
                        total += 1;
                        if (i + 1) % 100 == 0 {
                            tracing::info!(processed = i + 1, batch_num, "batch progress");
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, batch_num, "batch fetch failed, continuing");
                }
            }

            if batch_num < config.total_batches {
                tokio::time::sleep(config.delay).await;
            }
        }
        total
    }
}

async fn collect_body(body: Incoming, url: &str) -> Result<String, FeedError> {
    let collected = body.collect().await.map_err(|source| FeedError::Body {
        url: url.to_string(),
        source,
    })?;
    Ok(String::from_utf8_lossy(&collected.to_bytes()).into_owned())
}

/// Parse an SSE body: each `data: {json}` line is one record; blank lines
/// and any other event-stream fields are ignored (spec §6.4).
fn parse_sse_records(body: &str) -> BatchResult {
    let mut result = BatchResult::default();
    for line in body.lines() {
        let Some(payload) = line.strip_prefix("data: ") else {
            continue;
        };
        match serde_json::from_str::<Value>(payload) {
            Ok(record) => result.records.push(record),
            Err(err) => {
                tracing::warn!(error = %err, "skipping malformed SSE record");
                result.malformed += 1;
            }
        }
    }
    result
}
