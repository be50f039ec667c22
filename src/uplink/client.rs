//! Ingest Client — sends one batch of samples to the tracking backend
//!
//! The endpoint is all-or-nothing per batch: a 2xx accepts every sample in
//! the request, anything else rejects all of them.

use super::auth::TokenProvider;
use super::types::SampleRecord;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Delivery failures, classified by what the worker should do next
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("network error: {0}")]
    Transient(String),
    #[error("send timed out after {0:?}")]
    Timeout(Duration),
    #[error("server returned status {0}")]
    Server(u16),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("batch rejected with status {status} (payload md5 {digest})")]
    PermanentRejection { status: u16, digest: String },
    #[error("could not encode batch: {0}")]
    Encoding(String),
}

/// What happens to a batch after a failed send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Back off and retry, counting the attempt
    Retry,
    /// Back off and retry without counting the attempt
    Defer,
    /// Never retry
    Abandon,
}

impl DeliveryError {
    pub fn disposition(&self) -> Disposition {
        match self {
            DeliveryError::Transient(_) | DeliveryError::Timeout(_) | DeliveryError::Server(_) => {
                Disposition::Retry
            }
            DeliveryError::Auth(_) => Disposition::Defer,
            DeliveryError::PermanentRejection { .. } | DeliveryError::Encoding(_) => {
                Disposition::Abandon
            }
        }
    }
}

/// Map an HTTP status to a delivery outcome.
///
/// 401/403 are auth problems, 408/429 are transient, any other 4xx means the
/// endpoint will never accept this payload.
pub fn classify_status(status: u16, payload: &[u8]) -> Result<(), DeliveryError> {
    match status {
        200..=299 => Ok(()),
        401 | 403 => Err(DeliveryError::Auth(format!("status {status}"))),
        408 | 429 => Err(DeliveryError::Server(status)),
        400..=499 => Err(DeliveryError::PermanentRejection {
            status,
            digest: payload_digest(payload),
        }),
        _ => Err(DeliveryError::Server(status)),
    }
}

/// Hex md5 of a request body, logged when a batch is rejected.
pub fn payload_digest(payload: &[u8]) -> String {
    format!("{:x}", md5::compute(payload))
}

/// Sends batches to the ingestion endpoint
#[async_trait]
pub trait IngestClient: Send + Sync {
    async fn send_batch(&self, records: &[SampleRecord]) -> Result<(), DeliveryError>;

    /// Endpoint description for logging
    fn endpoint(&self) -> &str;
}

/// HTTP client for the ingestion endpoint
#[derive(Clone)]
pub struct HttpIngestClient {
    http: reqwest::Client,
    url: String,
    timeout: Duration,
    tokens: Arc<dyn TokenProvider>,
}

impl HttpIngestClient {
    pub fn new(
        url: &str,
        timeout: Duration,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            url: url.to_string(),
            timeout,
            tokens,
        })
    }
}

#[async_trait]
impl IngestClient for HttpIngestClient {
    async fn send_batch(&self, records: &[SampleRecord]) -> Result<(), DeliveryError> {
        let Some(token) = self.tokens.token() else {
            self.tokens.refresh();
            return Err(DeliveryError::Auth("no token available".to_string()));
        };

        let body = serde_json::to_vec(records).map_err(|e| DeliveryError::Encoding(e.to_string()))?;
        let vehicle_id = records.first().map(|r| r.vehicle_id).unwrap_or_default();

        let resp = self
            .http
            .post(&self.url)
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header("X-Vehicle-ID", vehicle_id.to_string())
            .body(body.clone())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::Timeout(self.timeout)
                } else {
                    DeliveryError::Transient(e.to_string())
                }
            })?;

        let status = resp.status().as_u16();
        debug!(status, samples = records.len(), "Ingest endpoint responded");

        let outcome = classify_status(status, &body);
        if let Err(DeliveryError::Auth(_)) = outcome {
            self.tokens.refresh();
        }
        outcome
    }

    fn endpoint(&self) -> &str {
        &self.url
    }
}
