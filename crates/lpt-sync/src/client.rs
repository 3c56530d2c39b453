use lpt_core::IngestBatch;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

use crate::fetch::{classify_reqwest_error, classify_status, BackoffPolicy};

pub const INGEST_SECRET_HEADER: &str = "X-Ingest-Secret";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IngestAck {
    pub ok: bool,
    pub inserted: usize,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: String,
}

#[derive(Debug, Error)]
pub enum IngestClientError {
    #[error("ingest request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("ingest endpoint returned {status}: {message}")]
    Status { status: u16, message: String },
}

/// Accepts either an API base (`https://api.example`) or the full ingest URL.
pub fn ingest_endpoint(base: &str) -> String {
    let trimmed = base.trim().trim_end_matches('/');
    if trimmed.ends_with("ingest") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/api/ingest")
    }
}

#[derive(Debug, Clone)]
pub struct IngestClient {
    http: reqwest::Client,
    endpoint: String,
    secret: Option<String>,
    backoff: BackoffPolicy,
}

impl IngestClient {
    pub fn new(http: reqwest::Client, base_url: &str, secret: Option<String>) -> Self {
        Self {
            http,
            endpoint: ingest_endpoint(base_url),
            secret: secret.filter(|s| !s.is_empty()),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn push(&self, batch: &IngestBatch) -> Result<IngestAck, IngestClientError> {
        let rows = batch.listings().len();
        let span = info_span!("ingest_push", endpoint = %self.endpoint, rows);
        self.push_with_retries(batch).instrument(span).await
    }

    async fn push_with_retries(&self, batch: &IngestBatch) -> Result<IngestAck, IngestClientError> {
        let mut attempt = 0;
        loop {
            let mut request = self.http.post(&self.endpoint).json(batch);
            if let Some(secret) = &self.secret {
                request = request.header(INGEST_SECRET_HEADER, secret);
            }

            let err = match request.send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp.json::<IngestAck>().await?),
                Ok(resp) => {
                    let status = resp.status();
                    let message = error_message(resp).await;
                    if self.backoff.should_retry(classify_status(status), attempt) {
                        warn!(%status, attempt, "retrying ingest push after http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    IngestClientError::Status {
                        status: status.as_u16(),
                        message,
                    }
                }
                Err(err) => {
                    if self.backoff.should_retry(classify_reqwest_error(&err), attempt) {
                        warn!(error = %err, attempt, "retrying ingest push after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    IngestClientError::Request(err)
                }
            };
            return Err(err);
        }
    }
}

async fn error_message(resp: reqwest::Response) -> String {
    let status = resp.status();
    match resp.json::<ErrorEnvelope>().await {
        Ok(envelope) => envelope.error,
        Err(_) => status
            .canonical_reason()
            .unwrap_or_else(|| StatusCode::INTERNAL_SERVER_ERROR.as_str())
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_normalization() {
        assert_eq!(ingest_endpoint("https://api.example"), "https://api.example/api/ingest");
        assert_eq!(ingest_endpoint("https://api.example/"), "https://api.example/api/ingest");
        assert_eq!(ingest_endpoint("https://api.example/api/ingest"), "https://api.example/api/ingest");
        assert_eq!(ingest_endpoint("https://api.example/api/ingest/"), "https://api.example/api/ingest");
    }

    #[test]
    fn blank_secret_is_not_sent() {
        let client = IngestClient::new(reqwest::Client::new(), "http://localhost:8787", Some(String::new()));
        assert!(client.secret.is_none());
        assert_eq!(client.endpoint(), "http://localhost:8787/api/ingest");
    }
}
