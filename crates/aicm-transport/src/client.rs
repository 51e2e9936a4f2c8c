//! The reqwest-backed tracking API client.
//!
//! One client per tracker: a single pooled TLS connection set, bearer
//! auth from settings, and an in-call retry loop for transient failures.

use crate::error::TransportError;
use crate::retry::{parse_retry_after, RetryPolicy};
use crate::wire::{ApiErrorBody, LimitsResponse, RecordResult, RecordStatus, TrackRequest, TrackResponse};
use crate::{redact, Transport};
use aicm_core::limits::TriggeredLimit;
use aicm_core::{Settings, UsageRecord};
use async_trait::async_trait;
use reqwest::header;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;

/// Batch-level status marking every record's service key unknown
const BATCH_SERVICE_KEY_UNKNOWN: &str = "service_key_unknown";

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for tracking API client behavior
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bearer credential
    pub api_key: String,

    /// Full URL of the `/track` endpoint
    pub track_url: String,

    /// Full URL of the `/triggered-limits` endpoint
    pub limits_url: String,

    /// Per-request timeout
    pub timeout: Duration,

    /// Retry policy for transient failures within one delivery try
    pub retry: RetryPolicy,

    /// Whether to log request/response bodies (redacted)
    pub log_bodies: bool,

    /// User agent string for API requests
    pub user_agent: String,
}

impl ClientConfig {
    /// Derive client configuration from resolved settings
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            api_key: settings.api_key.clone(),
            track_url: settings.track_url(),
            limits_url: settings.limits_url(),
            timeout: settings.timeout,
            retry: RetryPolicy::with_max_attempts(settings.max_attempts),
            log_bodies: settings.log_bodies,
            user_agent: format!("aicm-rust/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

// ============================================================================
// Responses
// ============================================================================

/// Client-level outcome of one successful `send_batch` call
#[derive(Debug, Clone)]
pub struct BatchResponse {
    /// Per-record outcomes, in request order where the server provides them
    pub results: Vec<RecordResult>,

    /// Authoritative limit set, when the response carried one
    pub triggered_limits: Option<Vec<TriggeredLimit>>,
}

impl BatchResponse {
    /// Look up the outcome for a specific record
    pub fn result_for(&self, response_id: &str) -> Option<&RecordResult> {
        self.results
            .iter()
            .find(|result| result.response_id == response_id)
    }
}

/// Outcome of a `fetch_limits` call
#[derive(Debug, Clone)]
pub enum LimitsFetch {
    /// The server's ETag matched; the cached set is still current
    Unchanged,
    /// A fresh limit set, with the ETag to present next time
    New {
        limits: Vec<TriggeredLimit>,
        etag: Option<String>,
    },
}

// ============================================================================
// TrackClient
// ============================================================================

/// HTTP client for the tracking API
#[derive(Debug)]
pub struct TrackClient {
    http: reqwest::Client,
    config: ClientConfig,
}

impl TrackClient {
    /// Build a client with its own connection pool
    pub fn new(config: ClientConfig) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(TransportError::Network)?;

        Ok(Self { http, config })
    }

    /// Build a client straight from resolved settings
    pub fn from_settings(settings: &Settings) -> Result<Self, TransportError> {
        Self::new(ClientConfig::from_settings(settings))
    }

    /// Execute one request-producing closure with retry on transient
    /// failures.
    ///
    /// A 429 response waits for the server's `Retry-After` when present;
    /// everything else backs off exponentially per the retry policy.
    async fn execute_with_retry<F>(
        &self,
        operation_name: &str,
        request_fn: F,
    ) -> Result<reqwest::Response, TransportError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let error = match request_fn().send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) if response.status() == StatusCode::NOT_MODIFIED => {
                    return Ok(response)
                }
                Ok(response) => Self::classify_response(response).await,
                Err(e) => Self::classify_request_error(e),
            };

            if error.is_transient() && self.config.retry.should_retry(attempt) {
                let delay = error
                    .retry_after()
                    .unwrap_or_else(|| self.config.retry.calculate_delay(attempt));
                warn!(
                    operation = operation_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "transient transport failure, retrying"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            return Err(error);
        }
    }

    /// Turn a non-success HTTP response into a classified error
    async fn classify_response(response: reqwest::Response) -> TransportError {
        let status = response.status();
        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.text().await.unwrap_or_default();

        if status == StatusCode::TOO_MANY_REQUESTS {
            return TransportError::RateLimited { retry_after };
        }
        if status.is_server_error() {
            return TransportError::Http {
                status: status.as_u16(),
                message: body.chars().take(200).collect(),
            };
        }

        let error_body = ApiErrorBody::parse(&body);
        TransportError::Rejected {
            status: status.as_u16(),
            detail: error_body
                .detail
                .unwrap_or_else(|| body.chars().take(200).collect()),
            code: error_body.code,
        }
    }

    fn classify_request_error(error: reqwest::Error) -> TransportError {
        if error.is_timeout() {
            TransportError::Timeout
        } else {
            TransportError::Network(error)
        }
    }

    /// Map a parsed response body onto per-record results.
    ///
    /// A batch-level `service_key_unknown` status marks every record;
    /// otherwise the server's `results` list is taken as-is.
    fn assemble(records: &[UsageRecord], parsed: TrackResponse) -> BatchResponse {
        let results = if parsed.status.as_deref() == Some(BATCH_SERVICE_KEY_UNKNOWN) {
            records
                .iter()
                .map(|record| RecordResult {
                    response_id: record.response_id().to_string(),
                    status: RecordStatus::ServiceKeyUnknown,
                    cost_event_id: None,
                })
                .collect()
        } else {
            parsed.results
        };

        BatchResponse {
            results,
            triggered_limits: parsed.triggered_limits,
        }
    }
}

#[async_trait]
impl Transport for TrackClient {
    async fn send_batch(&self, records: &[UsageRecord]) -> Result<BatchResponse, TransportError> {
        let request = TrackRequest::from_records(records);
        let body = serde_json::to_value(&request)?;

        if self.config.log_bodies {
            debug!(body = %redact::redact_json(&body), "track request");
        }

        let response = self
            .execute_with_retry("send_batch", || {
                self.http
                    .post(&self.config.track_url)
                    .bearer_auth(&self.config.api_key)
                    .header(header::ACCEPT, "application/json")
                    .json(&body)
            })
            .await?;

        let text = response.text().await.map_err(TransportError::Network)?;
        if self.config.log_bodies {
            debug!(body = %redact::redact_text(&text), "track response");
        }

        let parsed: TrackResponse = serde_json::from_str(&text)?;
        Ok(Self::assemble(records, parsed))
    }

    async fn fetch_limits(&self, etag: Option<&str>) -> Result<LimitsFetch, TransportError> {
        let response = self
            .execute_with_retry("fetch_limits", || {
                let mut request = self
                    .http
                    .get(&self.config.limits_url)
                    .bearer_auth(&self.config.api_key)
                    .header(header::ACCEPT, "application/json");
                if let Some(etag) = etag {
                    request = request.header(header::IF_NONE_MATCH, etag);
                }
                request
            })
            .await?;

        if response.status() == StatusCode::NOT_MODIFIED {
            return Ok(LimitsFetch::Unchanged);
        }

        let etag = response
            .headers()
            .get(header::ETAG)
            .and_then(|value| value.to_str().ok())
            .map(String::from);
        let text = response.text().await.map_err(TransportError::Network)?;
        if self.config.log_bodies {
            debug!(body = %redact::redact_text(&text), "limits response");
        }

        let parsed = LimitsResponse::parse(&text)?;
        Ok(LimitsFetch::New {
            limits: parsed.triggered_limits,
            etag,
        })
    }
}
