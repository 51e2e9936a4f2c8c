//! Transport error types with retry classification.

use std::time::Duration;
use thiserror::Error;

/// Errors from talking to the tracking API.
///
/// Transient variants are retried by the client's own retry loop and by
/// queued delivery workers; the rest are final the moment they occur.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Server error response (5xx).
    #[error("HTTP error: {status} - {message}")]
    Http { status: u16, message: String },

    /// Rate limited (429); wait for `retry_after` when the server sent one.
    #[error("Rate limited by server")]
    RateLimited { retry_after: Option<Duration> },

    /// Structured rejection (4xx other than 429). Never retried; the
    /// records in the batch are permanently refused.
    #[error("Request rejected ({status}): {detail}")]
    Rejected {
        status: u16,
        detail: String,
        code: Option<String>,
    },

    /// The per-request timeout fired.
    #[error("Request timeout")]
    Timeout,

    /// Network, TLS, or connection error.
    #[error("HTTP client error: {0}")]
    Network(#[from] reqwest::Error),

    /// The response body could not be parsed.
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// A configured endpoint URL is unusable.
    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(String),
}

impl TransportError {
    /// Check if this error represents a transient condition that may
    /// succeed if retried.
    ///
    /// Transient conditions:
    /// - Server errors (5xx)
    /// - Rate limiting (429)
    /// - Request timeouts
    /// - Network/transport errors
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http { status, .. } => *status >= 500,
            Self::RateLimited { .. } => true,
            Self::Timeout => true,
            Self::Network(_) => true,
            Self::Rejected { .. } => false,
            Self::Json(_) => false,
            Self::InvalidUrl(_) => false,
        }
    }

    /// Determine if this error should trigger a retry attempt.
    pub fn should_retry(&self) -> bool {
        self.is_transient()
    }

    /// Get the server-mandated retry delay, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
