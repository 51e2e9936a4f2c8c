//! # AICM Transport
//!
//! HTTP transport for the AICM usage tracking SDK.
//!
//! One [`TrackClient`] per tracker posts record batches to the `/track`
//! endpoint and refreshes triggered-limit state from `/triggered-limits`.
//! Delivery strategies depend on the [`Transport`] trait rather than the
//! concrete client so tests can substitute a stub.
//!
//! ## Module Organization
//!
//! - [`error`] - Transport error types with retry classification
//! - [`retry`] - Exponential backoff retry policy
//! - [`wire`] - Request/response wire types
//! - [`redact`] - Sensitive-field redaction for body logging
//! - [`client`] - The reqwest-backed client

pub mod client;
pub mod error;
pub mod redact;
pub mod retry;
pub mod wire;

use aicm_core::UsageRecord;
use async_trait::async_trait;

// Re-export commonly used types at crate root for convenience
pub use client::{BatchResponse, ClientConfig, LimitsFetch, TrackClient};
pub use error::TransportError;
pub use retry::{parse_retry_after, RetryPolicy};
pub use wire::{ApiErrorBody, RecordResult, RecordStatus, TrackRequest, TrackResponse};

/// Outbound side of the delivery pipeline.
///
/// Implemented by [`TrackClient`]; delivery strategies hold this trait
/// object so their workers can be tested against stub transports.
#[async_trait]
pub trait Transport: Send + Sync {
    /// POST one batch of records to `/track`.
    ///
    /// Retries transient failures internally per the client's retry
    /// policy; a returned error is final for this delivery try.
    async fn send_batch(&self, records: &[UsageRecord]) -> Result<BatchResponse, TransportError>;

    /// GET the current triggered-limit set, honoring `If-None-Match`.
    async fn fetch_limits(&self, etag: Option<&str>) -> Result<LimitsFetch, TransportError>;
}
