//! # AICM Delivery
//!
//! Delivery strategies for the AICM usage tracking SDK.
//!
//! All three strategies satisfy the same [`DeliveryStrategy`] contract:
//!
//! - [`ImmediateDelivery`] sends on the caller's task and reports the
//!   server's per-record results synchronously.
//! - [`MemoryQueueDelivery`] accepts records into a bounded in-memory
//!   queue drained by a background worker.
//! - [`PersistentDelivery`] journals records into an on-disk queue so a
//!   crash between accept and send loses nothing.
//!
//! Strategies own the triggered-limits refresh: every successful server
//! response that carries a limit set is pushed into the shared cache.

pub mod error;
pub mod immediate;
pub mod memory;
pub mod persistent;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

use aicm_core::UsageRecord;
use aicm_transport::RecordResult;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

// Re-export commonly used types at crate root for convenience
pub use error::DeliveryError;
pub use immediate::ImmediateDelivery;
pub use memory::{DiscardHook, MemoryQueueConfig, MemoryQueueDelivery};
pub use persistent::{PersistentDelivery, PersistentDeliveryConfig};
pub use store::{EntryStatus, QueueEntry, QueueStats, SqliteQueueStore, StoreError};

/// Default bound on draining a strategy at shutdown
pub const DEFAULT_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Backoff before reschedule attempt `attempt` (1-indexed) of a queued
/// record: half a second doubling per attempt, capped at five minutes,
/// jittered ±20%.
pub(crate) fn retry_backoff(attempt: u32) -> Duration {
    use rand::RngExt;

    let exponent = attempt.saturating_sub(1).min(16);
    let nominal = Duration::from_millis(500 * 2u64.pow(exponent)).min(Duration::from_secs(300));
    let jitter = rand::rng().random_range(0.8..=1.2);
    nominal.mul_f64(jitter)
}

// ============================================================================
// DeliveryStrategy
// ============================================================================

/// Input contract shared by all delivery strategies.
///
/// A strategy exclusively owns whatever background state it needs; the
/// tracker facade holds exactly one strategy and drives its lifecycle.
#[async_trait]
pub trait DeliveryStrategy: Send + Sync {
    /// Accept a batch of records for delivery.
    ///
    /// Queued strategies return once the records are accepted (in memory
    /// or fsync'd to disk); the immediate strategy returns the server's
    /// per-record results.
    async fn deliver(&self, records: Vec<UsageRecord>) -> Result<DeliveryReceipt, DeliveryError>;

    /// Wait until everything accepted so far has been dispatched.
    async fn flush(&self, deadline: Duration) -> Result<(), DeliveryError>;

    /// Stop accepting records, drain within the deadline, release
    /// background state. Idempotent.
    async fn shutdown(&self, deadline: Duration) -> Result<(), DeliveryError>;

    /// Snapshot of this strategy's counters
    fn metrics(&self) -> DeliveryMetrics;

    /// Strategy name for logging
    fn name(&self) -> &'static str;
}

// ============================================================================
// Receipts and Metrics
// ============================================================================

/// How a strategy disposed of a `deliver` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptStatus {
    /// Sent synchronously; `results` carries the server's answer
    Delivered,
    /// Accepted into a queue; delivery happens in the background
    Enqueued,
    /// Final synchronous failure, reported instead of raised
    Failed,
}

/// Outcome of one `deliver` call
#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    pub status: ReceiptStatus,

    /// Number of records this receipt covers
    pub accepted: usize,

    /// Per-record server results, when known synchronously
    pub results: Vec<RecordResult>,

    /// Terminal error description for [`ReceiptStatus::Failed`]
    pub error: Option<String>,
}

impl DeliveryReceipt {
    /// Receipt for a synchronous send
    pub fn delivered(results: Vec<RecordResult>) -> Self {
        Self {
            status: ReceiptStatus::Delivered,
            accepted: results.len(),
            results,
            error: None,
        }
    }

    /// Receipt for records accepted into a queue
    pub fn enqueued(accepted: usize) -> Self {
        Self {
            status: ReceiptStatus::Enqueued,
            accepted,
            results: Vec::new(),
            error: None,
        }
    }

    /// Receipt for a logged-instead-of-raised terminal failure
    pub fn failed(accepted: usize, error: impl Into<String>) -> Self {
        Self {
            status: ReceiptStatus::Failed,
            accepted,
            results: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// Point-in-time snapshot of a strategy's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryMetrics {
    /// Records accepted by `deliver`
    pub enqueued: u64,
    /// Records confirmed by the server (including unknown service keys)
    pub delivered: u64,
    /// Records dropped after exhausting retries or rejected permanently
    pub failed: u64,
    /// Records discarded by the in-memory overflow policy
    pub discarded: u64,
}

/// Shared atomic counters behind [`DeliveryMetrics`]
#[derive(Debug, Default)]
pub(crate) struct MetricsCounters {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
}

impl MetricsCounters {
    pub(crate) fn add_enqueued(&self, n: u64) {
        self.enqueued.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_delivered(&self, n: u64) {
        self.delivered.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_failed(&self, n: u64) {
        self.failed.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_discarded(&self, n: u64) {
        self.discarded.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> DeliveryMetrics {
        DeliveryMetrics {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}
