//! Error types for delivery strategies.

use crate::store::StoreError;
use aicm_transport::TransportError;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by a delivery strategy to its caller.
///
/// Worker-internal failures never appear here; inside workers every
/// error is caught, logged, and turned into reschedule/failure
/// bookkeeping so the worker task itself cannot die from a payload.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The bounded in-memory queue is full and the overflow policy is
    /// `raise`.
    #[error("Queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// The strategy has been shut down.
    #[error("Delivery strategy is shut down")]
    Closed,

    /// A flush or shutdown deadline elapsed before the queue drained.
    #[error("Drain deadline of {deadline:?} elapsed")]
    DrainTimeout { deadline: Duration },

    /// Final transport failure from a synchronous send.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The durable queue store failed.
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl DeliveryError {
    /// Check if this error represents a transient condition that may
    /// succeed if retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::QueueFull { .. } => true,
            Self::Closed => false,
            Self::DrainTimeout { .. } => true,
            Self::Transport(e) => e.is_transient(),
            Self::Storage(e) => e.is_transient(),
        }
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
