//! Error type for the tracker facade.

use aicm_core::error::{SettingsError, ValidationError};
use aicm_core::limits::TriggeredLimit;
use aicm_delivery::DeliveryError;
use aicm_transport::TransportError;
use thiserror::Error;

/// Errors surfaced by [`Tracker`](crate::Tracker) operations
#[derive(Debug, Error)]
pub enum TrackerError {
    /// The usage payload failed validation. Raised synchronously,
    /// before the record reaches any delivery strategy.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Settings could not be resolved at construction.
    #[error(transparent)]
    Settings(#[from] SettingsError),

    /// The delivery strategy refused or failed the operation.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    /// The transport failed while constructing the tracker.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A previously triggered limit matches this record.
    ///
    /// The record has already been accepted by the delivery strategy;
    /// this error informs the caller, it does not mean usage was lost.
    #[error("Usage limit '{limit_id}' exceeded")]
    LimitExceeded {
        limit_id: String,
        limit: TriggeredLimit,
    },

    /// The tracker has been closed.
    #[error("Tracker is closed")]
    Closed,

    /// The blocking wrapper could not build its runtime.
    #[error("Failed to start runtime: {message}")]
    Runtime { message: String },
}

impl TrackerError {
    /// Whether the record this call carried was nevertheless accepted
    /// for delivery.
    ///
    /// True only for limit enforcement, which runs after the strategy
    /// has the record.
    pub fn record_was_accepted(&self) -> bool {
        matches!(self, Self::LimitExceeded { .. })
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
