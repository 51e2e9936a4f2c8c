//! Blocking wrappers for non-async hosts.
//!
//! The async [`Tracker`](crate::Tracker) is the one implementation;
//! this module drives it on a small owned runtime, the same shape
//! reqwest uses for its own blocking client. There is no second code
//! path for the actual work.

use crate::error::TrackerError;
use crate::tracker::{TrackInput, TrackOptions, TrackResult, TrackerBuilder};
use aicm_delivery::DeliveryMetrics;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[cfg(test)]
#[path = "blocking_tests.rs"]
mod tests;

/// Synchronous tracker for hosts without an async runtime.
///
/// Dropping the tracker closes it with the default deadline if the
/// caller has not already done so.
pub struct Tracker {
    inner: crate::Tracker,
    runtime: Arc<tokio::runtime::Runtime>,
}

impl Tracker {
    /// Build from a [`TrackerBuilder`]; used by
    /// [`TrackerBuilder::build_blocking`].
    pub(crate) fn build(builder: TrackerBuilder) -> Result<Self, TrackerError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("aicm-tracker")
            .enable_all()
            .build()
            .map_err(|e| TrackerError::Runtime {
                message: e.to_string(),
            })?;

        let inner = runtime.block_on(builder.build())?;
        Ok(Self {
            inner,
            runtime: Arc::new(runtime),
        })
    }

    /// Track one usage measurement with default options
    pub fn track(
        &self,
        service_key: impl Into<String>,
        usage: Value,
    ) -> Result<TrackResult, TrackerError> {
        self.runtime.block_on(self.inner.track(service_key, usage))
    }

    /// Track one usage measurement with explicit options
    pub fn track_with(
        &self,
        service_key: impl Into<String>,
        usage: Value,
        options: TrackOptions,
    ) -> Result<TrackResult, TrackerError> {
        self.runtime
            .block_on(self.inner.track_with(service_key, usage, options))
    }

    /// Track a batch of usage measurements
    pub fn track_batch(&self, inputs: Vec<TrackInput>) -> Result<Vec<TrackResult>, TrackerError> {
        self.runtime.block_on(self.inner.track_batch(inputs))
    }

    /// Set the default customer key
    pub fn set_customer_key(&self, customer_key: impl Into<String>) {
        self.inner.set_customer_key(customer_key);
    }

    /// Set the default context
    pub fn set_context(&self, context: std::collections::BTreeMap<String, Value>) {
        self.inner.set_context(context);
    }

    /// Wait until everything accepted so far has been dispatched
    pub fn flush(&self, deadline: Duration) -> Result<(), TrackerError> {
        self.runtime.block_on(self.inner.flush(deadline))
    }

    /// Close the tracker, draining the delivery strategy
    pub fn close(&self) -> Result<(), TrackerError> {
        self.runtime.block_on(self.inner.close())
    }

    /// Snapshot of the delivery strategy's counters
    pub fn metrics(&self) -> DeliveryMetrics {
        self.inner.metrics()
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        if let Err(e) = self.runtime.block_on(self.inner.close()) {
            warn!(error = %e, "tracker close on drop failed");
        }
    }
}
