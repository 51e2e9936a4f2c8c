//! Immediate synchronous delivery.
//!
//! Sends on the caller's task through the transport's own retry loop
//! and reports the server's per-record results in the receipt. Carries
//! no background state; `flush` is trivially satisfied.

use crate::error::DeliveryError;
use crate::{DeliveryMetrics, DeliveryReceipt, DeliveryStrategy, MetricsCounters};
use aicm_core::limits::TriggeredLimitsCache;
use aicm_core::UsageRecord;
use aicm_transport::{RecordStatus, Transport};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

#[cfg(test)]
#[path = "immediate_tests.rs"]
mod tests;

/// Synchronous delivery strategy
pub struct ImmediateDelivery {
    transport: Arc<dyn Transport>,
    limits: Option<Arc<TriggeredLimitsCache>>,
    raise_on_error: bool,
    metrics: MetricsCounters,
    closed: AtomicBool,
}

impl ImmediateDelivery {
    /// Create the strategy.
    ///
    /// With `raise_on_error` set, a final transport failure is returned
    /// to the caller; otherwise it is logged and reported in the
    /// receipt.
    pub fn new(
        transport: Arc<dyn Transport>,
        limits: Option<Arc<TriggeredLimitsCache>>,
        raise_on_error: bool,
    ) -> Self {
        Self {
            transport,
            limits,
            raise_on_error,
            metrics: MetricsCounters::default(),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl DeliveryStrategy for ImmediateDelivery {
    async fn deliver(&self, records: Vec<UsageRecord>) -> Result<DeliveryReceipt, DeliveryError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DeliveryError::Closed);
        }

        let count = records.len() as u64;
        self.metrics.add_enqueued(count);

        match self.transport.send_batch(&records).await {
            Ok(response) => {
                if let (Some(cache), Some(limits)) =
                    (self.limits.as_ref(), response.triggered_limits.clone())
                {
                    cache.notify(limits);
                }

                let rejected = response
                    .results
                    .iter()
                    .filter(|result| result.status == RecordStatus::Rejected)
                    .count() as u64;
                self.metrics.add_delivered(count - rejected);
                self.metrics.add_failed(rejected);

                Ok(DeliveryReceipt::delivered(response.results))
            }
            Err(e) => {
                self.metrics.add_failed(count);
                if self.raise_on_error {
                    Err(DeliveryError::Transport(e))
                } else {
                    error!(error = %e, records = count, "usage delivery failed");
                    Ok(DeliveryReceipt::failed(records.len(), e.to_string()))
                }
            }
        }
    }

    async fn flush(&self, _deadline: Duration) -> Result<(), DeliveryError> {
        // Nothing is ever pending: deliver() completes the send before
        // returning.
        Ok(())
    }

    async fn shutdown(&self, _deadline: Duration) -> Result<(), DeliveryError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn metrics(&self) -> DeliveryMetrics {
        self.metrics.snapshot()
    }

    fn name(&self) -> &'static str {
        "immediate"
    }
}
