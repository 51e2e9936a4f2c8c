//! Persistent queued delivery.
//!
//! Records are journaled into the SQLite-backed queue before `deliver`
//! returns, so a crash at any later point loses nothing. A single
//! background worker claims batches, sends them, and keeps per-record
//! bookkeeping: delivered entries are marked DONE, transient failures
//! are rescheduled with backoff, permanent failures and exhausted
//! retries are quarantined as FAILED for the maintenance tool.

use crate::error::DeliveryError;
use crate::store::{QueueEntry, SqliteQueueStore, StoreError};
use crate::{retry_backoff, DeliveryMetrics, DeliveryReceipt, DeliveryStrategy, MetricsCounters};
use aicm_core::limits::TriggeredLimitsCache;
use aicm_core::{Settings, UsageRecord};
use aicm_transport::{RecordStatus, Transport};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, warn};

#[cfg(test)]
#[path = "persistent_tests.rs"]
mod tests;

/// How often flush waiters re-check the pending count
const POLL_SLEEP: Duration = Duration::from_millis(10);

/// How often the worker considers vacuuming delivered rows
const VACUUM_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Delivered rows older than this are vacuumed
const DONE_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the persistent queued strategy
#[derive(Debug, Clone)]
pub struct PersistentDeliveryConfig {
    /// Entries claimed per worker iteration
    pub max_batch_size: usize,

    /// Reschedule budget before an entry is quarantined
    pub max_retries: u32,

    /// Worker sleep when no entry is eligible
    pub poll_interval: Duration,

    /// Age at which an unacknowledged INFLIGHT entry is reclaimed
    pub inflight_reclaim: Duration,
}

impl PersistentDeliveryConfig {
    /// Derive the queue configuration from resolved settings
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_batch_size: settings.max_batch_size,
            max_retries: settings.max_retries,
            poll_interval: settings.poll_interval,
            inflight_reclaim: settings.inflight_reclaim(),
        }
    }
}

impl Default for PersistentDeliveryConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            max_retries: 5,
            poll_interval: Duration::from_millis(100),
            inflight_reclaim: Duration::from_secs(60),
        }
    }
}

// ============================================================================
// PersistentDelivery
// ============================================================================

struct WorkerShared {
    /// Signaled by enqueue so the worker wakes before its poll interval
    wakeup: Notify,
    closed: AtomicBool,
    metrics: MetricsCounters,
}

/// Durable on-disk delivery strategy
pub struct PersistentDelivery {
    store: Arc<SqliteQueueStore>,
    shared: Arc<WorkerShared>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PersistentDelivery {
    /// Run the startup scan and spawn the worker.
    ///
    /// The scan reclaims INFLIGHT entries orphaned by a previous run and
    /// logs a warning when quarantined entries are waiting for an
    /// operator.
    pub async fn start(
        store: Arc<SqliteQueueStore>,
        transport: Arc<dyn Transport>,
        limits: Option<Arc<TriggeredLimitsCache>>,
        config: PersistentDeliveryConfig,
    ) -> Result<Self, DeliveryError> {
        let reclaim_age = config.inflight_reclaim;
        let failed = run_blocking(&store, move |store| {
            store.reclaim_inflight(reclaim_age)?;
            store.failed_count()
        })
        .await?;
        if failed > 0 {
            warn!(
                count = failed,
                "queue holds failed entries; inspect them with `aicm-queue list-failed`"
            );
        }

        let shared = Arc::new(WorkerShared {
            wakeup: Notify::new(),
            closed: AtomicBool::new(false),
            metrics: MetricsCounters::default(),
        });

        let worker = tokio::spawn(worker_loop(
            Arc::clone(&store),
            transport,
            limits,
            Arc::clone(&shared),
            config,
        ));

        Ok(Self {
            store,
            shared,
            worker: tokio::sync::Mutex::new(Some(worker)),
        })
    }
}

#[async_trait]
impl DeliveryStrategy for PersistentDelivery {
    async fn deliver(&self, records: Vec<UsageRecord>) -> Result<DeliveryReceipt, DeliveryError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(DeliveryError::Closed);
        }

        // Each record is enqueued individually: a crash mid-batch loses
        // at most the records not yet journaled.
        let count = records.len();
        for record in records {
            let payload = record.to_wire().to_string();
            run_blocking(&self.store, move |store| store.enqueue(&payload)).await?;
            self.shared.metrics.add_enqueued(1);
            self.shared.wakeup.notify_one();
        }

        Ok(DeliveryReceipt::enqueued(count))
    }

    async fn flush(&self, deadline: Duration) -> Result<(), DeliveryError> {
        let started = Instant::now();
        loop {
            let pending = run_blocking(&self.store, |store| store.pending_count()).await?;
            if pending == 0 {
                return Ok(());
            }
            if started.elapsed() >= deadline {
                return Err(DeliveryError::DrainTimeout { deadline });
            }
            tokio::time::sleep(POLL_SLEEP).await;
        }
    }

    async fn shutdown(&self, deadline: Duration) -> Result<(), DeliveryError> {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.wakeup.notify_waiters();

        let mut timed_out = false;
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            if timeout(deadline, handle).await.is_err() {
                warn!("persistent delivery worker did not stop before the shutdown deadline");
                timed_out = true;
            }
        }

        // Whatever the worker still had claimed goes straight back to
        // QUEUED so the next run picks it up immediately.
        if let Err(e) =
            run_blocking(&self.store, |store| store.reclaim_inflight(Duration::ZERO)).await
        {
            warn!(error = %e, "failed to release in-flight entries during shutdown");
        }

        if timed_out {
            return Err(DeliveryError::DrainTimeout { deadline });
        }
        Ok(())
    }

    fn metrics(&self) -> DeliveryMetrics {
        self.shared.metrics.snapshot()
    }

    fn name(&self) -> &'static str {
        "persistent_queue"
    }
}

/// Run a store operation off the async runtime
async fn run_blocking<T: Send + 'static>(
    store: &Arc<SqliteQueueStore>,
    operation: impl FnOnce(&SqliteQueueStore) -> Result<T, StoreError> + Send + 'static,
) -> Result<T, DeliveryError> {
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || operation(&store))
        .await
        .map_err(|e| {
            DeliveryError::Storage(StoreError::Io {
                message: format!("queue task failed: {}", e),
            })
        })?
        .map_err(DeliveryError::Storage)
}

// ============================================================================
// Worker
// ============================================================================

async fn worker_loop(
    store: Arc<SqliteQueueStore>,
    transport: Arc<dyn Transport>,
    limits: Option<Arc<TriggeredLimitsCache>>,
    shared: Arc<WorkerShared>,
    config: PersistentDeliveryConfig,
) {
    let mut last_vacuum = Instant::now();

    loop {
        let batch_size = config.max_batch_size;
        let claimed = run_blocking(&store, move |store| store.claim_batch(batch_size)).await;

        match claimed {
            Err(e) => {
                warn!(error = %e, "failed to claim queue entries");
                tokio::time::sleep(config.poll_interval).await;
            }
            Ok(batch) if batch.is_empty() => {
                if shared.closed.load(Ordering::Acquire) {
                    break;
                }
                if last_vacuum.elapsed() >= VACUUM_INTERVAL {
                    last_vacuum = Instant::now();
                    if let Err(e) =
                        run_blocking(&store, |store| store.vacuum_done(DONE_RETENTION)).await
                    {
                        warn!(error = %e, "queue vacuum failed");
                    }
                }
                let _ = timeout(config.poll_interval, shared.wakeup.notified()).await;
            }
            Ok(batch) => {
                process_batch(&store, &transport, limits.as_deref(), &shared, &config, batch)
                    .await;
            }
        }
    }

    debug!("persistent delivery worker stopped");
}

/// Send one claimed batch and record per-entry outcomes.
async fn process_batch(
    store: &Arc<SqliteQueueStore>,
    transport: &Arc<dyn Transport>,
    limits: Option<&TriggeredLimitsCache>,
    shared: &WorkerShared,
    config: &PersistentDeliveryConfig,
    batch: Vec<QueueEntry>,
) {
    // Decode payloads; an undecodable entry can never succeed, so it is
    // quarantined instead of poisoning the batch.
    let mut claimed: Vec<(i64, u32, UsageRecord)> = Vec::with_capacity(batch.len());
    for entry in batch {
        let decoded = serde_json::from_str::<serde_json::Value>(&entry.payload)
            .ok()
            .and_then(|value| UsageRecord::from_wire(value).ok());
        match decoded {
            Some(record) => claimed.push((entry.id, entry.attempt_count, record)),
            None => {
                error!(id = entry.id, "queue entry payload is not decodable, quarantining");
                quarantine(store, shared, entry.id, "payload not decodable").await;
            }
        }
    }
    if claimed.is_empty() {
        return;
    }

    let records: Vec<UsageRecord> = claimed.iter().map(|(_, _, record)| record.clone()).collect();

    match transport.send_batch(&records).await {
        Ok(response) => {
            if let (Some(cache), Some(new_limits)) = (limits, response.triggered_limits.clone()) {
                cache.notify(new_limits);
            }

            let mut done = Vec::with_capacity(claimed.len());
            for (id, _, record) in &claimed {
                match response
                    .result_for(record.response_id().as_str())
                    .map(|result| result.status.clone())
                {
                    Some(RecordStatus::Rejected) => {
                        quarantine(store, shared, *id, "rejected by server").await;
                    }
                    // Queued, unknown service key, or missing from the
                    // results list: the batch succeeded, the server owns
                    // the record now.
                    _ => done.push(*id),
                }
            }

            if !done.is_empty() {
                shared.metrics.add_delivered(done.len() as u64);
                if let Err(e) = run_blocking(store, move |store| store.mark_done(&done)).await {
                    warn!(error = %e, "failed to mark delivered entries done");
                }
            }
        }
        Err(e) if e.is_transient() => {
            let message = e.to_string();
            warn!(records = claimed.len(), error = %message, "batch delivery failed, rescheduling");
            for (id, attempt_count, _) in &claimed {
                let attempts = attempt_count + 1;
                if attempts >= config.max_retries {
                    quarantine(store, shared, *id, &message).await;
                } else {
                    let delay = retry_backoff(attempts);
                    let next_attempt_at = Utc::now()
                        + chrono::Duration::from_std(delay).unwrap_or_else(|_| {
                            chrono::Duration::seconds(300)
                        });
                    let id = *id;
                    let message = message.clone();
                    if let Err(e) = run_blocking(store, move |store| {
                        store.reschedule(id, next_attempt_at, &message)
                    })
                    .await
                    {
                        warn!(id, error = %e, "failed to reschedule queue entry");
                    }
                }
            }
        }
        Err(e) => {
            let message = e.to_string();
            error!(records = claimed.len(), error = %message, "batch rejected permanently");
            for (id, _, _) in &claimed {
                quarantine(store, shared, *id, &message).await;
            }
        }
    }
}

/// Mark one entry FAILED and count it
async fn quarantine(store: &Arc<SqliteQueueStore>, shared: &WorkerShared, id: i64, message: &str) {
    shared.metrics.add_failed(1);
    let message = message.to_string();
    if let Err(e) = run_blocking(store, move |store| store.mark_failed(id, &message)).await {
        warn!(id, error = %e, "failed to quarantine queue entry");
    }
}
