//! In-memory queued delivery.
//!
//! Records land in a bounded deque and a single background worker
//! drains them in FIFO order, batching up to the configured size within
//! the batch window. There is no durability: a failed batch is retried
//! in-process with backoff and then dropped.

use crate::error::DeliveryError;
use crate::{retry_backoff, DeliveryMetrics, DeliveryReceipt, DeliveryStrategy, MetricsCounters};
use aicm_core::limits::TriggeredLimitsCache;
use aicm_core::{OverflowPolicy, Settings, UsageRecord};
use aicm_transport::{RecordStatus, Transport};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, warn};

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

/// How often blocked producers and flush waiters re-check state
const POLL_SLEEP: Duration = Duration::from_millis(10);

/// Callback invoked with each record discarded by the backpressure
/// overflow policy
pub type DiscardHook = Arc<dyn Fn(&UsageRecord) + Send + Sync>;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the in-memory queued strategy
#[derive(Clone)]
pub struct MemoryQueueConfig {
    /// Capacity of the bounded queue
    pub queue_size: usize,

    /// Records per outbound batch
    pub max_batch_size: usize,

    /// Maximum wait before a partial batch is flushed
    pub batch_interval: Duration,

    /// In-process retry rounds for a failed batch before it is dropped
    pub max_retries: u32,

    /// What happens when the queue is full
    pub overflow_policy: OverflowPolicy,

    /// Observer for records discarded under backpressure
    pub on_discard: Option<DiscardHook>,
}

impl MemoryQueueConfig {
    /// Derive the queue configuration from resolved settings
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            queue_size: settings.queue_size,
            max_batch_size: settings.max_batch_size,
            batch_interval: settings.batch_interval,
            max_retries: settings.max_retries,
            overflow_policy: settings.overflow_policy,
            on_discard: None,
        }
    }
}

impl std::fmt::Debug for MemoryQueueConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryQueueConfig")
            .field("queue_size", &self.queue_size)
            .field("max_batch_size", &self.max_batch_size)
            .field("batch_interval", &self.batch_interval)
            .field("max_retries", &self.max_retries)
            .field("overflow_policy", &self.overflow_policy)
            .field("on_discard", &self.on_discard.is_some())
            .finish()
    }
}

// ============================================================================
// Shared State
// ============================================================================

struct Shared {
    queue: Mutex<VecDeque<UsageRecord>>,
    /// Signaled when records are enqueued
    items: Notify,
    /// Signaled when the worker frees capacity
    space: Notify,
    closed: AtomicBool,
    /// Records drained from the queue but not yet resolved
    in_flight: AtomicUsize,
    metrics: MetricsCounters,
}

impl Shared {
    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<UsageRecord>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move up to `limit` records out of the queue, tracking them as
    /// in-flight under the same lock so flush never observes a gap.
    fn drain(&self, limit: usize) -> Vec<UsageRecord> {
        let mut queue = self.lock_queue();
        let take = limit.min(queue.len());
        let drained: Vec<UsageRecord> = queue.drain(..take).collect();
        if !drained.is_empty() {
            self.in_flight.fetch_add(drained.len(), Ordering::AcqRel);
        }
        drained
    }

    fn is_drained(&self) -> bool {
        self.lock_queue().is_empty() && self.in_flight.load(Ordering::Acquire) == 0
    }
}

enum PushBack {
    /// Queue full under the `block` policy; the record comes back
    Full(UsageRecord),
    Rejected(DeliveryError),
}

// ============================================================================
// MemoryQueueDelivery
// ============================================================================

/// Bounded-channel delivery strategy with one background worker
pub struct MemoryQueueDelivery {
    shared: Arc<Shared>,
    config: MemoryQueueConfig,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MemoryQueueDelivery {
    /// Create the strategy and spawn its worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        transport: Arc<dyn Transport>,
        limits: Option<Arc<TriggeredLimitsCache>>,
        config: MemoryQueueConfig,
    ) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(config.queue_size.min(1024))),
            items: Notify::new(),
            space: Notify::new(),
            closed: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            metrics: MetricsCounters::default(),
        });

        let worker = tokio::spawn(worker_loop(
            transport,
            limits,
            Arc::clone(&shared),
            config.clone(),
        ));

        Self {
            shared,
            config,
            worker: tokio::sync::Mutex::new(Some(worker)),
        }
    }

    fn try_push(&self, record: UsageRecord) -> Result<(), PushBack> {
        let mut queue = self.shared.lock_queue();
        if queue.len() < self.config.queue_size {
            queue.push_back(record);
            return Ok(());
        }

        match self.config.overflow_policy {
            OverflowPolicy::Raise => Err(PushBack::Rejected(DeliveryError::QueueFull {
                capacity: self.config.queue_size,
            })),
            OverflowPolicy::Backpressure => {
                if let Some(oldest) = queue.pop_front() {
                    self.shared.metrics.add_discarded(1);
                    if let Some(hook) = &self.config.on_discard {
                        hook(&oldest);
                    }
                    debug!(
                        response_id = %oldest.response_id(),
                        "queue full, discarded oldest record"
                    );
                }
                queue.push_back(record);
                Ok(())
            }
            OverflowPolicy::Block => Err(PushBack::Full(record)),
        }
    }

    async fn enqueue_one(&self, mut record: UsageRecord) -> Result<(), DeliveryError> {
        loop {
            if self.shared.closed.load(Ordering::Acquire) {
                return Err(DeliveryError::Closed);
            }

            match self.try_push(record) {
                Ok(()) => {
                    self.shared.metrics.add_enqueued(1);
                    self.shared.items.notify_one();
                    return Ok(());
                }
                Err(PushBack::Rejected(e)) => return Err(e),
                Err(PushBack::Full(returned)) => {
                    record = returned;
                    // Re-check after the worker signals free capacity or
                    // a short poll elapses, whichever comes first.
                    let _ = timeout(POLL_SLEEP, self.shared.space.notified()).await;
                }
            }
        }
    }
}

#[async_trait]
impl DeliveryStrategy for MemoryQueueDelivery {
    async fn deliver(&self, records: Vec<UsageRecord>) -> Result<DeliveryReceipt, DeliveryError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(DeliveryError::Closed);
        }

        let count = records.len();
        for record in records {
            self.enqueue_one(record).await?;
        }
        Ok(DeliveryReceipt::enqueued(count))
    }

    async fn flush(&self, deadline: Duration) -> Result<(), DeliveryError> {
        let started = Instant::now();
        while !self.shared.is_drained() {
            if started.elapsed() >= deadline {
                return Err(DeliveryError::DrainTimeout { deadline });
            }
            tokio::time::sleep(POLL_SLEEP).await;
        }
        Ok(())
    }

    async fn shutdown(&self, deadline: Duration) -> Result<(), DeliveryError> {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.items.notify_waiters();
        self.shared.space.notify_waiters();

        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            if timeout(deadline, handle).await.is_err() {
                warn!("in-memory delivery worker did not drain before the shutdown deadline");
                return Err(DeliveryError::DrainTimeout { deadline });
            }
        }
        Ok(())
    }

    fn metrics(&self) -> DeliveryMetrics {
        self.shared.metrics.snapshot()
    }

    fn name(&self) -> &'static str {
        "mem_queue"
    }
}

// ============================================================================
// Worker
// ============================================================================

async fn worker_loop(
    transport: Arc<dyn Transport>,
    limits: Option<Arc<TriggeredLimitsCache>>,
    shared: Arc<Shared>,
    config: MemoryQueueConfig,
) {
    loop {
        let mut batch = shared.drain(config.max_batch_size);

        if batch.is_empty() {
            if shared.closed.load(Ordering::Acquire) {
                break;
            }
            let _ = timeout(config.batch_interval, shared.items.notified()).await;
            continue;
        }

        // Top up a partial batch within the batch window, unless we are
        // draining for shutdown.
        if batch.len() < config.max_batch_size && !shared.closed.load(Ordering::Acquire) {
            let window_ends = Instant::now() + config.batch_interval;
            while batch.len() < config.max_batch_size {
                let now = Instant::now();
                if now >= window_ends || shared.closed.load(Ordering::Acquire) {
                    break;
                }
                if timeout(window_ends - now, shared.items.notified())
                    .await
                    .is_err()
                {
                    break;
                }
                batch.extend(shared.drain(config.max_batch_size - batch.len()));
            }
        }

        dispatch_batch(&transport, limits.as_deref(), &shared, &config, &batch).await;

        shared.in_flight.store(0, Ordering::Release);
        shared.space.notify_waiters();
    }

    debug!("in-memory delivery worker stopped");
}

/// Send one batch, retrying transient failures in-process, then give up.
async fn dispatch_batch(
    transport: &Arc<dyn Transport>,
    limits: Option<&TriggeredLimitsCache>,
    shared: &Shared,
    config: &MemoryQueueConfig,
    batch: &[UsageRecord],
) {
    let mut round = 0u32;

    loop {
        match transport.send_batch(batch).await {
            Ok(response) => {
                if let (Some(cache), Some(new_limits)) = (limits, response.triggered_limits) {
                    cache.notify(new_limits);
                }

                let rejected = response
                    .results
                    .iter()
                    .filter(|result| result.status == RecordStatus::Rejected)
                    .count() as u64;
                shared.metrics.add_delivered(batch.len() as u64 - rejected);
                shared.metrics.add_failed(rejected);
                return;
            }
            Err(e) if e.is_transient() && round < config.max_retries => {
                round += 1;
                let delay = retry_backoff(round);
                warn!(
                    round,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "batch delivery failed, retrying in-process"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                shared.metrics.add_failed(batch.len() as u64);
                error!(
                    records = batch.len(),
                    error = %e,
                    "batch delivery failed permanently, dropping records"
                );
                return;
            }
        }
    }
}
