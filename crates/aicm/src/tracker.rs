//! The tracker facade.
//!
//! One `Tracker` owns one delivery strategy, one triggered-limits
//! cache, and one HTTP transport. It is cheap to clone and safe to
//! share across any number of producer tasks; `close` drains the
//! strategy and renders every clone unusable.

use crate::error::TrackerError;
use aicm_core::config_store::ConfigStore;
use aicm_core::limits::{CheckScope, LimitsLoad, TriggeredLimit, TriggeredLimitsCache};
use aicm_core::{
    DeliveryType, SchemaRegistry, Settings, SettingsOverrides, UsageRecord,
};
use aicm_delivery::{
    DeliveryMetrics, DeliveryStrategy, ImmediateDelivery, MemoryQueueConfig, MemoryQueueDelivery,
    PersistentDelivery, PersistentDeliveryConfig, ReceiptStatus, SqliteQueueStore,
    DEFAULT_SHUTDOWN_DEADLINE,
};
use aicm_delivery::memory::DiscardHook;
use aicm_transport::client::LimitsFetch;
use aicm_transport::{RecordStatus, TrackClient, Transport};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "tracker_tests.rs"]
mod tests;

// ============================================================================
// Results
// ============================================================================

/// Delivery outcome of one tracked record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackStatus {
    /// Accepted (by the server, or locally by a queued strategy)
    Queued,
    /// The server does not know the service key; the record was
    /// consumed but will not be costed
    ServiceKeyUnknown,
    /// The server permanently refused the record
    Rejected,
    /// Delivery failed and `RAISE_ON_ERROR` is off
    Failed,
}

/// Per-record response metadata for callers that want to inspect the
/// delivery outcome
#[derive(Debug, Clone)]
pub struct TrackResult {
    pub response_id: String,

    pub status: TrackStatus,

    /// Server-side cost event identifier, when delivery was synchronous
    pub cost_event_id: Option<String>,
}

/// Per-call optional fields for [`Tracker::track_with`]
#[derive(Debug, Clone, Default)]
pub struct TrackOptions {
    pub response_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub customer_key: Option<String>,
    /// Replaces the tracker-wide default context wholesale; never merged
    pub context: Option<BTreeMap<String, Value>>,
    pub api_id: Option<String>,
}

/// One record of a [`Tracker::track_batch`] call
#[derive(Debug, Clone)]
pub struct TrackInput {
    pub service_key: String,
    pub usage: Value,
    pub options: TrackOptions,
}

impl TrackInput {
    /// A batch item with default options
    pub fn new(service_key: impl Into<String>, usage: Value) -> Self {
        Self {
            service_key: service_key.into(),
            usage,
            options: TrackOptions::default(),
        }
    }
}

#[derive(Default)]
struct TrackerDefaults {
    customer_key: Option<String>,
    context: Option<BTreeMap<String, Value>>,
}

// ============================================================================
// Tracker
// ============================================================================

struct TrackerInner {
    settings: Settings,
    schemas: SchemaRegistry,
    strategy: Arc<dyn DeliveryStrategy>,
    limits: Arc<TriggeredLimitsCache>,
    defaults: RwLock<TrackerDefaults>,
    closed: AtomicBool,
}

/// Client-side usage tracker.
///
/// Create one per process (or per credential) with [`Tracker::builder`]
/// and share clones freely; all clones refer to the same delivery
/// strategy and close together.
#[derive(Clone)]
pub struct Tracker {
    inner: Arc<TrackerInner>,
}

impl Tracker {
    /// Start building a tracker
    pub fn builder() -> TrackerBuilder {
        TrackerBuilder::new()
    }

    /// Resolved settings this tracker runs with
    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    /// Set the customer key applied to records that do not carry one
    pub fn set_customer_key(&self, customer_key: impl Into<String>) {
        self.defaults_mut().customer_key = Some(customer_key.into());
    }

    /// Clear the default customer key
    pub fn clear_customer_key(&self) {
        self.defaults_mut().customer_key = None;
    }

    /// Set the context applied to records that do not carry one.
    ///
    /// Per-call context replaces this wholesale; the two are never
    /// merged.
    pub fn set_context(&self, context: BTreeMap<String, Value>) {
        self.defaults_mut().context = Some(context);
    }

    /// Clear the default context
    pub fn clear_context(&self) {
        self.defaults_mut().context = None;
    }

    /// Track one usage measurement with default options.
    ///
    /// Validation failures surface before delivery; a matching
    /// triggered limit surfaces [`TrackerError::LimitExceeded`] *after*
    /// the record has been accepted by the strategy.
    pub async fn track(
        &self,
        service_key: impl Into<String>,
        usage: Value,
    ) -> Result<TrackResult, TrackerError> {
        self.track_with(service_key, usage, TrackOptions::default())
            .await
    }

    /// Track one usage measurement with explicit options
    pub async fn track_with(
        &self,
        service_key: impl Into<String>,
        usage: Value,
        options: TrackOptions,
    ) -> Result<TrackResult, TrackerError> {
        let mut results = self
            .track_batch(vec![TrackInput {
                service_key: service_key.into(),
                usage,
                options,
            }])
            .await?;
        // One input always yields exactly one result
        Ok(results.remove(0))
    }

    /// Track a batch of usage measurements.
    ///
    /// All records are validated before any is delivered. Under the
    /// persistent strategy each record is journaled individually; under
    /// the immediate strategy the whole batch travels in one HTTP call.
    pub async fn track_batch(
        &self,
        inputs: Vec<TrackInput>,
    ) -> Result<Vec<TrackResult>, TrackerError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TrackerError::Closed);
        }
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let records = inputs
            .into_iter()
            .map(|input| self.build_record(input))
            .collect::<Result<Vec<_>, _>>()?;

        let receipt = self
            .inner
            .strategy
            .deliver(records.clone())
            .await
            .map_err(|e| match e {
                aicm_delivery::DeliveryError::Closed => TrackerError::Closed,
                other => TrackerError::Delivery(other),
            })?;

        let results = assemble_results(&records, &receipt);
        self.enforce_limits(&records, &results)?;
        Ok(results)
    }

    /// Wait until everything accepted so far has been dispatched
    pub async fn flush(&self, deadline: Duration) -> Result<(), TrackerError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TrackerError::Closed);
        }
        self.inner.strategy.flush(deadline).await?;
        Ok(())
    }

    /// Close the tracker: stop accepting records and drain the strategy
    /// within the default shutdown deadline. Idempotent.
    pub async fn close(&self) -> Result<(), TrackerError> {
        self.close_with_deadline(DEFAULT_SHUTDOWN_DEADLINE).await
    }

    /// Close with an explicit drain deadline
    pub async fn close_with_deadline(&self, deadline: Duration) -> Result<(), TrackerError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!("closing tracker");
        self.inner.strategy.shutdown(deadline).await?;
        Ok(())
    }

    /// Snapshot of the delivery strategy's counters
    pub fn metrics(&self) -> DeliveryMetrics {
        self.inner.strategy.metrics()
    }

    /// Copy of the currently cached triggered limits
    pub fn triggered_limits(&self) -> Vec<TriggeredLimit> {
        self.inner.limits.snapshot()
    }

    fn defaults_mut(&self) -> std::sync::RwLockWriteGuard<'_, TrackerDefaults> {
        self.inner.defaults.write().unwrap_or_else(|e| e.into_inner())
    }

    fn build_record(&self, input: TrackInput) -> Result<UsageRecord, TrackerError> {
        let defaults = self
            .inner
            .defaults
            .read()
            .unwrap_or_else(|e| e.into_inner());

        let mut builder = UsageRecord::builder(input.service_key, input.usage);
        if let Some(response_id) = input.options.response_id {
            builder = builder.with_response_id(response_id);
        }
        if let Some(timestamp) = input.options.timestamp {
            builder = builder.with_timestamp(timestamp);
        }
        if let Some(customer_key) = input
            .options
            .customer_key
            .or_else(|| defaults.customer_key.clone())
        {
            builder = builder.with_customer_key(customer_key);
        }
        if let Some(context) = input.options.context.or_else(|| defaults.context.clone()) {
            builder = builder.with_context(context);
        }
        if let Some(api_id) = input.options.api_id {
            builder = builder.with_api_id(api_id);
        }

        Ok(builder.build(&self.inner.schemas)?)
    }

    /// Raise for the first record a LIMIT-severity cached limit matches.
    ///
    /// Runs after delivery so observed usage is never lost to local
    /// enforcement. Records the server refused as unknown are skipped.
    fn enforce_limits(
        &self,
        records: &[UsageRecord],
        results: &[TrackResult],
    ) -> Result<(), TrackerError> {
        if !self.inner.settings.limits_enabled {
            return Ok(());
        }

        let api_key_id = self.inner.settings.api_key_id();
        for (record, result) in records.iter().zip(results) {
            if result.status == TrackStatus::ServiceKeyUnknown {
                continue;
            }
            if let Some(limit) = self
                .inner
                .limits
                .check(&CheckScope::for_record(api_key_id, record))
            {
                return Err(TrackerError::LimitExceeded {
                    limit_id: limit.limit_id.clone(),
                    limit,
                });
            }
        }
        Ok(())
    }
}

/// Map a delivery receipt onto per-record results, in input order
fn assemble_results(
    records: &[UsageRecord],
    receipt: &aicm_delivery::DeliveryReceipt,
) -> Vec<TrackResult> {
    records
        .iter()
        .map(|record| {
            let response_id = record.response_id().to_string();
            match receipt.status {
                ReceiptStatus::Enqueued => TrackResult {
                    response_id,
                    status: TrackStatus::Queued,
                    cost_event_id: None,
                },
                ReceiptStatus::Failed => TrackResult {
                    response_id,
                    status: TrackStatus::Failed,
                    cost_event_id: None,
                },
                ReceiptStatus::Delivered => {
                    let server_result = receipt
                        .results
                        .iter()
                        .find(|result| result.response_id == response_id);
                    match server_result {
                        Some(result) => TrackResult {
                            response_id,
                            status: match result.status {
                                RecordStatus::Queued => TrackStatus::Queued,
                                RecordStatus::ServiceKeyUnknown => TrackStatus::ServiceKeyUnknown,
                                RecordStatus::Rejected => TrackStatus::Rejected,
                            },
                            cost_event_id: result.cost_event_id.clone(),
                        },
                        // The server answered 2xx without naming this
                        // record; treat the batch outcome as accepted.
                        None => TrackResult {
                            response_id,
                            status: TrackStatus::Queued,
                            cost_event_id: None,
                        },
                    }
                }
            }
        })
        .collect()
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`Tracker`]
pub struct TrackerBuilder {
    overrides: SettingsOverrides,
    config_path: Option<PathBuf>,
    use_config_store: bool,
    schemas: SchemaRegistry,
    strategy: Option<Arc<dyn DeliveryStrategy>>,
    on_discard: Option<DiscardHook>,
}

impl Default for TrackerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackerBuilder {
    /// Create a builder with empty overrides
    pub fn new() -> Self {
        Self {
            overrides: SettingsOverrides::new(),
            config_path: None,
            use_config_store: true,
            schemas: SchemaRegistry::new(),
            strategy: None,
            on_discard: None,
        }
    }

    /// Set the API key explicitly
    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.overrides.api_key = Some(api_key.into());
        self
    }

    /// Set the server base URL explicitly
    pub fn api_base(mut self, api_base: impl Into<String>) -> Self {
        self.overrides.api_base = Some(api_base.into());
        self
    }

    /// Replace the whole settings override layer
    pub fn overrides(mut self, overrides: SettingsOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Use a specific configuration store file
    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self.use_config_store = true;
        self
    }

    /// Run without any on-disk configuration store
    pub fn without_config_store(mut self) -> Self {
        self.use_config_store = false;
        self
    }

    /// Supply per-service usage schemas
    pub fn schemas(mut self, schemas: SchemaRegistry) -> Self {
        self.schemas = schemas;
        self
    }

    /// Supply a prebuilt delivery strategy instead of selecting one
    /// from `DELIVERY_TYPE`
    pub fn strategy(mut self, strategy: Arc<dyn DeliveryStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Observe records the in-memory queue discards under backpressure
    pub fn on_discard(mut self, hook: DiscardHook) -> Self {
        self.on_discard = Some(hook);
        self
    }

    /// Resolve settings, construct the delivery strategy, and start the
    /// tracker.
    pub async fn build(self) -> Result<Tracker, TrackerError> {
        let store = if self.use_config_store {
            Some(ConfigStore::new(
                self.config_path.unwrap_or_else(default_config_path),
            ))
        } else {
            None
        };

        let settings = Settings::resolve(self.overrides, store.as_ref())?;

        let limits = Arc::new(TriggeredLimitsCache::new(store));
        let load = limits.load_from_store_if_empty();

        let transport: Arc<dyn Transport> = Arc::new(TrackClient::from_settings(&settings)?);

        if load == LimitsLoad::Corrupt {
            spawn_limits_refresh(Arc::clone(&transport), Arc::clone(&limits));
        }

        let strategy = match self.strategy {
            Some(strategy) => strategy,
            None => {
                build_strategy(&settings, Arc::clone(&transport), Arc::clone(&limits), self.on_discard)
                    .await?
            }
        };

        debug!(
            strategy = strategy.name(),
            limits = limits.len(),
            "tracker started"
        );

        Ok(Tracker {
            inner: Arc::new(TrackerInner {
                settings,
                schemas: self.schemas,
                strategy,
                limits,
                defaults: RwLock::new(TrackerDefaults::default()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Build a [`blocking::Tracker`](crate::blocking::Tracker) for
    /// non-async hosts
    pub fn build_blocking(self) -> Result<crate::blocking::Tracker, TrackerError> {
        crate::blocking::Tracker::build(self)
    }
}

async fn build_strategy(
    settings: &Settings,
    transport: Arc<dyn Transport>,
    limits: Arc<TriggeredLimitsCache>,
    on_discard: Option<DiscardHook>,
) -> Result<Arc<dyn DeliveryStrategy>, TrackerError> {
    let strategy: Arc<dyn DeliveryStrategy> = match settings.delivery_type {
        DeliveryType::Immediate => Arc::new(ImmediateDelivery::new(
            transport,
            Some(limits),
            settings.raise_on_error,
        )),
        DeliveryType::MemQueue => {
            let mut config = MemoryQueueConfig::from_settings(settings);
            config.on_discard = on_discard;
            Arc::new(MemoryQueueDelivery::start(transport, Some(limits), config))
        }
        DeliveryType::PersistentQueue => {
            let store = Arc::new(
                SqliteQueueStore::open(&settings.db_path).map_err(aicm_delivery::DeliveryError::Storage)?,
            );
            Arc::new(
                PersistentDelivery::start(
                    store,
                    transport,
                    Some(limits),
                    PersistentDeliveryConfig::from_settings(settings),
                )
                .await?,
            )
        }
    };
    Ok(strategy)
}

/// One-shot background refresh after a corrupt stored limit set
fn spawn_limits_refresh(transport: Arc<dyn Transport>, limits: Arc<TriggeredLimitsCache>) {
    tokio::spawn(async move {
        match transport.fetch_limits(None).await {
            Ok(LimitsFetch::New { limits: fresh, .. }) => limits.notify(fresh),
            Ok(LimitsFetch::Unchanged) => {}
            Err(e) => warn!(error = %e, "triggered-limits refresh failed"),
        }
    });
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join("aicm")
        .join("aicm.ini")
}
