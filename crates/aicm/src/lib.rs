//! # AICM
//!
//! Client SDK for tracking LLM/API usage and cost with AICM.
//!
//! A [`Tracker`] accepts usage records, hands them to one of three
//! delivery strategies (immediate, in-memory queued, or durable
//! on-disk queued), and enforces spend limits the server has already
//! triggered. Usage is never dropped by local enforcement: a record is
//! accepted by the strategy first, and only then does a matching limit
//! raise [`TrackerError::LimitExceeded`].
//!
//! ## Usage
//!
//! ```no_run
//! use aicm::Tracker;
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), aicm::TrackerError> {
//! let tracker = Tracker::builder()
//!     .api_key("aicm-k1-secret")
//!     .build()
//!     .await?;
//!
//! let result = tracker
//!     .track("openai::gpt-4o-mini", json!({"input_tokens": 10, "output_tokens": 20}))
//!     .await?;
//! println!("tracked: {}", result.response_id);
//!
//! tracker.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod blocking;
pub mod error;
pub mod tracker;

// Re-export commonly used types at crate root for convenience
pub use error::TrackerError;
pub use tracker::{
    TrackInput, TrackOptions, TrackResult, TrackStatus, Tracker, TrackerBuilder,
};

// The pieces callers commonly need alongside the tracker
pub use aicm_core::limits::{ThresholdType, TriggeredLimit};
pub use aicm_core::{
    DeliveryType, FieldType, LogLevel, OverflowPolicy, SchemaRegistry, Settings,
    SettingsOverrides, UsageRecord, UsageSchema,
};
pub use aicm_delivery::{DeliveryMetrics, DeliveryStrategy};

/// Install a global tracing subscriber for hosts that do not bring
/// their own.
///
/// `RUST_LOG` wins when set; otherwise the given level (typically
/// [`Settings::log_level`]) is the fallback directive. Calling this
/// when a subscriber is already installed is a no-op.
pub fn init_logging(level: LogLevel) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.as_filter_str()));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
