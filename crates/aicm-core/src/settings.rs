//! Layered settings resolution.
//!
//! Settings come from four ordered sources, highest precedence first:
//! explicit overrides, `AICM_`-prefixed environment variables, the
//! `[tracker]` section of the configuration store, and built-in
//! defaults. The result is immutable for the lifetime of a tracker.

use crate::config_store::ConfigStore;
use crate::error::SettingsError;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

#[cfg(test)]
#[path = "settings_tests.rs"]
mod tests;

/// Environment variable prefix for every settings key
const ENV_PREFIX: &str = "AICM";

/// Configuration store section holding tracker settings
const TRACKER_SECTION: &str = "tracker";

const DEFAULT_API_BASE: &str = "https://aicostmanager.com";
const DEFAULT_API_URL: &str = "/api/v1";

// ============================================================================
// Enumerated Settings
// ============================================================================

/// Which delivery strategy a tracker uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryType {
    /// Synchronous send on the caller's task
    Immediate,
    /// Bounded in-memory queue drained by a background worker
    MemQueue,
    /// Durable on-disk queue drained by a background worker
    PersistentQueue,
}

impl FromStr for DeliveryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "IMMEDIATE" => Ok(Self::Immediate),
            "MEM_QUEUE" => Ok(Self::MemQueue),
            "PERSISTENT_QUEUE" => Ok(Self::PersistentQueue),
            other => Err(format!(
                "unknown delivery type '{}', expected IMMEDIATE, MEM_QUEUE, or PERSISTENT_QUEUE",
                other
            )),
        }
    }
}

/// What the in-memory queue does when full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Producer blocks until space frees up
    Block,
    /// Oldest entry is discarded to make room
    Backpressure,
    /// Producer receives a queue-full error
    Raise,
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "backpressure" => Ok(Self::Backpressure),
            "raise" => Ok(Self::Raise),
            other => Err(format!(
                "unknown overflow policy '{}', expected block, backpressure, or raise",
                other
            )),
        }
    }
}

/// Logging verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Directive form understood by `tracing_subscriber::EnvFilter`
    pub fn as_filter_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ERROR" => Ok(Self::Error),
            "WARN" | "WARNING" => Ok(Self::Warn),
            "INFO" => Ok(Self::Info),
            "DEBUG" => Ok(Self::Debug),
            "TRACE" => Ok(Self::Trace),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

// ============================================================================
// Settings
// ============================================================================

/// Resolved, immutable tracker settings
#[derive(Debug, Clone)]
pub struct Settings {
    /// Bearer credential for the tracking API
    pub api_key: String,

    /// Scheme and host of the tracking server
    pub api_base: Url,

    /// Path prefix under `api_base`
    pub api_url: String,

    /// Selected delivery strategy
    pub delivery_type: DeliveryType,

    /// Durable queue location
    pub db_path: PathBuf,

    /// Per-HTTP-request timeout
    pub timeout: Duration,

    /// Durable queue poll cadence
    pub poll_interval: Duration,

    /// Maximum wait before flushing a partial batch
    pub batch_interval: Duration,

    /// HTTP-level attempts within one delivery try
    pub max_attempts: u32,

    /// Reschedule attempts for queued entries
    pub max_retries: u32,

    /// Capacity of the in-memory queue
    pub queue_size: usize,

    /// Records per outbound POST
    pub max_batch_size: usize,

    /// Whether the immediate strategy raises on final failure
    pub raise_on_error: bool,

    /// Whether triggered limits are enforced at enqueue
    pub limits_enabled: bool,

    /// Logging verbosity
    pub log_level: LogLevel,

    /// Whether request/response bodies are logged (redacted)
    pub log_bodies: bool,

    /// In-memory queue overflow behavior
    pub overflow_policy: OverflowPolicy,
}

impl Settings {
    /// Full URL of the `/track` endpoint
    pub fn track_url(&self) -> String {
        format!(
            "{}{}/track",
            self.api_base.as_str().trim_end_matches('/'),
            self.api_url
        )
    }

    /// Full URL of the `/triggered-limits` endpoint
    pub fn limits_url(&self) -> String {
        format!(
            "{}{}/triggered-limits",
            self.api_base.as_str().trim_end_matches('/'),
            self.api_url
        )
    }

    /// The API key id that limits are scoped by.
    ///
    /// Keys shaped `aicm-<key_id>-<secret>` yield `<key_id>`; any other
    /// shape uses the whole key as the id.
    pub fn api_key_id(&self) -> &str {
        match self
            .api_key
            .strip_prefix("aicm-")
            .and_then(|rest| rest.split_once('-'))
        {
            Some((id, _)) if !id.is_empty() => {
                let offset = "aicm-".len();
                &self.api_key[offset..offset + id.len()]
            }
            _ => &self.api_key,
        }
    }

    /// How long an INFLIGHT queue entry may go unacknowledged before it
    /// is reclaimed: twice the request timeout, floored at one minute.
    pub fn inflight_reclaim(&self) -> Duration {
        (self.timeout * 2).max(Duration::from_secs(60))
    }

    /// Resolve settings from all four sources.
    ///
    /// Precedence, highest first: `overrides`, `AICM_*` environment
    /// variables, the store's `[tracker]` section, built-in defaults.
    pub fn resolve(
        overrides: SettingsOverrides,
        store: Option<&ConfigStore>,
    ) -> Result<Self, SettingsError> {
        let env = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX))
            .build()?;
        let file = store
            .map(|s| s.get_section(TRACKER_SECTION))
            .unwrap_or_default();

        let resolver = Resolver {
            env,
            file,
            overrides,
        };
        resolver.resolve()
    }
}

// ============================================================================
// SettingsOverrides
// ============================================================================

/// Constructor-argument settings layer; all fields optional
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub api_key: Option<String>,
    pub api_base: Option<String>,
    pub api_url: Option<String>,
    pub delivery_type: Option<DeliveryType>,
    pub db_path: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub poll_interval: Option<Duration>,
    pub batch_interval: Option<Duration>,
    pub max_attempts: Option<u32>,
    pub max_retries: Option<u32>,
    pub queue_size: Option<usize>,
    pub max_batch_size: Option<usize>,
    pub raise_on_error: Option<bool>,
    pub limits_enabled: Option<bool>,
    pub log_level: Option<LogLevel>,
    pub log_bodies: Option<bool>,
    pub overflow_policy: Option<OverflowPolicy>,
}

impl SettingsOverrides {
    /// Create an empty override set
    pub fn new() -> Self {
        Self::default()
    }
}

// ============================================================================
// Resolution
// ============================================================================

struct Resolver {
    env: config::Config,
    file: BTreeMap<String, String>,
    overrides: SettingsOverrides,
}

impl Resolver {
    /// Raw string from env (preferred) or store for a settings key
    fn raw(&self, key: &str) -> Option<String> {
        self.env
            .get_string(&key.to_ascii_lowercase())
            .ok()
            .or_else(|| self.file.get(key).cloned())
    }

    fn parsed<T, E: std::fmt::Display>(
        &self,
        key: &str,
        parse: impl Fn(&str) -> Result<T, E>,
    ) -> Result<Option<T>, SettingsError> {
        match self.raw(key) {
            Some(raw) => parse(raw.trim())
                .map(Some)
                .map_err(|e| SettingsError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    fn duration(&self, key: &str, explicit: Option<Duration>) -> Result<Option<Duration>, SettingsError> {
        if explicit.is_some() {
            return Ok(explicit);
        }
        self.parsed(key, |raw| {
            raw.parse::<f64>()
                .map_err(|e| e.to_string())
                .and_then(|secs| {
                    if secs.is_finite() && secs > 0.0 {
                        Ok(Duration::from_secs_f64(secs))
                    } else {
                        Err("must be a positive number of seconds".to_string())
                    }
                })
        })
    }

    fn integer<T: FromStr>(&self, key: &str, explicit: Option<T>) -> Result<Option<T>, SettingsError>
    where
        T::Err: std::fmt::Display,
    {
        if explicit.is_some() {
            return Ok(explicit);
        }
        self.parsed(key, |raw| raw.parse::<T>().map_err(|e| e.to_string()))
    }

    fn boolean(&self, key: &str, explicit: Option<bool>) -> Result<Option<bool>, SettingsError> {
        if explicit.is_some() {
            return Ok(explicit);
        }
        self.parsed(key, |raw| match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            other => Err(format!("'{}' is not a boolean", other)),
        })
    }

    fn resolve(self) -> Result<Settings, SettingsError> {
        let api_key = self
            .overrides
            .api_key
            .clone()
            .or_else(|| self.raw("API_KEY"))
            .ok_or(SettingsError::MissingApiKey)?;

        let api_base_raw = self
            .overrides
            .api_base
            .clone()
            .or_else(|| self.raw("API_BASE"))
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        let api_base = Url::parse(&api_base_raw).map_err(|e| SettingsError::InvalidValue {
            key: "API_BASE".to_string(),
            message: e.to_string(),
        })?;

        let api_url = self
            .overrides
            .api_url
            .clone()
            .or_else(|| self.raw("API_URL"))
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());

        let db_path_configured = self.overrides.db_path.is_some() || self.raw("DB_PATH").is_some();
        let db_path = self
            .overrides
            .db_path
            .clone()
            .or_else(|| self.raw("DB_PATH").map(PathBuf::from))
            .unwrap_or_else(default_db_path);

        let delivery_type = match self.overrides.delivery_type {
            Some(delivery_type) => delivery_type,
            None => match self.parsed("DELIVERY_TYPE", DeliveryType::from_str)? {
                Some(delivery_type) => delivery_type,
                // An explicit queue location implies the durable strategy.
                None if db_path_configured => DeliveryType::PersistentQueue,
                None => DeliveryType::Immediate,
            },
        };

        let settings = Settings {
            api_key,
            api_base,
            api_url,
            delivery_type,
            db_path,
            timeout: self
                .duration("TIMEOUT", self.overrides.timeout)?
                .unwrap_or(Duration::from_secs(10)),
            poll_interval: self
                .duration("POLL_INTERVAL", self.overrides.poll_interval)?
                .unwrap_or(Duration::from_millis(100)),
            batch_interval: self
                .duration("BATCH_INTERVAL", self.overrides.batch_interval)?
                .unwrap_or(Duration::from_millis(500)),
            max_attempts: self
                .integer("MAX_ATTEMPTS", self.overrides.max_attempts)?
                .unwrap_or(3),
            max_retries: self
                .integer("MAX_RETRIES", self.overrides.max_retries)?
                .unwrap_or(5),
            queue_size: self
                .integer("QUEUE_SIZE", self.overrides.queue_size)?
                .unwrap_or(10_000),
            max_batch_size: self
                .integer("MAX_BATCH_SIZE", self.overrides.max_batch_size)?
                .unwrap_or(100),
            raise_on_error: self
                .boolean("RAISE_ON_ERROR", self.overrides.raise_on_error)?
                .unwrap_or(false),
            limits_enabled: self
                .boolean("LIMITS_ENABLED", self.overrides.limits_enabled)?
                .unwrap_or(false),
            log_level: match self.overrides.log_level {
                Some(level) => level,
                None => self
                    .parsed("LOG_LEVEL", LogLevel::from_str)?
                    .unwrap_or_default(),
            },
            log_bodies: self
                .boolean("LOG_BODIES", self.overrides.log_bodies)?
                .unwrap_or(false),
            overflow_policy: match self.overrides.overflow_policy {
                Some(policy) => policy,
                None => self
                    .parsed("OVERFLOW_POLICY", OverflowPolicy::from_str)?
                    .unwrap_or(OverflowPolicy::Backpressure),
            },
        };

        validate(&settings)?;
        Ok(settings)
    }
}

fn validate(settings: &Settings) -> Result<(), SettingsError> {
    let positive = |key: &str, value: usize| {
        if value == 0 {
            Err(SettingsError::InvalidValue {
                key: key.to_string(),
                message: "must be at least 1".to_string(),
            })
        } else {
            Ok(())
        }
    };

    positive("MAX_ATTEMPTS", settings.max_attempts as usize)?;
    positive("QUEUE_SIZE", settings.queue_size)?;
    positive("MAX_BATCH_SIZE", settings.max_batch_size)?;
    Ok(())
}

fn default_db_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("aicm")
        .join("queue.db")
}
