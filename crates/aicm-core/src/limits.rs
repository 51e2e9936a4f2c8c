//! Cached triggered-limit state and record matching.
//!
//! After every successful delivery the server may return the current set
//! of triggered limits for the API key. The cache absorbs that set,
//! persists it to the configuration store so other processes and future
//! runs start warm, and answers match queries on the enqueue path.

use crate::config_store::ConfigStore;
use crate::error::ConfigError;
use crate::record::UsageRecord;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "limits_tests.rs"]
mod tests;

/// Configuration store section holding the serialized limit set
const LIMITS_SECTION: &str = "triggered_limits";

// ============================================================================
// TriggeredLimit
// ============================================================================

/// Severity of a triggered limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThresholdType {
    /// Informational; usage continues unhindered
    Warning,
    /// Hard limit; matching records raise after delivery
    Limit,
}

/// A server-issued assertion that a given scope has passed a threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggeredLimit {
    pub limit_id: String,

    pub threshold_type: ThresholdType,

    #[serde(default)]
    pub amount: f64,

    #[serde(default)]
    pub period: String,

    pub api_key_id: String,

    /// Scoping field; `None` matches any service key
    #[serde(default)]
    pub service_key: Option<String>,

    /// Scoping field; `None` matches any customer key
    #[serde(default)]
    pub customer_key: Option<String>,

    #[serde(default)]
    pub config_id_list: Vec<String>,

    #[serde(default)]
    pub hostname: String,

    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl TriggeredLimit {
    /// Check whether this limit scopes over the given record.
    ///
    /// Non-null scoping fields must equal the record's corresponding
    /// fields; null fields act as wildcards. An expired limit matches
    /// nothing.
    pub fn matches(&self, scope: &CheckScope<'_>) -> bool {
        if self.is_expired(Utc::now()) {
            return false;
        }
        if self.api_key_id != scope.api_key_id {
            return false;
        }
        if let Some(ref service_key) = self.service_key {
            if service_key != scope.service_key {
                return false;
            }
        }
        if let Some(ref customer_key) = self.customer_key {
            if Some(customer_key.as_str()) != scope.customer_key {
                return false;
            }
        }
        true
    }

    /// Whether this limit has lapsed
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires_at) if expires_at <= now)
    }
}

/// The record fields a limit can scope over
#[derive(Debug, Clone, Copy)]
pub struct CheckScope<'a> {
    pub api_key_id: &'a str,
    pub service_key: &'a str,
    pub customer_key: Option<&'a str>,
}

impl<'a> CheckScope<'a> {
    /// Build the scope for a record under the given API key id
    pub fn for_record(api_key_id: &'a str, record: &'a UsageRecord) -> Self {
        Self {
            api_key_id,
            service_key: record.service_key().as_str(),
            customer_key: record.customer_key(),
        }
    }
}

// ============================================================================
// TriggeredLimitsCache
// ============================================================================

/// Outcome of warming the cache from the configuration store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitsLoad {
    /// Limits were loaded from the store
    Loaded(usize),
    /// The store had no usable limit state
    Empty,
    /// The stored blob failed its checksum; the caller should schedule a
    /// refresh from the server
    Corrupt,
}

struct CacheState {
    limits: Vec<TriggeredLimit>,
    by_api_key: HashMap<String, Vec<usize>>,
}

impl CacheState {
    fn new(limits: Vec<TriggeredLimit>) -> Self {
        let mut by_api_key: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, limit) in limits.iter().enumerate() {
            by_api_key
                .entry(limit.api_key_id.clone())
                .or_default()
                .push(index);
        }
        Self { limits, by_api_key }
    }
}

/// Thread-safe cache of the current triggered-limit set.
///
/// Readers never block each other; only [`replace_all`](TriggeredLimitsCache::replace_all)
/// takes the writer lock.
pub struct TriggeredLimitsCache {
    state: RwLock<CacheState>,
    store: Option<ConfigStore>,
}

impl TriggeredLimitsCache {
    /// Create an empty cache, optionally persisting through a store
    pub fn new(store: Option<ConfigStore>) -> Self {
        Self {
            state: RwLock::new(CacheState::new(Vec::new())),
            store,
        }
    }

    /// Atomically swap in a new limit set and persist it.
    ///
    /// The in-memory swap always happens; a persist failure is returned
    /// so the caller can decide whether it matters.
    pub fn replace_all(&self, limits: Vec<TriggeredLimit>) -> Result<(), ConfigError> {
        let serialized = self.store.as_ref().map(|_| Self::encode(&limits));

        {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            *state = CacheState::new(limits);
        }

        if let (Some(store), Some(section)) = (self.store.as_ref(), serialized) {
            store.replace_section(LIMITS_SECTION, section)?;
        }
        Ok(())
    }

    /// Absorb the authoritative limit set from a server response.
    ///
    /// Persist failures are logged rather than surfaced: delivery must
    /// not fail because the local cache file is unwritable.
    pub fn notify(&self, limits: Vec<TriggeredLimit>) {
        let count = limits.len();
        if let Err(e) = self.replace_all(limits) {
            warn!(error = %e, "failed to persist triggered limits, in-memory state updated");
        } else {
            debug!(count, "triggered limits refreshed");
        }
    }

    /// Return the first matching limit with `LIMIT` severity, if any
    pub fn check(&self, scope: &CheckScope<'_>) -> Option<TriggeredLimit> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let indexes = state.by_api_key.get(scope.api_key_id)?;
        indexes
            .iter()
            .map(|&index| &state.limits[index])
            .find(|limit| limit.threshold_type == ThresholdType::Limit && limit.matches(scope))
            .cloned()
    }

    /// Warm the cache from the configuration store if it is still empty.
    ///
    /// A checksum mismatch is treated as empty and reported as
    /// [`LimitsLoad::Corrupt`] so the owner can schedule a server refresh.
    pub fn load_from_store_if_empty(&self) -> LimitsLoad {
        {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            if !state.limits.is_empty() {
                return LimitsLoad::Loaded(state.limits.len());
            }
        }

        let Some(store) = self.store.as_ref() else {
            return LimitsLoad::Empty;
        };

        let section = store.get_section(LIMITS_SECTION);
        let (Some(payload), Some(checksum)) = (section.get("payload"), section.get("checksum"))
        else {
            return LimitsLoad::Empty;
        };

        match Self::decode(payload, checksum) {
            Ok(limits) => {
                let count = limits.len();
                let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
                *state = CacheState::new(limits);
                LimitsLoad::Loaded(count)
            }
            Err(message) => {
                warn!(message, "stored triggered limits unusable, treating as empty");
                LimitsLoad::Corrupt
            }
        }
    }

    /// Number of cached limits
    pub fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .limits
            .len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current limit set
    pub fn snapshot(&self) -> Vec<TriggeredLimit> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .limits
            .clone()
    }

    fn encode(limits: &[TriggeredLimit]) -> BTreeMap<String, String> {
        let json = serde_json::to_string(limits).unwrap_or_else(|_| "[]".to_string());
        let payload = BASE64.encode(json.as_bytes());
        let checksum = hex::encode(Sha256::digest(payload.as_bytes()));

        let mut section = BTreeMap::new();
        section.insert("payload".to_string(), payload);
        section.insert("checksum".to_string(), checksum);
        section
    }

    fn decode(payload: &str, checksum: &str) -> Result<Vec<TriggeredLimit>, &'static str> {
        let actual = hex::encode(Sha256::digest(payload.as_bytes()));
        if actual != checksum {
            return Err("checksum mismatch");
        }
        let json = BASE64
            .decode(payload.as_bytes())
            .map_err(|_| "payload is not valid base64")?;
        serde_json::from_slice(&json).map_err(|_| "payload is not a valid limit list")
    }
}
