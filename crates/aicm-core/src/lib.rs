//! # AICM Core
//!
//! Core domain types for the AICM usage tracking SDK.
//!
//! This crate contains the pieces of the SDK that do not talk to the
//! network: the usage record model and its wire form, per-service usage
//! schemas, the triggered-limits cache, layered settings resolution, and
//! the shared on-disk configuration store.
//!
//! ## Module Organization
//!
//! - [`error`] - Error types shared across the SDK
//! - [`record`] - Usage records and their deterministic wire form
//! - [`schema`] - Optional per-service usage payload validation
//! - [`limits`] - Cached triggered-limit state and matching
//! - [`settings`] - Layered settings resolution
//! - [`config_store`] - Locked, atomically-written INI configuration file

pub mod config_store;
pub mod error;
pub mod limits;
pub mod record;
pub mod schema;
pub mod settings;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// Re-export commonly used types at crate root for convenience
pub use config_store::{ConfigStore, IniDocument};
pub use error::{ConfigError, CoreResult, SettingsError, UsageValidationError, ValidationError};
pub use limits::{CheckScope, LimitsLoad, ThresholdType, TriggeredLimit, TriggeredLimitsCache};
pub use record::{UsageRecord, UsageRecordBuilder};
pub use schema::{FieldType, SchemaRegistry, UsageSchema};
pub use settings::{DeliveryType, LogLevel, OverflowPolicy, Settings, SettingsOverrides};

// ============================================================================
// Domain Identifier Types
// ============================================================================

/// Idempotency key for a usage record.
///
/// Either supplied by the caller (e.g. the provider's response id) or
/// generated as a UUIDv4 at record construction time. The server
/// deduplicates on this value, which is what turns at-least-once delivery
/// into effectively-once accounting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResponseId(String);

impl ResponseId {
    /// Generate a new random response ID
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wrap a caller-supplied response ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get response ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResponseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ResponseId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for ResponseId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Opaque identifier of an upstream vendor/model combination.
///
/// Dotted identifiers such as `openai::gpt-4o-mini` are common but the
/// core never decomposes the value; it only validates that the key is
/// usable as a flat lookup string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceKey(String);

impl ServiceKey {
    /// Create a new service key with validation
    pub fn new(key: impl Into<String>) -> Result<Self, ValidationError> {
        let key = key.into();
        if key.is_empty() || key.len() > 256 {
            return Err(ValidationError::OutOfRange {
                field: "service_key".to_string(),
                message: "must be 1-256 characters".to_string(),
            });
        }

        if key.chars().any(|c| c.is_control() || c.is_whitespace()) {
            return Err(ValidationError::InvalidFormat {
                field: "service_key".to_string(),
                message: "whitespace and control characters not allowed".to_string(),
            });
        }

        Ok(Self(key))
    }

    /// Get service key as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ServiceKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
