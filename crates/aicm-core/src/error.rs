//! Error types shared across the AICM SDK.
//!
//! Each error enum classifies its variants for retry logic where that is
//! meaningful; validation and settings errors are never retried.

use thiserror::Error;

/// Standard result type for core operations
pub type CoreResult<T> = Result<T, ValidationError>;

/// Input validation errors.
///
/// Raised synchronously from record construction; never retried.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing.
    #[error("Required field missing: {field}")]
    Required { field: String },

    /// A field has an invalid format.
    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    /// A field value is out of the acceptable range.
    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },

    /// The usage payload does not match the service schema.
    #[error(transparent)]
    Schema(#[from] UsageValidationError),
}

/// Usage payload failed validation against a service schema.
///
/// Carries the full field-level breakdown so callers can report exactly
/// what was wrong instead of a single opaque message.
#[derive(Debug, Clone, Error)]
#[error("Usage for '{service_key}' failed schema validation \
         (missing: {missing:?}, extra: {extra:?}, type errors: {type_errors:?})")]
pub struct UsageValidationError {
    /// Service key whose schema rejected the payload
    pub service_key: String,

    /// Required fields absent from the payload
    pub missing: Vec<String>,

    /// Fields present in the payload but not allowed by the schema
    pub extra: Vec<String>,

    /// Fields whose value type does not match the schema, as
    /// `field: expected <type>, got <type>` descriptions
    pub type_errors: Vec<String>,
}

/// Errors from the on-disk configuration store.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Writing the configuration file failed. Recoverable; callers may retry.
    #[error("Failed to persist configuration to {path}: {message}")]
    Persist { path: String, message: String },

    /// The advisory file lock could not be acquired or released.
    #[error("Configuration lock failed for {path}: {message}")]
    Lock { path: String, message: String },
}

impl ConfigError {
    /// Check if this error represents a transient condition that may
    /// succeed if retried.
    ///
    /// Both persist and lock failures are recoverable: another process may
    /// release the lock, and a full disk or busy rename can clear up.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Persist { .. } | Self::Lock { .. })
    }
}

/// Errors during settings resolution.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// No API key was found in any settings source.
    #[error("API key is required: set it explicitly, via AICM_API_KEY, or in the [tracker] section")]
    MissingApiKey,

    /// A settings value could not be parsed as its expected type.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// The environment source could not be read.
    #[error("Environment configuration failed: {0}")]
    Environment(#[from] config::ConfigError),
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
