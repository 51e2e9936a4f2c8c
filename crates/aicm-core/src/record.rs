//! Usage records and their deterministic wire form.
//!
//! A [`UsageRecord`] is one usage measurement on its way to the server.
//! Once constructed, its `response_id`, `service_key`, and `timestamp`
//! never change; the struct exposes getters only. Serialization is
//! deterministic: map-valued fields are kept in sorted key order and
//! nested usage values are normalized at construction time.

use crate::error::ValidationError;
use crate::schema::SchemaRegistry;
use crate::{ResponseId, ServiceKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[cfg(test)]
#[path = "record_tests.rs"]
mod tests;

/// Maximum nesting depth preserved inside `usage` and `context` values.
///
/// Provider response objects occasionally carry deeply nested or
/// self-referential structures; anything beyond this depth is replaced
/// with [`DEPTH_MARKER`] rather than followed.
pub const MAX_VALUE_DEPTH: usize = 8;

/// Marker substituted for values nested beyond [`MAX_VALUE_DEPTH`]
pub const DEPTH_MARKER: &str = "<max-depth-exceeded>";

// ============================================================================
// UsageRecord
// ============================================================================

/// A single usage measurement sent to the server.
///
/// Field order matches the wire contract of `POST /track`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    service_key: ServiceKey,

    response_id: ResponseId,

    timestamp: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    customer_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<BTreeMap<String, Value>>,

    /// Legacy provider hint; accepted on input, optional on the wire
    #[serde(skip_serializing_if = "Option::is_none")]
    api_id: Option<String>,

    usage: BTreeMap<String, Value>,
}

impl UsageRecord {
    /// Start building a record for the given service key and usage payload.
    ///
    /// `usage` must be a JSON object of service-specific counts.
    pub fn builder(service_key: impl Into<String>, usage: Value) -> UsageRecordBuilder {
        UsageRecordBuilder {
            service_key: service_key.into(),
            usage,
            response_id: None,
            timestamp: None,
            customer_key: None,
            context: None,
            api_id: None,
        }
    }

    /// Service key this usage belongs to
    pub fn service_key(&self) -> &ServiceKey {
        &self.service_key
    }

    /// Idempotency key for this record
    pub fn response_id(&self) -> &ResponseId {
        &self.response_id
    }

    /// Record creation instant (UTC)
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Customer attribution tag, if any
    pub fn customer_key(&self) -> Option<&str> {
        self.customer_key.as_deref()
    }

    /// Free-form metadata attached to this record
    pub fn context(&self) -> Option<&BTreeMap<String, Value>> {
        self.context.as_ref()
    }

    /// Legacy provider hint
    pub fn api_id(&self) -> Option<&str> {
        self.api_id.as_deref()
    }

    /// Service-specific usage counts
    pub fn usage(&self) -> &BTreeMap<String, Value> {
        &self.usage
    }

    /// Deterministic JSON wire form
    pub fn to_wire(&self) -> Value {
        // Maps are BTreeMaps and nested values were normalized at build
        // time, so field keys and nested object keys are already sorted.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Reconstruct a record from its wire form
    pub fn from_wire(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`UsageRecord`].
///
/// Optional fields default at [`build`](Self::build) time: a UUIDv4
/// `response_id` and the current UTC instant.
#[derive(Debug)]
pub struct UsageRecordBuilder {
    service_key: String,
    usage: Value,
    response_id: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    customer_key: Option<String>,
    context: Option<BTreeMap<String, Value>>,
    api_id: Option<String>,
}

impl UsageRecordBuilder {
    /// Set an explicit idempotency key
    pub fn with_response_id(mut self, response_id: impl Into<String>) -> Self {
        self.response_id = Some(response_id.into());
        self
    }

    /// Set an explicit record timestamp
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Attribute this record to a customer
    pub fn with_customer_key(mut self, customer_key: impl Into<String>) -> Self {
        self.customer_key = Some(customer_key.into());
        self
    }

    /// Attach free-form metadata.
    ///
    /// Context supplied here replaces any tracker-wide default wholesale;
    /// the two are never merged.
    pub fn with_context(mut self, context: BTreeMap<String, Value>) -> Self {
        self.context = Some(context);
        self
    }

    /// Set the legacy provider hint
    pub fn with_api_id(mut self, api_id: impl Into<String>) -> Self {
        self.api_id = Some(api_id.into());
        self
    }

    /// Validate and construct the record.
    ///
    /// The usage payload is normalized (sorted keys, bounded depth) and
    /// checked against the service's schema when the registry carries one.
    pub fn build(self, schemas: &SchemaRegistry) -> Result<UsageRecord, ValidationError> {
        let service_key = ServiceKey::new(self.service_key)?;

        let Value::Object(usage_map) = normalize_value(self.usage, MAX_VALUE_DEPTH) else {
            return Err(ValidationError::InvalidFormat {
                field: "usage".to_string(),
                message: "must be a JSON object".to_string(),
            });
        };
        let usage: BTreeMap<String, Value> = usage_map.into_iter().collect();

        schemas.validate(service_key.as_str(), &usage)?;

        let context = self.context.map(|ctx| {
            ctx.into_iter()
                .map(|(k, v)| (k, normalize_value(v, MAX_VALUE_DEPTH)))
                .collect()
        });

        Ok(UsageRecord {
            service_key,
            response_id: self
                .response_id
                .map(ResponseId::new)
                .unwrap_or_else(ResponseId::generate),
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            customer_key: self.customer_key,
            context,
            api_id: self.api_id,
            usage,
        })
    }
}

// ============================================================================
// Value Normalization
// ============================================================================

/// Normalize a JSON value for deterministic serialization.
///
/// Objects are rebuilt with keys inserted in sorted order and recursion
/// stops at `depth` levels; anything deeper becomes [`DEPTH_MARKER`].
fn normalize_value(value: Value, depth: usize) -> Value {
    match value {
        Value::Object(map) => {
            if depth == 0 {
                return Value::String(DEPTH_MARKER.to_string());
            }
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut out = Map::new();
            for (key, nested) in entries {
                out.insert(key, normalize_value(nested, depth - 1));
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            if depth == 0 {
                return Value::String(DEPTH_MARKER.to_string());
            }
            Value::Array(
                items
                    .into_iter()
                    .map(|item| normalize_value(item, depth - 1))
                    .collect(),
            )
        }
        other => other,
    }
}
