//! Optional per-service usage payload validation.
//!
//! Schemas are supplied at tracker construction and keyed by service-key
//! pattern. A service key with no matching schema is accepted as-is.

use crate::error::{UsageValidationError, ValidationError};
use serde_json::Value;
use std::collections::BTreeMap;

#[cfg(test)]
#[path = "schema_tests.rs"]
mod tests;

// ============================================================================
// Field Types
// ============================================================================

/// Expected JSON type of a usage field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// JSON string
    String,
    /// JSON integer (no fractional part)
    Integer,
    /// Any JSON number
    Float,
    /// JSON boolean
    Boolean,
    /// JSON object
    Object,
    /// JSON array
    Array,
    /// Any JSON value
    Any,
}

impl FieldType {
    /// Check whether a JSON value satisfies this type
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Float => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Any => true,
        }
    }

    /// Short name used in type-error descriptions
    pub fn name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
            Self::Any => "any",
        }
    }

    fn describe(value: &Value) -> &'static str {
        match value {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }
}

// ============================================================================
// UsageSchema
// ============================================================================

/// Schema for one service's usage payload
#[derive(Debug, Clone, Default)]
pub struct UsageSchema {
    /// Fields that must be present
    pub required: BTreeMap<String, FieldType>,

    /// Fields that may be present
    pub optional: BTreeMap<String, FieldType>,

    /// Whether fields outside `required`/`optional` are accepted
    pub allow_extra: bool,
}

impl UsageSchema {
    /// Create an empty schema that accepts any payload
    pub fn new() -> Self {
        Self {
            allow_extra: true,
            ..Self::default()
        }
    }

    /// Require a field of the given type
    pub fn require(mut self, field: impl Into<String>, field_type: FieldType) -> Self {
        self.required.insert(field.into(), field_type);
        self
    }

    /// Allow an optional field of the given type
    pub fn allow(mut self, field: impl Into<String>, field_type: FieldType) -> Self {
        self.optional.insert(field.into(), field_type);
        self
    }

    /// Reject fields not named by the schema
    pub fn closed(mut self) -> Self {
        self.allow_extra = false;
        self
    }

    /// Validate a usage payload.
    ///
    /// All three defect lists are collected in one pass so callers see
    /// the complete picture rather than the first problem found.
    pub fn validate(
        &self,
        service_key: &str,
        usage: &BTreeMap<String, Value>,
    ) -> Result<(), UsageValidationError> {
        let mut missing = Vec::new();
        let mut extra = Vec::new();
        let mut type_errors = Vec::new();

        for (field, field_type) in &self.required {
            match usage.get(field) {
                None => missing.push(field.clone()),
                Some(value) if !field_type.matches(value) => {
                    type_errors.push(format!(
                        "{}: expected {}, got {}",
                        field,
                        field_type.name(),
                        FieldType::describe(value)
                    ));
                }
                Some(_) => {}
            }
        }

        for (field, value) in usage {
            if self.required.contains_key(field) {
                continue;
            }
            match self.optional.get(field) {
                Some(field_type) if !field_type.matches(value) => {
                    type_errors.push(format!(
                        "{}: expected {}, got {}",
                        field,
                        field_type.name(),
                        FieldType::describe(value)
                    ));
                }
                Some(_) => {}
                None if !self.allow_extra => extra.push(field.clone()),
                None => {}
            }
        }

        if missing.is_empty() && extra.is_empty() && type_errors.is_empty() {
            Ok(())
        } else {
            Err(UsageValidationError {
                service_key: service_key.to_string(),
                missing,
                extra,
                type_errors,
            })
        }
    }
}

// ============================================================================
// SchemaRegistry
// ============================================================================

/// Lookup table from service-key pattern to schema.
///
/// Patterns are either exact service keys or prefixes ending in `*`
/// (e.g. `openai::*`). The first registered match wins.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    entries: Vec<(String, UsageSchema)>,
}

impl SchemaRegistry {
    /// Create an empty registry; validation becomes a no-op
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema for a service-key pattern
    pub fn register(&mut self, pattern: impl Into<String>, schema: UsageSchema) {
        self.entries.push((pattern.into(), schema));
    }

    /// Builder-style [`register`](Self::register)
    pub fn with_schema(mut self, pattern: impl Into<String>, schema: UsageSchema) -> Self {
        self.register(pattern, schema);
        self
    }

    /// Whether any schemas are registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Validate a usage payload against the first matching schema, if any
    pub fn validate(
        &self,
        service_key: &str,
        usage: &BTreeMap<String, Value>,
    ) -> Result<(), ValidationError> {
        match self.find(service_key) {
            Some(schema) => schema
                .validate(service_key, usage)
                .map_err(ValidationError::Schema),
            None => Ok(()),
        }
    }

    fn find(&self, service_key: &str) -> Option<&UsageSchema> {
        self.entries.iter().find_map(|(pattern, schema)| {
            let matched = match pattern.strip_suffix('*') {
                Some(prefix) => service_key.starts_with(prefix),
                None => pattern == service_key,
            };
            matched.then_some(schema)
        })
    }
}
