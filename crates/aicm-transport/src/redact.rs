//! Sensitive-field redaction for body logging.
//!
//! When `LOG_BODIES` is enabled, request and response bodies are logged
//! at debug level. Credential-bearing fields must never reach the log
//! stream, so bodies pass through here first.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

#[cfg(test)]
#[path = "redact_tests.rs"]
mod tests;

/// Replacement for redacted values
pub const REDACTED: &str = "[REDACTED]";

/// Field names whose values are always redacted, case-insensitively
const SENSITIVE_KEYS: [&str; 4] = ["authorization", "api_key", "password", "token"];

fn bearer_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // "Bearer <token>" in any casing, token being a typical
        // base64url/opaque credential
        Regex::new(r"(?i)bearer\s+[A-Za-z0-9._~+/=-]+").unwrap()
    })
}

/// Redact a JSON body for logging.
///
/// Sensitive keys are replaced wholesale at any nesting depth; string
/// values that look like bearer credentials are replaced even under
/// innocuous keys.
pub fn redact_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, nested)| {
                    if is_sensitive_key(key) {
                        (key.clone(), Value::String(REDACTED.to_string()))
                    } else {
                        (key.clone(), redact_json(nested))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_json).collect()),
        Value::String(s) if bearer_pattern().is_match(s) => {
            Value::String(bearer_pattern().replace_all(s, REDACTED).into_owned())
        }
        other => other.clone(),
    }
}

/// Redact bearer credentials in raw body text
pub fn redact_text(text: &str) -> String {
    bearer_pattern().replace_all(text, REDACTED).into_owned()
}

fn is_sensitive_key(key: &str) -> bool {
    SENSITIVE_KEYS
        .iter()
        .any(|sensitive| key.eq_ignore_ascii_case(sensitive))
}
