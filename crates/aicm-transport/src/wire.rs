//! Request and response wire types for the tracking API.

use aicm_core::limits::TriggeredLimit;
use aicm_core::UsageRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[cfg(test)]
#[path = "wire_tests.rs"]
mod tests;

/// Body of `POST /track`
#[derive(Debug, Clone, Serialize)]
pub struct TrackRequest {
    pub records: Vec<Value>,
}

impl TrackRequest {
    /// Build the request body from in-memory records
    pub fn from_records(records: &[UsageRecord]) -> Self {
        Self {
            records: records.iter().map(UsageRecord::to_wire).collect(),
        }
    }
}

/// Per-record delivery outcome reported by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Accepted and queued for costing
    Queued,
    /// The service key is unknown to the server; the record is dropped
    /// without costing but counts as delivered for queue bookkeeping
    ServiceKeyUnknown,
    /// Permanently refused
    Rejected,
}

/// One entry of the response `results` list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordResult {
    pub response_id: String,

    pub status: RecordStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_event_id: Option<String>,
}

impl RecordResult {
    /// Whether this outcome closes out the record (no retry either way)
    pub fn is_terminal(&self) -> bool {
        // Every currently defined status is terminal; queued means the
        // server owns the record from here on.
        true
    }
}

/// Body of a 2xx `/track` response
#[derive(Debug, Clone, Deserialize)]
pub struct TrackResponse {
    /// Batch-level status; `service_key_unknown` marks every record
    #[serde(default)]
    pub status: Option<String>,

    #[serde(default)]
    pub results: Vec<RecordResult>,

    #[serde(default)]
    pub triggered_limits: Option<Vec<TriggeredLimit>>,
}

/// Body of the `/triggered-limits` endpoint.
///
/// The server wraps the list in an object; a bare array is accepted for
/// compatibility via [`LimitsResponse::parse`].
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsResponse {
    #[serde(default)]
    pub triggered_limits: Vec<TriggeredLimit>,
}

impl LimitsResponse {
    /// Parse either `{ "triggered_limits": [...] }` or a bare `[...]`
    pub fn parse(body: &str) -> Result<Self, serde_json::Error> {
        match serde_json::from_str::<Vec<TriggeredLimit>>(body) {
            Ok(triggered_limits) => Ok(Self { triggered_limits }),
            Err(_) => serde_json::from_str(body),
        }
    }
}

/// Structured error body of a 4xx/5xx response
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub detail: Option<String>,

    #[serde(default)]
    pub code: Option<String>,
}

impl ApiErrorBody {
    /// Best-effort parse; an unstructured body yields the default
    pub fn parse(body: &str) -> Self {
        serde_json::from_str(body).unwrap_or_default()
    }
}
