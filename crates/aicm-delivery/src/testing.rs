//! Scripted stub transport shared by the strategy tests.

use aicm_core::limits::TriggeredLimit;
use aicm_core::{SchemaRegistry, UsageRecord};
use aicm_transport::client::{BatchResponse, LimitsFetch};
use aicm_transport::{RecordResult, RecordStatus, Transport, TransportError};
use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// One scripted `send_batch` outcome; the script repeats its final
/// default (`Succeed`) once exhausted.
pub(crate) enum Step {
    /// Every record comes back `queued`
    Succeed,
    /// Records come back with the given statuses, zipped in order
    SucceedWithStatuses(Vec<RecordStatus>),
    /// Every record queued, plus a triggered-limits refresh
    SucceedWithLimits(Vec<TriggeredLimit>),
    /// 503-shaped transient failure
    FailTransient,
    /// 422-shaped permanent rejection
    FailPermanent,
}

/// Hand-rolled transport stub: pops one scripted step per call and
/// records every batch it saw.
pub(crate) struct StubTransport {
    script: Mutex<VecDeque<Step>>,
    pub calls: AtomicUsize,
    /// Response ids per observed batch, in call order
    pub batches: Mutex<Vec<Vec<String>>>,
}

impl StubTransport {
    pub fn new(script: Vec<Step>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            batches: Mutex::new(Vec::new()),
        }
    }

    pub fn always_succeeding() -> Self {
        Self::new(Vec::new())
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen_batches(&self) -> Vec<Vec<String>> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for StubTransport {
    async fn send_batch(&self, records: &[UsageRecord]) -> Result<BatchResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.batches.lock().unwrap().push(
            records
                .iter()
                .map(|record| record.response_id().to_string())
                .collect(),
        );

        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Step::Succeed);

        let queued_all = |limits: Option<Vec<TriggeredLimit>>| BatchResponse {
            results: records
                .iter()
                .map(|record| RecordResult {
                    response_id: record.response_id().to_string(),
                    status: RecordStatus::Queued,
                    cost_event_id: None,
                })
                .collect(),
            triggered_limits: limits,
        };

        match step {
            Step::Succeed => Ok(queued_all(None)),
            Step::SucceedWithLimits(limits) => Ok(queued_all(Some(limits))),
            Step::SucceedWithStatuses(statuses) => Ok(BatchResponse {
                results: records
                    .iter()
                    .zip(statuses)
                    .map(|(record, status)| RecordResult {
                        response_id: record.response_id().to_string(),
                        status,
                        cost_event_id: None,
                    })
                    .collect(),
                triggered_limits: None,
            }),
            Step::FailTransient => Err(TransportError::Http {
                status: 503,
                message: "stub outage".to_string(),
            }),
            Step::FailPermanent => Err(TransportError::Rejected {
                status: 422,
                detail: "stub rejection".to_string(),
                code: None,
            }),
        }
    }

    async fn fetch_limits(&self, _etag: Option<&str>) -> Result<LimitsFetch, TransportError> {
        Ok(LimitsFetch::Unchanged)
    }
}

/// A minimal record with a fixed response id
pub(crate) fn record(response_id: &str) -> UsageRecord {
    UsageRecord::builder("openai::gpt-4o-mini", json!({"input_tokens": 1}))
        .with_response_id(response_id)
        .build(&SchemaRegistry::new())
        .unwrap()
}

/// A LIMIT-severity triggered limit scoped only by api key id
pub(crate) fn hard_limit(limit_id: &str, api_key_id: &str) -> TriggeredLimit {
    TriggeredLimit {
        limit_id: limit_id.to_string(),
        threshold_type: aicm_core::limits::ThresholdType::Limit,
        amount: 100.0,
        period: "month".to_string(),
        api_key_id: api_key_id.to_string(),
        service_key: None,
        customer_key: None,
        config_id_list: Vec::new(),
        hostname: "api.example.com".to_string(),
        expires_at: None,
    }
}
