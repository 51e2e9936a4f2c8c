//! Common test utilities for SDK integration tests.
//!
//! Provides mock tracking-server builders and tracker fixtures wired
//! to them.

// Each test binary includes this module and uses a different subset.
#![allow(dead_code)]

use aicm::{DeliveryType, SettingsOverrides, Tracker, TrackerBuilder};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// A mock server whose /track endpoint answers every record `queued`,
/// echoing request response_ids back in the results list.
pub async fn queued_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/track"))
        .respond_with(echo_queued())
        .mount(&server)
        .await;
    server
}

/// Responder that echoes each incoming record as `queued`
pub fn echo_queued() -> impl wiremock::Respond + 'static {
    |request: &wiremock::Request| {
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap_or(json!({}));
        let results: Vec<serde_json::Value> = body["records"]
            .as_array()
            .map(|records| {
                records
                    .iter()
                    .map(|record| {
                        json!({
                            "response_id": record["response_id"],
                            "status": "queued",
                            "cost_event_id": format!("ce-{}", record["response_id"].as_str().unwrap_or("?")),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        ResponseTemplate::new(200).set_body_json(json!({ "results": results }))
    }
}

/// Overrides pointing a tracker at the mock server with fast timings
pub fn overrides_for(server: &MockServer, delivery_type: DeliveryType) -> SettingsOverrides {
    SettingsOverrides {
        api_key: Some("aicm-k1-secret".to_string()),
        api_base: Some(server.uri()),
        delivery_type: Some(delivery_type),
        timeout: Some(Duration::from_secs(5)),
        poll_interval: Some(Duration::from_millis(10)),
        batch_interval: Some(Duration::from_millis(20)),
        ..SettingsOverrides::default()
    }
}

/// A tracker bound to the server, without an on-disk config store
pub fn tracker_builder(server: &MockServer, delivery_type: DeliveryType) -> TrackerBuilder {
    Tracker::builder()
        .overrides(overrides_for(server, delivery_type))
        .without_config_store()
}

/// Count how many records the server has received on /track
pub async fn records_received(server: &MockServer) -> Vec<String> {
    let mut ids = Vec::new();
    for request in server.received_requests().await.unwrap_or_default() {
        if request.url.path() != "/api/v1/track" {
            continue;
        }
        if let Ok(body) = serde_json::from_slice::<serde_json::Value>(&request.body) {
            if let Some(records) = body["records"].as_array() {
                for record in records {
                    if let Some(id) = record["response_id"].as_str() {
                        ids.push(id.to_string());
                    }
                }
            }
        }
    }
    ids
}
