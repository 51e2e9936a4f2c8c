//! Tests for the tracker facade against a mock server.

use super::*;
use aicm_core::{FieldType, UsageSchema};
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn server_with_queued_response() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/track"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{"response_id": "r1", "status": "queued", "cost_event_id": "ce-1"}]
        })))
        .mount(&server)
        .await;
    server
}

fn builder_for(server: &MockServer) -> TrackerBuilder {
    Tracker::builder()
        .api_key("aicm-k1-secret")
        .api_base(server.uri())
        .without_config_store()
}

mod tracking {
    use super::*;

    /// The immediate strategy returns the server's result inline.
    #[tokio::test]
    async fn test_track_happy_path() {
        let server = server_with_queued_response().await;
        let tracker = builder_for(&server).build().await.unwrap();

        let result = tracker
            .track_with(
                "openai::gpt-4o-mini",
                json!({"input_tokens": 10, "output_tokens": 20}),
                TrackOptions {
                    response_id: Some("r1".to_string()),
                    ..TrackOptions::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(result.response_id, "r1");
        assert_eq!(result.status, TrackStatus::Queued);
        assert_eq!(result.cost_event_id.as_deref(), Some("ce-1"));

        tracker.close().await.unwrap();
    }

    /// Validation failures surface before anything reaches the wire.
    #[tokio::test]
    async fn test_validation_precedes_delivery() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": []})))
            .expect(0)
            .mount(&server)
            .await;

        let schemas = SchemaRegistry::new().with_schema(
            "openai::*",
            UsageSchema::new()
                .require("input_tokens", FieldType::Integer)
                .closed(),
        );
        let tracker = builder_for(&server).schemas(schemas).build().await.unwrap();

        let error = tracker
            .track("openai::gpt-4o-mini", json!({"wrong_field": 1}))
            .await
            .unwrap_err();

        assert!(matches!(error, TrackerError::Validation(_)));
        tracker.close().await.unwrap();
    }

    /// Tracker-wide defaults apply when a call omits the fields.
    #[tokio::test]
    async fn test_defaults_applied() {
        let server = server_with_queued_response().await;
        let tracker = builder_for(&server).build().await.unwrap();
        tracker.set_customer_key("acme");

        tracker
            .track("openai::gpt-4o-mini", json!({"input_tokens": 1}))
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["records"][0]["customer_key"], "acme");

        tracker.close().await.unwrap();
    }

    /// Batch results come back per record, in input order.
    #[tokio::test]
    async fn test_track_batch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/track"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [
                    {"response_id": "a", "status": "queued"},
                    {"response_id": "b", "status": "service_key_unknown"}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let tracker = builder_for(&server).build().await.unwrap();
        let results = tracker
            .track_batch(vec![
                TrackInput {
                    service_key: "openai::gpt-4o-mini".to_string(),
                    usage: json!({"input_tokens": 1}),
                    options: TrackOptions {
                        response_id: Some("a".to_string()),
                        ..TrackOptions::default()
                    },
                },
                TrackInput {
                    service_key: "unknown::x".to_string(),
                    usage: json!({"input_tokens": 2}),
                    options: TrackOptions {
                        response_id: Some("b".to_string()),
                        ..TrackOptions::default()
                    },
                },
            ])
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].status, TrackStatus::Queued);
        assert_eq!(results[1].status, TrackStatus::ServiceKeyUnknown);

        tracker.close().await.unwrap();
    }
}

mod limits {
    use super::*;
    use aicm_core::limits::ThresholdType;

    /// A cached LIMIT raises after the record has been sent.
    #[tokio::test]
    async fn test_limit_raises_after_send() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/track"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{"response_id": "r2", "status": "queued"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        // Seed the store with a limit scoped to this api key id.
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("aicm.ini");
        let seed = aicm_core::limits::TriggeredLimitsCache::new(Some(
            aicm_core::config_store::ConfigStore::new(&config_path),
        ));
        seed.replace_all(vec![TriggeredLimit {
            limit_id: "L1".to_string(),
            threshold_type: ThresholdType::Limit,
            amount: 50.0,
            period: "month".to_string(),
            api_key_id: "k1".to_string(),
            service_key: Some("openai::gpt-4o-mini".to_string()),
            customer_key: None,
            config_id_list: Vec::new(),
            hostname: "api.example.com".to_string(),
            expires_at: None,
        }])
        .unwrap();

        let tracker = Tracker::builder()
            .api_key("aicm-k1-secret")
            .api_base(server.uri())
            .config_path(&config_path)
            .overrides(SettingsOverrides {
                api_key: Some("aicm-k1-secret".to_string()),
                api_base: Some(server.uri()),
                limits_enabled: Some(true),
                ..SettingsOverrides::default()
            })
            .build()
            .await
            .unwrap();

        let error = tracker
            .track_with(
                "openai::gpt-4o-mini",
                json!({"input_tokens": 1}),
                TrackOptions {
                    response_id: Some("r2".to_string()),
                    ..TrackOptions::default()
                },
            )
            .await
            .unwrap_err();

        match &error {
            TrackerError::LimitExceeded { limit_id, .. } => assert_eq!(limit_id, "L1"),
            other => panic!("expected limit error, got {:?}", other),
        }
        assert!(error.record_was_accepted());

        // The mock's expect(1) verifies the record was sent regardless.
        tracker.close().await.unwrap();
    }

    /// Limits returned in a response are visible to later checks.
    #[tokio::test]
    async fn test_response_limits_cached() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/track"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{"response_id": "r1", "status": "queued"}],
                "triggered_limits": [
                    {"limit_id": "W1", "threshold_type": "WARNING", "api_key_id": "k1"}
                ]
            })))
            .mount(&server)
            .await;

        let tracker = builder_for(&server).build().await.unwrap();
        assert!(tracker.triggered_limits().is_empty());

        tracker
            .track("openai::gpt-4o-mini", json!({"input_tokens": 1}))
            .await
            .unwrap();

        let cached = tracker.triggered_limits();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].limit_id, "W1");

        tracker.close().await.unwrap();
    }
}

mod lifecycle {
    use super::*;

    /// Operations on a closed tracker fail with Closed; close is
    /// idempotent.
    #[tokio::test]
    async fn test_closed_semantics() {
        let server = server_with_queued_response().await;
        let tracker = builder_for(&server).build().await.unwrap();

        tracker.close().await.unwrap();
        tracker.close().await.unwrap();

        let error = tracker
            .track("openai::gpt-4o-mini", json!({"input_tokens": 1}))
            .await
            .unwrap_err();
        assert!(matches!(error, TrackerError::Closed));

        let error = tracker.flush(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(error, TrackerError::Closed));
    }

    /// Clones share the same strategy and close together.
    #[tokio::test]
    async fn test_clones_share_state() {
        let server = server_with_queued_response().await;
        let tracker = builder_for(&server).build().await.unwrap();
        let clone = tracker.clone();

        tracker.close().await.unwrap();

        let error = clone
            .track("openai::gpt-4o-mini", json!({"input_tokens": 1}))
            .await
            .unwrap_err();
        assert!(matches!(error, TrackerError::Closed));
    }

    /// The memory-queue strategy delivers in the background and drains
    /// on close.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_mem_queue_end_to_end() {
        let server = server_with_queued_response().await;
        let tracker = builder_for(&server)
            .overrides(SettingsOverrides {
                api_key: Some("aicm-k1-secret".to_string()),
                api_base: Some(server.uri()),
                delivery_type: Some(DeliveryType::MemQueue),
                batch_interval: Some(Duration::from_millis(10)),
                ..SettingsOverrides::default()
            })
            .build()
            .await
            .unwrap();

        let result = tracker
            .track("openai::gpt-4o-mini", json!({"input_tokens": 1}))
            .await
            .unwrap();
        assert_eq!(result.status, TrackStatus::Queued);

        tracker.close().await.unwrap();
        assert_eq!(tracker.metrics().delivered, 1);
        assert!(!server.received_requests().await.unwrap().is_empty());
    }
}
