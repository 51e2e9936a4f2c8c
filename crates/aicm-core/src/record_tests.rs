//! Tests for usage record construction and wire serialization.

use super::*;
use crate::schema::{FieldType, SchemaRegistry, UsageSchema};
use serde_json::json;

fn no_schemas() -> SchemaRegistry {
    SchemaRegistry::new()
}

mod builder {
    use super::*;

    /// Defaults are filled in: UUIDv4 response id, current UTC timestamp.
    #[test]
    fn test_defaults_filled() {
        let before = Utc::now();
        let record = UsageRecord::builder("openai::gpt-4o-mini", json!({"input_tokens": 10}))
            .build(&no_schemas())
            .unwrap();
        let after = Utc::now();

        assert_eq!(record.response_id().as_str().len(), 36);
        assert!(record.timestamp() >= before && record.timestamp() <= after);
        assert_eq!(record.customer_key(), None);
        assert!(record.context().is_none());
    }

    /// Explicit fields are preserved verbatim.
    #[test]
    fn test_explicit_fields_preserved() {
        let timestamp = "2025-03-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let mut context = std::collections::BTreeMap::new();
        context.insert("env".to_string(), json!("prod"));

        let record = UsageRecord::builder(
            "anthropic::claude-sonnet",
            json!({"input_tokens": 5, "output_tokens": 7}),
        )
        .with_response_id("r-42")
        .with_timestamp(timestamp)
        .with_customer_key("acme")
        .with_context(context)
        .with_api_id("anthropic")
        .build(&no_schemas())
        .unwrap();

        assert_eq!(record.response_id().as_str(), "r-42");
        assert_eq!(record.timestamp(), timestamp);
        assert_eq!(record.customer_key(), Some("acme"));
        assert_eq!(record.api_id(), Some("anthropic"));
        assert_eq!(record.usage().get("output_tokens"), Some(&json!(7)));
    }

    /// A non-object usage payload is rejected.
    #[test]
    fn test_non_object_usage_rejected() {
        let result = UsageRecord::builder("openai::gpt-4o-mini", json!(42)).build(&no_schemas());

        assert!(matches!(
            result,
            Err(ValidationError::InvalidFormat { field, .. }) if field == "usage"
        ));
    }

    /// An invalid service key is rejected before any schema runs.
    #[test]
    fn test_invalid_service_key_rejected() {
        let result = UsageRecord::builder("", json!({})).build(&no_schemas());
        assert!(result.is_err());
    }

    /// Schema validation failures propagate with field lists intact.
    #[test]
    fn test_schema_failure_propagates() {
        let schemas = SchemaRegistry::new().with_schema(
            "openai::*",
            UsageSchema::new()
                .require("input_tokens", FieldType::Integer)
                .closed(),
        );

        let result = UsageRecord::builder("openai::gpt-4o-mini", json!({"bogus": 1}))
            .build(&schemas);

        match result {
            Err(ValidationError::Schema(e)) => {
                assert_eq!(e.missing, vec!["input_tokens"]);
                assert_eq!(e.extra, vec!["bogus"]);
            }
            other => panic!("expected schema error, got {:?}", other),
        }
    }
}

mod wire {
    use super::*;

    /// Nested usage objects serialize with sorted keys.
    #[test]
    fn test_nested_keys_sorted() {
        let record = UsageRecord::builder(
            "gemini::flash",
            json!({"modalities": {"video": 1, "audio": 2, "image": 3}}),
        )
        .build(&no_schemas())
        .unwrap();

        let wire = record.to_wire();
        let keys: Vec<&String> = wire["usage"]["modalities"]
            .as_object()
            .unwrap()
            .keys()
            .collect();
        assert_eq!(keys, vec!["audio", "image", "video"]);
    }

    /// Values nested beyond the depth bound are replaced with the marker.
    #[test]
    fn test_depth_bounded() {
        let mut deep = json!("leaf");
        for _ in 0..(MAX_VALUE_DEPTH + 3) {
            deep = json!({ "next": deep });
        }

        let record = UsageRecord::builder("svc::deep", json!({ "chain": deep }))
            .build(&no_schemas())
            .unwrap();
        let wire = serde_json::to_string(&record.to_wire()).unwrap();

        assert!(wire.contains(DEPTH_MARKER));
        assert!(!wire.contains("leaf"));
    }

    /// Optional fields are omitted from the wire form when unset.
    #[test]
    fn test_optional_fields_omitted() {
        let record = UsageRecord::builder("openai::gpt-4o-mini", json!({"input_tokens": 1}))
            .build(&no_schemas())
            .unwrap();

        let wire = record.to_wire();
        let object = wire.as_object().unwrap();
        assert!(!object.contains_key("customer_key"));
        assert!(!object.contains_key("context"));
        assert!(!object.contains_key("api_id"));
        assert!(object.contains_key("timestamp"));
    }

    /// to_wire(from_wire(x)) == x for a fully-populated record.
    #[test]
    fn test_wire_round_trip() {
        let mut context = std::collections::BTreeMap::new();
        context.insert("run".to_string(), json!({"id": 7, "tags": ["a", "b"]}));

        let original = UsageRecord::builder(
            "openai::gpt-4o-mini",
            json!({"input_tokens": 10, "output_tokens": 20}),
        )
        .with_response_id("r1")
        .with_customer_key("acme")
        .with_context(context)
        .build(&no_schemas())
        .unwrap();

        let wire = original.to_wire();
        let reparsed = UsageRecord::from_wire(wire.clone()).unwrap();

        assert_eq!(reparsed, original);
        assert_eq!(reparsed.to_wire(), wire);
    }

    /// Serialization of the same record twice is byte-identical.
    #[test]
    fn test_deterministic() {
        let record = UsageRecord::builder(
            "openai::gpt-4o-mini",
            json!({"b": 1, "a": {"z": 1, "y": 2}}),
        )
        .build(&no_schemas())
        .unwrap();

        let first = serde_json::to_string(&record.to_wire()).unwrap();
        let second = serde_json::to_string(&record.to_wire()).unwrap();
        assert_eq!(first, second);
    }
}
