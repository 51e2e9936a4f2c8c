//! Tests for transport error classification.

use super::*;

mod transience {
    use super::*;

    /// Server errors and rate limiting are retryable.
    #[test]
    fn test_transient_variants() {
        let http = TransportError::Http {
            status: 503,
            message: "service unavailable".to_string(),
        };
        let rate_limited = TransportError::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
        };

        assert!(http.is_transient());
        assert!(http.should_retry());
        assert!(rate_limited.is_transient());
        assert!(TransportError::Timeout.is_transient());
    }

    /// Structured rejections and parse failures are final.
    #[test]
    fn test_permanent_variants() {
        let rejected = TransportError::Rejected {
            status: 422,
            detail: "unknown field".to_string(),
            code: Some("invalid_usage".to_string()),
        };
        let json = TransportError::Json(
            serde_json::from_str::<serde_json::Value>("not json").unwrap_err(),
        );

        assert!(!rejected.is_transient());
        assert!(!json.is_transient());
        assert!(!TransportError::InvalidUrl("::".to_string()).is_transient());
    }

    /// Only rate limiting carries a server-mandated delay.
    #[test]
    fn test_retry_after() {
        let rate_limited = TransportError::RateLimited {
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(rate_limited.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(TransportError::Timeout.retry_after(), None);
    }
}
