//! Exponential backoff retry policy for the tracking API.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;

/// Retry policy for transient transport errors.
///
/// Controls the in-call retry loop of one delivery try: up to
/// `max_attempts` HTTP attempts with exponential backoff between them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of HTTP attempts within one delivery try
    pub max_attempts: u32,

    /// Delay before the second attempt
    pub initial_delay: Duration,

    /// Maximum delay between attempts
    pub max_delay: Duration,

    /// Backoff multiplier (e.g. 2.0 for doubling)
    pub backoff_multiplier: f64,

    /// Whether to add jitter to delays
    pub use_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with a custom attempt budget
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Disable jitter (no random variation) in retry delays.
    ///
    /// Use this for deterministic testing or when precise timing is
    /// required.
    pub fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }

    /// Calculate the delay before retry number `attempt` (1-indexed).
    ///
    /// Uses exponential backoff capped at `max_delay`; jitter, when
    /// enabled, randomizes the result by ±20% to avoid thundering-herd
    /// retries from many embedded trackers at once.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::from_secs(0);
        }

        let multiplier = self.backoff_multiplier.powi(attempt as i32 - 1);
        let delay_ms = (self.initial_delay.as_millis() as f64 * multiplier) as u64;
        let mut delay = Duration::from_millis(delay_ms);

        if delay > self.max_delay {
            delay = self.max_delay;
        }

        if self.use_jitter {
            use rand::RngExt;
            let jitter_factor = rand::rng().random_range(0.8..=1.2);
            delay = Duration::from_millis((delay.as_millis() as f64 * jitter_factor) as u64);
        }

        delay
    }

    /// Check if another attempt should be made after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Parse a `Retry-After` header value.
///
/// Accepts both delta-seconds (`"60"`) and HTTP-date (RFC 7231) forms;
/// returns `None` for anything unparseable or already in the past.
pub fn parse_retry_after(retry_after: &str) -> Option<Duration> {
    if let Ok(seconds) = retry_after.trim().parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    if let Ok(date_time) = chrono::DateTime::parse_from_rfc2822(retry_after) {
        let now = Utc::now();
        let retry_time = date_time.with_timezone(&Utc);

        if retry_time > now {
            let duration = (retry_time - now).num_seconds();
            if duration > 0 {
                return Some(Duration::from_secs(duration as u64));
            }
        }
    }

    None
}
