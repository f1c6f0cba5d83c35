//! Retry classification and backoff timing
//!
//! Failed attempts are not retried in a loop here. Instead, the worker parks the
//! upload as `WaitingToRetry` and the orchestrator re-evaluates it against
//! [`restart_time`] on later passes, so a retry survives a process restart.
//!
//! # Example
//!
//! ```
//! use upload_queue::config::RetryConfig;
//! use upload_queue::retry::backoff_delay;
//! use std::time::Duration;
//!
//! let config = RetryConfig { jitter: false, ..RetryConfig::default() };
//! assert_eq!(backoff_delay(1, 0, &config), Duration::from_secs(5));
//! assert_eq!(backoff_delay(3, 0, &config), Duration::from_secs(20));
//! ```

use crate::config::RetryConfig;
use crate::error::TransferError;
use crate::types::{TaskId, TaskRecord};
use chrono::{DateTime, Utc};
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (server errors, broken connections, interrupted attempts) should return `true`.
/// Permanent failures (missing file, rejected request, malformed URL) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for TransferError {
    fn is_retryable(&self) -> bool {
        match self {
            // Server-side trouble is transient
            TransferError::HttpStatus { code, .. } => (500..600).contains(code),
            // Connection dropped or the body could not be streamed
            TransferError::Data(_) => true,
            // Stopped mid-Running by shutdown
            TransferError::Interrupted => true,
            // Parked in a waiting state instead, never counted
            TransferError::NetworkUnavailable(_) => false,
            TransferError::InvalidUrl(_)
            | TransferError::FileNotFound(_)
            | TransferError::Canceled
            | TransferError::Other(_) => false,
        }
    }
}

/// Epoch millis (UTC) of `now`
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Backoff delay after `num_failed` consecutive failures
///
/// `first_delay × (1000 + jitter_permille) / 1000 × 2^(num_failed − 1)`, capped at
/// `config.max_delay`. `jitter_permille` is in `0..=1000`.
pub fn backoff_delay(num_failed: u32, jitter_permille: u32, config: &RetryConfig) -> Duration {
    if num_failed == 0 {
        return Duration::ZERO;
    }

    let base_ms = config.first_delay.as_millis();
    let scaled = base_ms * u128::from(1000 + jitter_permille.min(1000)) / 1000;
    let factor = 1u128.checked_shl(num_failed - 1).unwrap_or(u128::MAX);
    let delay_ms = scaled.saturating_mul(factor);

    let cap_ms = config.max_delay.as_millis();
    let delay_ms = delay_ms.min(cap_ms);
    Duration::from_millis(u64::try_from(delay_ms).unwrap_or(u64::MAX))
}

/// Jitter term in `0..=1000` for one failure generation of one upload
///
/// Seeded from the id and failure count so every reconciliation pass sees the
/// same restart time for the same attempt.
pub fn jitter_permille(id: TaskId, num_failed: u32, config: &RetryConfig) -> u32 {
    if !config.jitter {
        return 0;
    }
    let seed = (id.0 as u64).rotate_left(32) ^ u64::from(num_failed);
    let mut rng = StdRng::seed_from_u64(seed);
    rng.gen_range(0..=1000)
}

/// Epoch millis at which a waiting upload may be attempted again
///
/// - no failures: `now`
/// - a server-supplied Retry-After: last change + that many seconds
/// - otherwise: last change + [`backoff_delay`]
pub fn restart_time(record: &TaskRecord, now_ms: i64, config: &RetryConfig) -> i64 {
    if record.num_failed == 0 {
        return now_ms;
    }
    if record.retry_after_seconds > 0 {
        return record
            .last_modified_at_millis
            .saturating_add(i64::from(record.retry_after_seconds) * 1000);
    }
    let jitter = jitter_permille(record.id, record.num_failed, config);
    let delay = backoff_delay(record.num_failed, jitter, config);
    record
        .last_modified_at_millis
        .saturating_add(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX))
}

/// Parse a `Retry-After` header value
///
/// Accepts delta-seconds and HTTP-dates. Dates in the past yield zero.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = at.with_timezone(&Utc) - now;
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

/// Clamp a server-supplied delay into `[min_retry_after, max_retry_after]`
pub fn clamp_retry_after(delay: Duration, config: &RetryConfig) -> Duration {
    delay.clamp(config.min_retry_after, config.max_retry_after)
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Control, Status, Visibility};
    use chrono::TimeZone;

    fn no_jitter() -> RetryConfig {
        RetryConfig {
            jitter: false,
            ..RetryConfig::default()
        }
    }

    fn waiting(num_failed: u32, retry_after_seconds: u32) -> TaskRecord {
        TaskRecord {
            id: TaskId(9),
            target_url: "https://example.com".to_string(),
            file_reference: "/tmp/x".to_string(),
            mime_type: None,
            title: None,
            description: None,
            user_agent: None,
            field_name: None,
            status: Status::WaitingToRetry,
            num_failed,
            retry_after_seconds,
            total_bytes: -1,
            current_bytes: 0,
            last_modified_at_millis: 1_000_000,
            created_at_millis: 0,
            visibility: Visibility::Visible,
            control: Control::Run,
            allow_roaming: true,
            allow_metered: true,
            deleted: false,
            server_response: None,
            error_message: None,
            request_headers: Vec::new(),
            form_fields: Vec::new(),
        }
    }

    #[test]
    fn transient_http_statuses_are_retryable() {
        let status = |code| TransferError::HttpStatus {
            code,
            reason: String::new(),
            retry_after: None,
        };
        assert!(status(500).is_retryable());
        assert!(status(503).is_retryable());
        assert!(!status(404).is_retryable());
        assert!(!status(301).is_retryable());
        assert!(TransferError::Data("reset".into()).is_retryable());
        assert!(TransferError::Interrupted.is_retryable());
        assert!(!TransferError::FileNotFound("x".into()).is_retryable());
        assert!(!TransferError::InvalidUrl("x".into()).is_retryable());
        assert!(!TransferError::Canceled.is_retryable());
        assert!(!TransferError::Other("boom".into()).is_retryable());
    }

    #[test]
    fn backoff_doubles_per_failure() {
        let config = no_jitter();
        assert_eq!(backoff_delay(0, 0, &config), Duration::ZERO);
        assert_eq!(backoff_delay(1, 0, &config), Duration::from_secs(5));
        assert_eq!(backoff_delay(2, 0, &config), Duration::from_secs(10));
        assert_eq!(backoff_delay(4, 0, &config), Duration::from_secs(40));
    }

    #[test]
    fn jitter_scales_between_one_and_two() {
        let config = RetryConfig::default();
        assert_eq!(backoff_delay(1, 1000, &config), Duration::from_secs(10));
        assert_eq!(backoff_delay(1, 500, &config), Duration::from_millis(7500));
        // Out-of-range jitter is clamped
        assert_eq!(backoff_delay(1, 5000, &config), Duration::from_secs(10));
    }

    #[test]
    fn backoff_is_capped() {
        let config = no_jitter();
        assert_eq!(backoff_delay(40, 0, &config), config.max_delay);
        assert_eq!(backoff_delay(200, 1000, &config), config.max_delay);
    }

    #[test]
    fn restart_delay_strictly_increases_with_failures() {
        let config = no_jitter();
        let mut previous = i64::MIN;
        for n in 1..=8 {
            let at = restart_time(&waiting(n, 0), 0, &config);
            assert!(at > previous, "failure {n} did not increase the delay");
            previous = at;
        }
    }

    #[test]
    fn jitter_is_stable_per_generation() {
        let config = RetryConfig::default();
        let a = jitter_permille(TaskId(4), 2, &config);
        let b = jitter_permille(TaskId(4), 2, &config);
        assert_eq!(a, b);
        assert!(a <= 1000);
        assert_eq!(jitter_permille(TaskId(4), 2, &no_jitter()), 0);
    }

    #[test]
    fn zero_failures_restart_now() {
        let record = waiting(0, 0);
        assert_eq!(restart_time(&record, 123, &RetryConfig::default()), 123);
    }

    #[test]
    fn retry_after_overrides_backoff() {
        let record = waiting(3, 60);
        assert_eq!(
            restart_time(&record, 0, &RetryConfig::default()),
            1_000_000 + 60_000
        );
    }

    #[test]
    fn parses_retry_after_forms() {
        let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 28, 0).unwrap();
        assert_eq!(
            parse_retry_after("120", now),
            Some(Duration::from_secs(120))
        );
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:30:00 GMT", now),
            Some(Duration::from_secs(120))
        );
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:00:00 GMT", now),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[test]
    fn retry_after_is_clamped() {
        let config = RetryConfig::default();
        assert_eq!(
            clamp_retry_after(Duration::from_secs(1), &config),
            Duration::from_secs(30)
        );
        assert_eq!(
            clamp_retry_after(Duration::from_secs(90), &config),
            Duration::from_secs(90)
        );
        assert_eq!(
            clamp_retry_after(Duration::from_secs(10 * 24 * 3600), &config),
            Duration::from_secs(24 * 3600)
        );
    }
}
