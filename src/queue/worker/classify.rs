//! Mapping an attempt outcome to the upload's next durable status

use super::super::controller::StopReason;
use crate::config::RetryConfig;
use crate::error::TransferError;
use crate::retry::{IsRetryable, clamp_retry_after, parse_retry_after};
use crate::transport::TransportResponse;
use crate::types::{NetworkInfo, Status};
use chrono::Utc;
use std::time::Duration;

/// Facts about the attempt that feed the retry decision
#[derive(Debug, Clone, Copy)]
pub(crate) struct AttemptFacts {
    /// Consecutive failures before this attempt
    pub num_failed: u32,
    /// Whether any byte was sent in this attempt
    pub made_progress: bool,
    /// Network when the attempt started
    pub baseline: NetworkInfo,
    /// Network when the attempt ended
    pub current: NetworkInfo,
}

/// The status fields an attempt writes back
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Verdict {
    pub status: Status,
    pub num_failed: u32,
    pub retry_after_seconds: u32,
    pub error_message: Option<String>,
    pub server_response: Option<String>,
}

impl Verdict {
    fn new(status: Status, facts: &AttemptFacts) -> Self {
        Self {
            status,
            num_failed: facts.num_failed,
            retry_after_seconds: 0,
            error_message: None,
            server_response: None,
        }
    }

    fn failed(status: Status, facts: &AttemptFacts, error: &TransferError) -> Self {
        Self {
            error_message: Some(error.to_string()),
            ..Self::new(status, facts)
        }
    }
}

/// Turn a non-2xx response into a transfer error
///
/// Only a 503 honors `Retry-After`; the value is clamped to the configured range.
pub(crate) fn response_error(response: &TransportResponse, retry: &RetryConfig) -> TransferError {
    let retry_after = if response.status == 503 {
        response
            .retry_after
            .as_deref()
            .and_then(|value| parse_retry_after(value, Utc::now()))
            .map(|delay| clamp_retry_after(delay, retry))
    } else {
        None
    };
    TransferError::HttpStatus {
        code: response.status,
        reason: response.reason.clone(),
        retry_after,
    }
}

/// Decide the outcome of an attempt
///
/// A cancel always wins, even over a success that raced it. A pause turns any
/// other outcome back into `Pending`.
pub(crate) fn classify(
    outcome: &Result<TransportResponse, TransferError>,
    stop: Option<StopReason>,
    facts: &AttemptFacts,
    retry: &RetryConfig,
) -> Verdict {
    if stop == Some(StopReason::Canceled) {
        return Verdict::failed(Status::Canceled, facts, &TransferError::Canceled);
    }

    let error = match outcome {
        Ok(response) if response.is_success() => {
            return Verdict {
                server_response: Some(response.body.clone()),
                ..Verdict::new(Status::Success, facts)
            };
        }
        Ok(response) => response_error(response, retry),
        Err(e) => e.clone(),
    };

    if stop == Some(StopReason::Paused) {
        return Verdict::new(Status::Pending, facts);
    }

    match &error {
        TransferError::FileNotFound(_) => Verdict::failed(Status::FileNotFound, facts, &error),
        TransferError::NetworkUnavailable(state) => {
            Verdict::failed(state.waiting_status(), facts, &error)
        }
        TransferError::Canceled => Verdict::failed(Status::Canceled, facts, &error),
        e if e.is_retryable() => retry_verdict(&error, facts, retry),
        TransferError::InvalidUrl(_) | TransferError::HttpStatus { .. } => {
            Verdict::failed(Status::CannotResume, facts, &error)
        }
        _ => Verdict::failed(Status::UnknownError, facts, &error),
    }
}

fn retry_verdict(error: &TransferError, facts: &AttemptFacts, retry: &RetryConfig) -> Verdict {
    // Progress in this attempt restarts the count
    let num_failed = if facts.made_progress {
        1
    } else {
        facts.num_failed.saturating_add(1)
    };

    if num_failed >= retry.max_retries {
        return Verdict {
            num_failed,
            ..Verdict::failed(Status::CannotResume, facts, error)
        };
    }

    let same_network = facts.current.connected && facts.current.kind == facts.baseline.kind;
    let status = if same_network {
        Status::WaitingToRetry
    } else {
        Status::WaitingForNetwork
    };

    let retry_after_seconds = match error {
        TransferError::HttpStatus {
            retry_after: Some(delay),
            ..
        } => u32::try_from(delay.as_secs()).unwrap_or(u32::MAX).max(1),
        _ => 0,
    };

    Verdict {
        num_failed,
        retry_after_seconds,
        ..Verdict::failed(status, facts, error)
    }
}

/// Wait implied by a verdict, for logging
pub(crate) fn retry_hint(verdict: &Verdict) -> Option<Duration> {
    (verdict.retry_after_seconds > 0).then(|| Duration::from_secs(u64::from(verdict.retry_after_seconds)))
}
