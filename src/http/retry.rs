//! Retry classification and jittered backoff.
//!
//! Maps response statuses and failure kinds onto a `RetryKind`, and decides how
//! long to wait between attempts.

use crate::error::{HttpErrorKind, RetryKind, TransportCode};
use rand::Rng;
use std::time::Duration;

/// Retry strategy configuration
#[derive(Debug, Clone, Copy)]
pub struct RetryStrategy {
    /// Extra attempts per region after the first one
    pub max_retries: usize,
    /// Upper bound of the delay between attempts
    pub base_delay: Duration,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryStrategy {
    pub fn new(max_retries: usize, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Whether another attempt is allowed after `attempt` (zero based) failed
    pub fn should_retry(&self, attempt: usize, retry_kind: RetryKind) -> bool {
        // Never retry what cannot succeed
        if retry_kind == RetryKind::Unretryable {
            return false;
        }

        attempt < self.max_retries
    }

    /// Uniformly random delay in [50%, 100%] of the base delay
    pub fn jittered_delay(&self) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        if base == 0 {
            return Duration::ZERO;
        }
        let millis = rand::thread_rng().gen_range(base / 2..=base);
        Duration::from_millis(millis)
    }
}

/// Classify a non-2xx response status
pub fn classify_status(status: u16) -> RetryKind {
    match status {
        200..=299 => RetryKind::Retryable,
        300..=399 => RetryKind::HostUnretryable,
        406 | 408 | 429 | 500 | 509 | 573 | 599 => RetryKind::Retryable,
        502 | 503 | 504 => RetryKind::HostUnretryable,
        _ => RetryKind::Unretryable,
    }
}

/// Classify a failure kind, whether it came from the HTTP client or from a hook
pub fn classify_error_kind(kind: &HttpErrorKind) -> RetryKind {
    match kind {
        HttpErrorKind::Io(_) | HttpErrorKind::Os { .. } => RetryKind::Unretryable,
        HttpErrorKind::UserCancelled(_) => RetryKind::Unretryable,
        HttpErrorKind::UnexpectedRedirect { .. } => RetryKind::HostUnretryable,
        HttpErrorKind::Json(_) => RetryKind::Retryable,
        HttpErrorKind::ResponseStatusCode { status, .. } => classify_status(*status),
        HttpErrorKind::Transport { code, .. } => match code {
            TransportCode::Connect => RetryKind::HostUnretryable,
            TransportCode::Builder => RetryKind::Unretryable,
            TransportCode::Timeout
            | TransportCode::LowSpeed
            | TransportCode::Request
            | TransportCode::Body
            | TransportCode::Decode
            | TransportCode::Other => RetryKind::Retryable,
        },
    }
}
