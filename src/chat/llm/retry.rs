//! Retry decisions for completion calls.
//!
//! Classification is a pure function of the error so every retry/no-retry
//! rule can be checked without a network.

use std::time::Duration;

use crate::error::LlmError;

/// Longest pause between two attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Transient: another attempt may succeed.
    Retry,
    /// Surface to the caller now.
    Fail,
}

/// Classify a failed attempt.
///
/// Server errors and network failures are transient. Timeouts are not
/// retried: the remote call may still be running and billing.
pub fn classify(error: &LlmError) -> Disposition {
    match error {
        LlmError::Upstream { status, .. } if (500..600).contains(status) => Disposition::Retry,
        LlmError::Transport(_) => Disposition::Retry,
        LlmError::Upstream { .. } | LlmError::Timeout(_) | LlmError::MalformedResponse(_) => {
            Disposition::Fail
        }
    }
}

/// Attempt budget and pacing.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self { max_retries, backoff }
    }

    /// Total attempts allowed, first one included.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Decide whether attempt number `attempt` (1-based) should be followed by another.
    pub fn next(&self, error: &LlmError, attempt: u32) -> Disposition {
        if attempt >= self.max_attempts() {
            return Disposition::Fail;
        }
        classify(error)
    }

    /// Pause before retry number `retry` (1-based): `backoff * 2^(retry-1)`, capped.
    pub fn delay(&self, retry: u32) -> Duration {
        if self.backoff.is_zero() {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }
}
