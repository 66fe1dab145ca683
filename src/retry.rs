//! Bounded retry-with-backoff around calls to external services.

use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::error::Result;

/// How many times a transient failure is retried and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first call (minimum 1).
    pub max_attempts: usize,
    /// Delay before the first retry; doubles on each subsequent retry.
    pub base_backoff: Duration,
    /// Upper bound for a single delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// A policy that retries without sleeping, for tests and stubs.
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay to wait before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: usize) -> Duration {
        let capped = attempt.saturating_sub(1).min(16) as u32;
        self.base_backoff
            .saturating_mul(1u32 << capped)
            .min(self.max_backoff)
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or attempts run out.
    ///
    /// Returns the value together with the number of retries that were needed.
    pub fn run<T, F>(&self, label: &str, mut op: F) -> Result<(T, usize)>
    where
        F: FnMut() -> Result<T>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0usize;
        loop {
            match op() {
                Ok(value) => return Ok((value, attempt)),
                Err(err) if err.is_retryable() && attempt + 1 < max_attempts => {
                    attempt += 1;
                    let delay = self.backoff(attempt);
                    warn!(
                        operation = label,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}
