use std::time::{Duration, Instant};

use crate::error::{CacheError, Result};
use crate::{CancelToken, LOG_TARGET};

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Bounded exponential backoff for idempotent remote reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each further attempt.
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// A single attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
        }
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// Only [`CacheError::is_transient`] failures are retried. Cancellation is
    /// observed before every attempt and during backoff.
    pub fn run<T>(
        &self,
        operation: &str,
        cancel: &CancelToken,
        mut op: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        let mut attempt = 1u32;
        let mut backoff = self.initial_backoff;
        loop {
            if cancel.is_cancelled() {
                return Err(CacheError::Cancelled);
            }
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_attempts.max(1) => {
                    tracing::debug!(
                        target: LOG_TARGET,
                        operation,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "transient remote failure; retrying"
                    );
                    sleep_cancellable(backoff, cancel)?;
                    attempt += 1;
                    backoff = backoff.saturating_mul(2);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn sleep_cancellable(duration: Duration, cancel: &CancelToken) -> Result<()> {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        std::thread::sleep((deadline - now).min(CANCEL_POLL_INTERVAL));
    }
}
