/**
 * Retry policy for flaky external-tool calls
 */

use log::warn;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    None,
    Fixed { ms: u64 },
    Exponential { base_ms: u64, max_ms: u64 },
}

impl Backoff {
    /// Delay before retry number `attempt` (1 = first retry)
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed { ms } => Duration::from_millis(ms),
            Backoff::Exponential { base_ms, max_ms } => {
                let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
                Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
            }
        }
    }
}

/// How many times to try, how long to wait, and which errors qualify
pub struct RetryPolicy<E> {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub retryable: fn(&E) -> bool,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            retryable: self.retryable,
        }
    }
}

impl<E> std::fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl<E> RetryPolicy<E> {
    pub fn new(max_attempts: u32, backoff: Backoff, retryable: fn(&E) -> bool) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            retryable,
        }
    }

    /// Single attempt, no retries
    pub fn never() -> Self {
        Self::new(1, Backoff::None, |_| false)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or runs out of attempts
pub fn call_with_retry<T, E, F>(policy: &RetryPolicy<E>, mut op: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Result<T, E>,
{
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_attempts && (policy.retryable)(&e) => {
                let delay = policy.backoff.delay(attempt);
                warn!(
                    "Attempt {}/{} failed: {}; retrying in {:?}",
                    attempt, policy.max_attempts, e, delay
                );
                thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
