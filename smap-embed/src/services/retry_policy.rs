//! Retry policy for searches and source fetches
//!
//! Linear backoff: the delay before retry `n` (1-based) is
//! `initial_delay + (n - 1) * delay_step`, capped at `max_delay`.

use crate::config::{ResolverConfig, RetrievalConfig};
use crate::error::Retryable;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Bounded retry with linear backoff
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, first one included
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub delay_step: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(config: &RetrievalConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            delay_step: Duration::from_millis(config.delay_step_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Search retries: a fixed step per retry, no separate cap
    pub fn for_search(config: &ResolverConfig) -> Self {
        let max_attempts = config.search_max_attempts.max(1);
        let step = Duration::from_millis(config.search_retry_delay_ms);
        Self {
            max_attempts,
            initial_delay: step,
            delay_step: step,
            max_delay: step.saturating_mul(max_attempts),
        }
    }

    /// Policy with no waiting between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::ZERO,
            delay_step: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before the retry that follows `attempts_made` failed attempts
    pub fn delay_after(&self, attempts_made: u32) -> Duration {
        let step = self.delay_step.saturating_mul(attempts_made.saturating_sub(1));
        self.initial_delay.saturating_add(step).min(self.max_delay)
    }

    /// Whether to try again after `attempts_made` attempts ending in `error`
    pub fn should_retry<E: Retryable>(&self, error: &E, attempts_made: u32) -> bool {
        error.is_retryable() && attempts_made < self.max_attempts
    }

    /// Run `operation` until it succeeds, fails permanently, or attempts run out
    ///
    /// Non-retryable errors are returned as-is after one attempt. When every
    /// attempt fails with a retryable error the last one goes through
    /// [`Retryable::exhausted`].
    pub async fn run<F, Fut, T, E>(&self, operation_name: &str, mut operation: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable,
    {
        let start = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if attempt > 1 {
                debug!(operation = operation_name, attempt, "Retrying");
            }

            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(
                            operation = operation_name,
                            attempt,
                            elapsed_ms = start.elapsed().as_millis() as u64,
                            "Succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(err) if self.should_retry(&err, attempt) => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        operation = operation_name,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Attempt failed, will retry"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) if err.is_retryable() => {
                    error!(
                        operation = operation_name,
                        attempts = attempt,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        error = %err,
                        "Giving up after max attempts"
                    );
                    return Err(err.exhausted(attempt));
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetrievalConfig::default())
    }
}
