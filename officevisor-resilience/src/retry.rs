//! Retry policy and executor

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace};

/// Poll at a fixed interval until an overall time budget is spent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay between two attempts
    pub interval: Duration,

    /// Total time budget measured from the first attempt
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Trait for errors that can be retried
pub trait Retryable {
    /// Whether this error is a transient condition worth another attempt
    fn is_retryable(&self) -> bool;
}

/// Tracks the budget of a hand-written retry loop.
///
/// Used where the attempt needs mutable access to its surroundings and so
/// cannot be expressed as a closure for [`RetryExecutor`].
#[derive(Debug)]
pub struct RetryTimer {
    policy: RetryPolicy,
    started: Instant,
    attempts: u32,
}

impl RetryTimer {
    /// Start the clock
    pub fn start(policy: RetryPolicy) -> Self {
        Self {
            policy,
            started: Instant::now(),
            attempts: 1,
        }
    }

    /// Attempts made so far, counting the one in progress
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Sleep until the next attempt is due.
    ///
    /// Returns `false` without sleeping once the budget is spent. The sleep
    /// never extends past the deadline.
    pub async fn wait_next(&mut self) -> bool {
        let elapsed = self.elapsed();
        if elapsed >= self.policy.timeout {
            return false;
        }

        let remaining = self.policy.timeout - elapsed;
        sleep(self.policy.interval.min(remaining)).await;
        self.attempts += 1;
        true
    }
}

/// Retry executor
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Create a new retry executor with the given policy
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Run `f` until it succeeds, fails with a non-retryable error, or the
    /// budget is spent.
    pub async fn execute<F, Fut, T, E>(&self, mut f: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let mut timer = RetryTimer::start(self.policy);

        loop {
            match f().await {
                Ok(result) => {
                    if timer.attempts() > 1 {
                        debug!("Operation succeeded after {} attempts", timer.attempts());
                    }
                    return Ok(result);
                }
                Err(error) if error.is_retryable() => {
                    trace!("Attempt {} not yet successful: {}", timer.attempts(), error);
                    if !timer.wait_next().await {
                        return Err(RetryError::Timeout {
                            timeout: self.policy.timeout,
                            attempts: timer.attempts(),
                            last_error: error,
                        });
                    }
                }
                Err(error) => return Err(RetryError::NonRetryable(error)),
            }
        }
    }
}

/// Retry error types
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// The time budget ran out while the error was still retryable
    #[error("Retry budget of {timeout:?} exhausted after {attempts} attempts. Last error: {last_error}")]
    Timeout {
        timeout: Duration,
        attempts: u32,
        last_error: E,
    },

    /// Non-retryable error encountered
    #[error("Non-retryable error: {0}")]
    NonRetryable(E),
}

impl<E> RetryError<E> {
    /// Get the underlying error
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Timeout { last_error, .. } => last_error,
            RetryError::NonRetryable(error) => error,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RetryError::Timeout { .. })
    }
}
