//! Bounded retry with a pluggable backoff schedule.
//!
//! [`RetryPolicy`] owns the two knobs that matter for absorbing CA-side
//! latency: how many attempts are made in total, and how long to wait after
//! each failed attempt. The waiting itself is a `tokio::time::sleep`, so the
//! calling task is suspended between attempts and never runs two attempts at
//! once.
//!
//! # Example
//!
//! ```ignore
//! let policy = RetryPolicy::linear(5, Duration::from_millis(300));
//!
//! // Waits 300ms, 600ms, 900ms, 1200ms between the five attempts.
//! let value = policy.run("complete_authorize", |_attempt| client.poll()).await?;
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

/// Backoff function: maps a 1-based failed attempt number to the delay
/// before the next attempt.
pub type BackoffFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Retry policy with a fixed attempt budget and no jitter.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one (always >= 1)
    max_attempts: u32,
    /// Delay after a failed attempt
    backoff: BackoffFn,
}

impl RetryPolicy {
    /// Create a policy from an arbitrary backoff function.
    ///
    /// `max_attempts` is clamped to at least one attempt.
    pub fn new<F>(max_attempts: u32, backoff: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Arc::new(backoff),
        }
    }

    /// Linearly increasing backoff: `attempt * step`.
    pub fn linear(max_attempts: u32, step: Duration) -> Self {
        Self::new(max_attempts, move |attempt| step * attempt)
    }

    /// A policy that makes exactly one attempt.
    pub fn once() -> Self {
        Self::new(1, |_| Duration::ZERO)
    }

    /// Total number of attempts
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay applied after the given failed attempt (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        (self.backoff)(attempt)
    }

    /// The full sequence of delays a permanently failing operation sees.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..self.max_attempts).map(|attempt| self.delay_after(attempt))
    }

    /// Run `op` until it succeeds or the attempt budget is spent.
    ///
    /// The closure receives the 1-based attempt number. On exhaustion the
    /// error of the last attempt is returned unchanged.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.run_while(operation, op, |_| true).await
    }

    /// Like [`run`](Self::run), but gives up as soon as `retryable` rejects
    /// an error.
    pub async fn run_while<T, E, F, Fut, R>(
        &self,
        operation: &str,
        mut op: F,
        retryable: R,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        R: Fn(&E) -> bool,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if !retryable(&e) => {
                    warn!(operation, attempt, error = %e, "Permanent failure, not retrying");
                    return Err(e);
                }
                Err(e) if attempt >= self.max_attempts => {
                    warn!(
                        operation,
                        attempts = attempt,
                        error = %e,
                        "Retry budget exhausted"
                    );
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.delay_after(attempt);
                    debug!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("delays", &self.delays().collect::<Vec<_>>())
            .finish()
    }
}
