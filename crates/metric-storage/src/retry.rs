//! Generic retry-with-backoff runner for fallible async actions.
//!
//! Harvest navigation steps and remote file I/O both run through this: a
//! bounded number of attempts, exponential backoff between them, and
//! cancellation that aborts an in-flight backoff wait.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            backoff_factor: 2,
        }
    }
}

impl RetryPolicy {
    /// Delay slept after the given 1-based failed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self
            .backoff_factor
            .checked_pow(exponent)
            .unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor)
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E: std::fmt::Display> {
    #[error("cancelled while retrying")]
    Cancelled,
    #[error("{0}")]
    Exhausted(E),
}

impl<E: std::fmt::Display> RetryError<E> {
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Cancelled => None,
            Self::Exhausted(err) => Some(err),
        }
    }
}

/// Run `action` until it succeeds or the attempt budget is spent.
///
/// The first success is returned immediately. Every failure is logged with
/// the `label` and attempt count; after the final failure the most recent
/// error is propagated. The backoff sleep is a pure suspension point:
/// cancelling the token aborts the wait (and any not-yet-started attempt)
/// without side effects.
pub async fn run_with_retry<T, E, F, Fut>(
    policy: RetryPolicy,
    label: &str,
    cancel: &CancellationToken,
    mut action: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_err: Option<E> = None;

    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        match action().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!(label, attempt, attempts, error = %err, "action failed");
                last_err = Some(err);
                if attempt < attempts {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                        _ = tokio::time::sleep(policy.delay_for_attempt(attempt)) => {}
                    }
                }
            }
        }
    }

    Err(RetryError::Exhausted(
        last_err.expect("retry loop always records an error before exhausting"),
    ))
}
