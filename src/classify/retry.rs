use std::{future::Future, time::Duration};

use tokio_util::sync::CancellationToken;

use super::{rate_limit::TokenBucket, ClassifyError};

/// Explicit delay schedule. Its length is the number of retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    backoff: Vec<Duration>,
}

impl RetryPolicy {
    pub fn new(backoff: Vec<Duration>) -> Self {
        Self { backoff }
    }

    pub fn from_secs(backoff_secs: &[u64]) -> Self {
        Self::new(backoff_secs.iter().copied().map(Duration::from_secs).collect())
    }

    pub fn max_attempts(&self) -> usize {
        self.backoff.len() + 1
    }

    /// Delay after failed attempt `attempt` (1-based), if another is allowed.
    pub fn delay_after(&self, attempt: usize) -> Option<Duration> {
        attempt
            .checked_sub(1)
            .and_then(|index| self.backoff.get(index))
            .copied()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome<T> {
    Succeeded { value: T, attempts: usize },
    /// Transient failures outlasted the schedule, or cancellation cut it short.
    Exhausted { error: ClassifyError, attempts: usize },
    /// A non-transient error; retrying would not help.
    Failed { error: ClassifyError, attempts: usize },
}

impl<T> RetryOutcome<T> {
    pub fn attempts(&self) -> usize {
        match self {
            RetryOutcome::Succeeded { attempts, .. }
            | RetryOutcome::Exhausted { attempts, .. }
            | RetryOutcome::Failed { attempts, .. } => *attempts,
        }
    }

    pub fn into_result(self) -> Result<T, ClassifyError> {
        match self {
            RetryOutcome::Succeeded { value, .. } => Ok(value),
            RetryOutcome::Exhausted { error, .. } | RetryOutcome::Failed { error, .. } => Err(error),
        }
    }
}

/// Runs `op` under the rate limiter, retrying transient errors on `policy`.
/// A server-supplied retry-after wins when longer than the scheduled delay.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    limiter: &TokenBucket,
    cancel: &CancellationToken,
    mut op: F,
) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClassifyError>>,
{
    let mut attempt = 1;
    loop {
        limiter.acquire().await;
        let error = match op().await {
            Ok(value) => {
                return RetryOutcome::Succeeded {
                    value,
                    attempts: attempt,
                }
            }
            Err(error) => error,
        };

        if !error.is_transient() {
            return RetryOutcome::Failed {
                error,
                attempts: attempt,
            };
        }
        let Some(scheduled) = policy.delay_after(attempt) else {
            return RetryOutcome::Exhausted {
                error,
                attempts: attempt,
            };
        };
        let delay = error.retry_after().map_or(scheduled, |hint| hint.max(scheduled));

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {
                return RetryOutcome::Exhausted { error, attempts: attempt };
            }
        }
        attempt += 1;
    }
}
