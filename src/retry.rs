//! Bounded, jittered exponential backoff for transaction conflicts.
//!
//! Every externally visible write operation of the engine runs under this
//! decorator so that serialization failures and deadlocks are absorbed
//! locally instead of leaking to callers. Business errors are never
//! retried; after the budget is exhausted the last error surfaces
//! unmodified.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::StockError;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_jitter: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// `base * 2^attempt` plus random jitter, so competing sessions do not
    /// retry in lockstep.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(16));
        let jitter_ms = if self.max_jitter.is_zero() {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.max_jitter.as_millis() as u64)
        };
        exp + Duration::from_millis(jitter_ms)
    }

    pub async fn run<T, F, Fut>(&self, op: F) -> Result<T, StockError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StockError>>,
    {
        self.run_with(op, |_| {}).await
    }

    /// Like [`run`](Self::run), invoking `on_retry` with the zero-based
    /// attempt number before each backoff sleep.
    pub async fn run_with<T, F, Fut, H>(&self, mut op: F, on_retry: H) -> Result<T, StockError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StockError>>,
        H: Fn(u32),
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt + 1 < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retryable transaction failure, backing off"
                    );
                    on_retry(attempt);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_jitter: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn retries_conflicts_until_success() {
        let calls = AtomicU32::new(0);
        let result = fast_policy()
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(StockError::TransactionConflict("deadlock detected".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn surfaces_last_error_after_exhaustion() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast_policy()
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(StockError::TransactionConflict("could not serialize access".into())) }
            })
            .await;
        assert!(matches!(result, Err(StockError::TransactionConflict(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn business_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast_policy()
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(StockError::InsufficientStock {
                        requested: 6,
                        available: 4,
                        already_held: 0,
                    })
                }
            })
            .await;
        assert!(matches!(result, Err(StockError::InsufficientStock { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_jitter: Duration::ZERO,
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
    }
}
