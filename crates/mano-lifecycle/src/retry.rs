//! Retry with exponential backoff and jitter.

use rand::rngs::OsRng;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following `attempt` (1-based).
    /// `min(max_delay, initial_delay * factor^(attempt-1))`, plus up to 25 %
    /// jitter drawn from the OS entropy source when enabled.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let raw = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());
        let delayed = if self.jitter {
            capped * (1.0 + OsRng.gen_range(0.0..=0.25))
        } else {
            capped
        };
        Duration::from_secs_f64(delayed)
    }
}

#[derive(Error, Debug)]
pub enum RetryError<E: std::fmt::Display + std::fmt::Debug> {
    #[error("retries exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("not retryable: {0}")]
    NotRetryable(E),

    #[error("retry cancelled")]
    Cancelled,
}

impl<E: std::fmt::Display + std::fmt::Debug> RetryError<E> {
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::NotRetryable(e) => Some(e),
            RetryError::Cancelled => None,
        }
    }
}

/// Run `op` until it succeeds, the error stops being retryable, the attempt
/// budget runs out, or the caller cancels. Sleeps between attempts are
/// cancellable.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    is_retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: std::fmt::Display + std::fmt::Debug,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt: u32 = 1;
    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !is_retryable(&err) {
                    return Err(RetryError::NotRetryable(err));
                }
                if attempt >= policy.max_attempts {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: err,
                    });
                }
                let delay = policy.delay_for_attempt(attempt);
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying after backoff");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}

/// Convenience wrapper for operations returning [`mano_core::ManoError`],
/// using the error's own retryability predicate.
pub async fn retry_mano<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    op: F,
) -> mano_core::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = mano_core::Result<T>>,
{
    match retry(policy, cancel, mano_core::ManoError::is_retryable, op).await {
        Ok(value) => Ok(value),
        Err(RetryError::Cancelled) => Err(mano_core::ManoError::Cancelled),
        Err(RetryError::Exhausted { last, .. }) | Err(RetryError::NotRetryable(last)) => Err(last),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(8),
            backoff_factor: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            jitter: false,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let policy = RetryPolicy {
            jitter: true,
            ..fast_policy(3)
        };
        for _ in 0..50 {
            let base = Duration::from_millis(1);
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= base);
            assert!(delay <= Duration::from_secs_f64(base.as_secs_f64() * 1.25));
        }
    }

    #[tokio::test]
    async fn success_on_attempt_k_performs_exactly_k_calls() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let cancel = CancellationToken::new();

        let result: Result<u32, RetryError<mano_core::ManoError>> = retry(
            &fast_policy(5),
            &cancel,
            |_| true,
            move || {
                let calls = calls_clone.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(mano_core::ManoError::Transient("flaky".into()))
                    } else {
                        Ok(n)
                    }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_short_circuit() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let cancel = CancellationToken::new();

        let result: Result<(), _> = retry_mano(&fast_policy(5), &cancel, move || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(mano_core::ManoError::Validation("bad spec".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(mano_core::ManoError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_reports_attempt_count() {
        let cancel = CancellationToken::new();
        let result: Result<(), _> = retry(
            &fast_policy(3),
            &cancel,
            |_| true,
            || async { Err::<(), _>(mano_core::ManoError::Transient("down".into())) },
        )
        .await;

        match result.unwrap_err() {
            RetryError::Exhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_sleep() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
            backoff_factor: 1.0,
            jitter: false,
        };

        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });

        let result: Result<(), _> = retry(
            &policy,
            &cancel,
            |_| true,
            || async { Err::<(), _>(mano_core::ManoError::Transient("down".into())) },
        )
        .await;

        assert!(matches!(result.unwrap_err(), RetryError::Cancelled));
    }
}
