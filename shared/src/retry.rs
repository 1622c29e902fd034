//! Bounded exponential backoff with jitter.
//!
//! Every remote collaborator (vendor endpoints, blob storage, the group store and the
//! downstream sender) wraps its calls in [`retry`] with a shared [`RetryPolicy`].
//! Only failures the caller classifies as transient are retried.

use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub attempts: u32,
    pub wait_initial: Duration,
    pub wait_max: Duration,
    /// Upper bound of the random delay added to every backoff.
    pub wait_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 5,
            wait_initial: Duration::from_secs(1),
            wait_max: Duration::from_secs(30),
            wait_jitter: Duration::from_secs(3),
        }
    }
}

impl RetryPolicy {
    /// A single attempt and no waiting.
    pub const fn none() -> Self {
        RetryPolicy {
            attempts: 1,
            wait_initial: Duration::ZERO,
            wait_max: Duration::ZERO,
            wait_jitter: Duration::ZERO,
        }
    }

    /// Retries immediately. Used by tests exercising retry paths.
    pub const fn immediate(attempts: u32) -> Self {
        RetryPolicy {
            attempts,
            wait_initial: Duration::ZERO,
            wait_max: Duration::ZERO,
            wait_jitter: Duration::ZERO,
        }
    }

    /// Delay before the retry following failed attempt number `failed` (1-based), jitter excluded.
    pub fn backoff(&self, failed: u32) -> Duration {
        let factor = 2_u32.saturating_pow(failed.saturating_sub(1));
        self.wait_initial.saturating_mul(factor).min(self.wait_max)
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.wait_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max_ms))
    }
}

/// Runs `op` until it succeeds, fails with a non-transient error, or the policy's
/// attempts are exhausted. The last error is returned unchanged.
pub async fn retry<T, E, F, Fut, P>(policy: &RetryPolicy, is_transient: P, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts && is_transient(&err) => {
                let delay = policy.backoff(attempt) + policy.jitter();
                tracing::debug!(attempt, ?delay, error = %err, "transient failure, retrying");
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    enum TestError {
        Transient,
        Fatal,
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    fn is_transient(err: &TestError) -> bool {
        *err == TestError::Transient
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(5), Duration::from_secs(16));
        assert_eq!(policy.backoff(6), Duration::from_secs(30));
        assert_eq!(policy.backoff(40), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry(&RetryPolicy::immediate(5), is_transient, || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(TestError::Transient)
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(&RetryPolicy::immediate(3), is_transient, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TestError::Transient)
        })
        .await;

        assert_eq!(result, Err(TestError::Transient));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(&RetryPolicy::immediate(5), is_transient, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TestError::Fatal)
        })
        .await;

        assert_eq!(result, Err(TestError::Fatal));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
