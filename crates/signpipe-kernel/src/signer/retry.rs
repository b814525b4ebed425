//! Bounded retry with exponential backoff around signer calls.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use signpipe_types::{SignerError, SignerResult};

use super::Signer;

/// How often and how patiently to retry transient signer failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first call. Zero is treated as one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt; doubles after every failure.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Upper bound on a single delay.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    10
}

fn default_max_backoff() -> u64 {
    500
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let delay = self.initial_backoff_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }

    /// Run `op` until it succeeds, fails permanently, or runs out of attempts.
    ///
    /// Only transient errors are retried. When the attempts run out the last
    /// error comes back wrapped in `SignerError::Exhausted`.
    pub async fn retry<F, Fut, T>(&self, operation: &str, mut op: F) -> SignerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SignerResult<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) if attempt >= max_attempts => {
                    if max_attempts == 1 {
                        return Err(err);
                    }
                    tracing::warn!(operation, attempts = attempt, error = %err, "giving up");
                    return Err(SignerError::Exhausted {
                        attempts: attempt,
                        last: Box::new(err),
                    });
                }
                Err(err) => {
                    let delay = self.backoff(attempt);
                    tracing::warn!(operation, attempt, ?delay, error = %err, "retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Wraps a signer so every call goes through a `RetryPolicy`.
#[derive(Debug, Clone)]
pub struct RetryingSigner<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: Signer> RetryingSigner<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl<S: Signer> Signer for RetryingSigner<S> {
    async fn crc32(&self, data: &str) -> SignerResult<String> {
        self.policy.retry("crc32", || self.inner.crc32(data)).await
    }

    async fn md5(&self, data: &str) -> SignerResult<String> {
        self.policy.retry("md5", || self.inner.md5(data)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails with `Unavailable` for the first `failures` calls of each kind.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        error: SignerError,
    }

    impl Flaky {
        fn new(failures: u32, error: SignerError) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
                error,
            }
        }

        fn attempt(&self) -> SignerResult<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(self.error.clone())
            } else {
                Ok("ok".to_string())
            }
        }
    }

    #[async_trait]
    impl Signer for Flaky {
        async fn crc32(&self, _data: &str) -> SignerResult<String> {
            self.attempt()
        }

        async fn md5(&self, _data: &str) -> SignerResult<String> {
            self.attempt()
        }
    }

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(10));
        assert_eq!(policy.backoff(2), Duration::from_millis(20));
        assert_eq!(policy.backoff(3), Duration::from_millis(40));
        assert_eq!(policy.backoff(4), Duration::from_millis(50));
        assert_eq!(policy.backoff(200), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_recovers_from_transient_failures() {
        let signer = RetryingSigner::new(
            Flaky::new(2, SignerError::Unavailable("busy".into())),
            fast(3),
        );
        assert_eq!(signer.md5("x").await.unwrap(), "ok");
        assert_eq!(signer.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_attempts() {
        let signer = RetryingSigner::new(
            Flaky::new(10, SignerError::Unavailable("busy".into())),
            fast(3),
        );
        let err = signer.crc32("x").await.unwrap_err();
        assert_eq!(
            err,
            SignerError::Exhausted {
                attempts: 3,
                last: Box::new(SignerError::Unavailable("busy".into())),
            }
        );
        assert_eq!(signer.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let signer = RetryingSigner::new(
            Flaky::new(10, SignerError::Overheat { concurrent: 2 }),
            fast(5),
        );
        let err = signer.md5("x").await.unwrap_err();
        assert_eq!(err, SignerError::Overheat { concurrent: 2 });
        assert_eq!(signer.inner().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_single_attempt_returns_raw_error() {
        let signer = RetryingSigner::new(
            Flaky::new(1, SignerError::Unavailable("busy".into())),
            RetryPolicy::none(),
        );
        let err = signer.md5("x").await.unwrap_err();
        assert_eq!(err, SignerError::Unavailable("busy".into()));
    }

    #[test]
    fn test_policy_from_toml() {
        let policy: RetryPolicy = toml::from_str("max_attempts = 5").unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_backoff_ms, 10);
        assert_eq!(policy.max_backoff_ms, 500);
    }
}
