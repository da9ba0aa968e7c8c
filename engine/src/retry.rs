//! Bounded exponential backoff for transactional writes.

use crate::error::{Error, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// How often, and how patiently, a conflicting transaction is retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Base delay before attempt `attempt + 1`, without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Delay before retrying after `err` on attempt `attempt` (1-based), or
    /// `None` when the error is final.
    pub fn should_retry(&self, attempt: u32, err: &Error) -> Option<Duration> {
        if !err.is_retryable() || attempt >= self.max_attempts {
            return None;
        }
        let base = self.backoff(attempt);
        let jitter = base.as_millis() as u64 / 2;
        let extra = if jitter > 0 {
            rand::thread_rng().gen_range(0..=jitter)
        } else {
            0
        };
        Some(base + Duration::from_millis(extra))
    }

    /// Run `op` until it succeeds, fails for good, or attempts run out.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            let Some(delay) = self.should_retry(attempt, &err) else {
                return Err(err);
            };
            warn!(attempt, error = %err, delay_ms = delay.as_millis() as u64, "retrying after conflict");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(10));
        assert_eq!(policy.backoff(2), Duration::from_millis(20));
        assert_eq!(policy.backoff(3), Duration::from_millis(40));
        assert_eq!(policy.backoff(4), Duration::from_millis(50));
        assert_eq!(policy.backoff(40), Duration::from_millis(50));
    }

    #[test]
    fn only_conflicts_retry() {
        let policy = RetryPolicy::default();
        let conflict = Error::Conflict("k".into());
        let delay = policy.should_retry(1, &conflict).unwrap();
        assert!(delay >= Duration::from_millis(10) && delay <= Duration::from_millis(15));
        assert!(policy.should_retry(5, &conflict).is_none());
        assert!(policy
            .should_retry(1, &Error::NotFound("k".into()))
            .is_none());
        assert!(RetryPolicy::none().should_retry(1, &conflict).is_none());
    }

    #[tokio::test]
    async fn run_retries_until_success() {
        let calls = &AtomicU32::new(0);
        let result = RetryPolicy::default()
            .run(|| async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Conflict("k".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn run_gives_up() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        let result: Result<()> = policy
            .run(|| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Conflict("k".into()))
            })
            .await;
        assert!(matches!(result, Err(Error::Conflict(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
