//! Bounded exponential backoff for store calls.

use std::future::Future;
use std::time::Duration;

use crate::error::{classify, StoreError};
use crate::metrics;

/// Retry settings for transient store errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubled for every further attempt.
    pub base_delay: Duration,
    /// Upper bound of a single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Default::default()
        }
    }

    /// Never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay before attempt `attempt` (0-based; attempt 0 has no delay).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Runs `op` until it succeeds, fails with a non-transient error, or the
/// policy's attempts are used up. Only transient errors are retried.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        if attempt > 0 {
            let delay = policy.delay_for(attempt);
            tracing::debug!(
                operation = operation,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "Retrying store call after transient failure"
            );
            metrics::record_retry(operation);
            tokio::time::sleep(delay).await;
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let class = classify(&err);
                attempt += 1;
                if !class.is_retryable() || attempt >= attempts {
                    if class.is_retryable() {
                        tracing::warn!(
                            operation = operation,
                            attempts = attempt,
                            error = %err,
                            "Store call failed after exhausting retries"
                        );
                    }
                    return Err(err);
                }
                tracing::warn!(
                    operation = operation,
                    attempt = attempt,
                    max_attempts = attempts,
                    error = %err,
                    "Transient store error, will retry"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1))
    }

    #[test]
    fn test_delay_schedule() {
        let policy = RetryPolicy::new(5, Duration::from_millis(500))
            .with_max_delay(Duration::from_secs(1));
        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for(3), Duration::from_secs(1));
        assert_eq!(policy.delay_for(40), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_transient_error_is_retried() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast_policy(3), "download", || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(StoreError::Timeout("slow".into()))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast_policy(3), "upload", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Connection("reset".into()))
        })
        .await;

        assert!(matches!(result, Err(StoreError::Connection(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast_policy(5), "upload", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::PaymentRequired("plan".into()))
        })
        .await;

        assert!(matches!(result, Err(StoreError::PaymentRequired(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
