//! Bounded retry for transient backend failures.
//!
//! Only errors the driver classifies as transient are retried; everything
//! else surfaces immediately. Delays grow exponentially
//! with full jitter, so concurrent callers do not stampede a recovering
//! backend.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::StorageError;

/// An exponential backoff policy with bounded attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// The base delay before the first retry.
    pub delay: Duration,

    /// The factor applied to the delay after each attempt.
    pub factor: u32,

    /// The ceiling for any single delay.
    pub max_delay: Duration,

    /// The total number of attempts, including the first.
    pub attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(50),
            factor: 2,
            max_delay: Duration::from_secs(2),
            attempts: 5,
        }
    }
}

impl Backoff {
    /// Create a new backoff policy.
    pub fn new(delay: Duration, factor: u32, max_delay: Duration, attempts: u32) -> Self {
        Self {
            delay,
            factor,
            max_delay,
            attempts,
        }
    }

    /// The delay before retry number `n` (1-based), with full jitter.
    fn jittered(&self, n: u32) -> Duration {
        let ceiling = self
            .delay
            .saturating_mul(self.factor.saturating_pow(n.saturating_sub(1)))
            .min(self.max_delay);
        rand::thread_rng().gen_range(Duration::ZERO..=ceiling)
    }
}

/// Run `op`, retrying transient storage errors per `policy`.
///
/// The final error is returned unchanged once attempts are exhausted.
pub async fn retry_transient<T, F, Fut>(policy: &Backoff, mut op: F) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.attempts => {
                let delay = policy.jittered(attempt);
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying transient storage error"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> StorageError {
        StorageError::new("test", StorageErrorKind::Transient, "flaky")
    }

    fn permanent() -> StorageError {
        StorageError::new("test", StorageErrorKind::Permanent, "broken")
    }

    fn fast_policy() -> Backoff {
        Backoff::new(Duration::from_millis(1), 2, Duration::from_millis(4), 3)
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = retry_transient(&fast_policy(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(transient())
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
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_transient(&fast_policy(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(permanent()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_transient(&fast_policy(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(transient()) }
        })
        .await;
        assert!(result.unwrap_err().is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
