//! Retry-with-backoff shared by the segment downloader and sink pushes.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{RelayError, Result};

/// Bounded exponential backoff: delay = `base * 2^attempt`, capped at
/// `max_delay`, with optional jitter of up to half the base delay.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    pub(crate) fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let capped = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if !self.jitter {
            return capped;
        }
        let jitter_ms = u64::try_from(self.base_delay.as_millis() / 2).unwrap_or(0);
        if jitter_ms == 0 {
            return capped;
        }
        let extra = rand::rng().random_range(0..jitter_ms);
        (capped + Duration::from_millis(extra)).min(self.max_delay)
    }
}

/// Run `operation` until it succeeds, fails permanently, exhausts the
/// policy, or the token is cancelled. The closure receives the 0-indexed
/// attempt number; retryability is read off the returned [`RelayError`].
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    operation: F,
) -> Result<T>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    for attempt in 0..=policy.max_retries {
        if token.is_cancelled() {
            return Err(RelayError::Cancelled);
        }
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => {
                if attempt >= policy.max_retries {
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    attempt = attempt + 1,
                    max = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after transient error"
                );
                tokio::select! {
                    _ = token.cancelled() => return Err(RelayError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    // The loop always returns from its last iteration.
    Err(RelayError::Cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(50),
            jitter: false,
        }
    }

    fn transient() -> RelayError {
        RelayError::SegmentFetch {
            reason: "timeout".into(),
            retryable: true,
        }
    }

    fn permanent() -> RelayError {
        RelayError::SegmentFetch {
            reason: "gone".into(),
            retryable: false,
        }
    }

    #[test]
    fn backoff_grows_and_respects_cap() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: false,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(1));
    }

    #[test]
    fn jitter_never_exceeds_cap() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(400),
            max_delay: Duration::from_millis(500),
            jitter: true,
        };
        for _ in 0..64 {
            assert!(policy.delay_for_attempt(4) <= Duration::from_millis(500));
        }
    }

    #[tokio::test]
    async fn permanent_error_short_circuits() {
        let attempts = AtomicU32::new(0);
        let token = CancellationToken::new();
        let result: Result<u32> = retry_with_backoff(&policy(5), &token, |_| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async { Err(permanent()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn transient_errors_retry_until_exhausted() {
        let attempts = AtomicU32::new(0);
        let token = CancellationToken::new();
        let result: Result<u32> = retry_with_backoff(&policy(2), &token, |_| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async { Err(transient()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn recovers_on_later_attempt() {
        let token = CancellationToken::new();
        let result = retry_with_backoff(&policy(3), &token, |attempt| async move {
            if attempt < 2 { Err(transient()) } else { Ok(attempt) }
        })
        .await;
        assert_eq!(result.expect("should recover"), 2);
    }

    #[tokio::test]
    async fn cancelled_token_stops_immediately() {
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<u32> =
            retry_with_backoff(&policy(3), &token, |_| async { Ok(1) }).await;
        assert!(matches!(result, Err(RelayError::Cancelled)));
    }
}
