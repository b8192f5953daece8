//! Bounded retry with exponential backoff, and a timeout wrapper
//!
//! Every remote call in lotsync funnels through these two primitives:
//!
//! - [`with_timeout`] races an operation against a timer. The operation runs
//!   on its own task, so losing the race abandons interest in it without
//!   cancelling it.
//! - [`retry_with_backoff`] re-invokes a failing operation according to a
//!   [`RetryPolicy`], stopping early on errors that cannot improve (auth,
//!   forbidden, not-found, validation) and while the device is offline.
//!
//! The delay before attempt `n + 1` is
//! `min(base * 2^(n - 1) + jitter, max)` with jitter uniform in `[0, 1s)`.
//!
//! # Examples
//!
//! ```rust
//! use lotsync_client::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_secs(1));
//! assert_eq!(policy.backoff(1, Duration::ZERO), Duration::from_millis(100));
//! assert_eq!(policy.backoff(3, Duration::ZERO), Duration::from_millis(400));
//! assert_eq!(policy.backoff(9, Duration::ZERO), Duration::from_secs(1));
//! ```

use lotsync_core::{Error, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Attempt budget and delay parameters for [`retry_with_backoff`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    /// Exclusive upper bound of the random jitter; zero disables it
    jitter: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            jitter: Duration::from_millis(1000),
        }
    }

    /// Single attempt, no retries
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    pub fn with_jitter(mut self, bound: Duration) -> Self {
        self.jitter = bound;
        self
    }

    pub fn without_jitter(self) -> Self {
        self.with_jitter(Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Delay after the `failed`-th failed attempt (1-based), for a given jitter
    pub fn backoff(&self, failed: u32, jitter: Duration) -> Duration {
        let factor = 2u32.saturating_pow(failed.saturating_sub(1));
        let delay = self.base_delay.saturating_mul(factor).saturating_add(jitter);
        delay.min(self.max_delay)
    }

    /// Delay after the `failed`-th failed attempt with fresh random jitter
    pub fn delay_for(&self, failed: u32) -> Duration {
        let jitter = if self.jitter.is_zero() {
            Duration::ZERO
        } else {
            rand::thread_rng().gen_range(Duration::ZERO..self.jitter)
        };
        self.backoff(failed, jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(1), Duration::from_secs(30))
    }
}

/// Run `operation` until it succeeds or the policy gives up
///
/// Returns the last error once the attempt budget is spent, or immediately
/// when the error is not retryable.
pub async fn retry_with_backoff<T, F, Fut>(policy: &RetryPolicy, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_while_online(policy, || true, operation).await
}

/// [`retry_with_backoff`] that also stops as soon as `is_online` reports false
pub async fn retry_while_online<T, F, Fut, O>(
    policy: &RetryPolicy,
    is_online: O,
    operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    O: Fn() -> bool,
{
    retry_notifying(policy, is_online, |_, _| {}, operation).await
}

/// [`retry_while_online`] calling `on_retry(failed_attempt, &error)` before
/// each backoff sleep
///
/// `on_retry` runs once per retry, so it is never called for an operation
/// that succeeds or gives up on its first attempt.
pub async fn retry_notifying<T, F, Fut, O, R>(
    policy: &RetryPolicy,
    is_online: O,
    mut on_retry: R,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    O: Fn() -> bool,
    R: FnMut(u32, &Error),
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if !is_online() {
            tracing::debug!(attempt, error = %error, "offline, not retrying");
            return Err(error);
        }
        if !error.is_retryable() {
            tracing::debug!(attempt, class = ?error.class(), error = %error, "error is not retryable");
            return Err(error);
        }
        if attempt >= policy.max_attempts {
            tracing::warn!(attempts = attempt, error = %error, "retry budget exhausted");
            return Err(error);
        }

        let delay = policy.delay_for(attempt);
        tracing::debug!(
            attempt,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "retrying after backoff"
        );
        on_retry(attempt, &error);
        tokio::time::sleep(delay).await;
    }
}

/// Race `operation` against `duration`
///
/// The operation is spawned onto the runtime. If the timer wins the caller
/// gets [`Error::Timeout`] carrying `label` while the operation keeps running
/// and its result is dropped.
pub async fn with_timeout<T, Fut>(operation: Fut, duration: Duration, label: &str) -> Result<T>
where
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let task = tokio::spawn(operation);
    match tokio::time::timeout(duration, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(Error::Internal(format!("{} failed: {}", label, join_error))),
        Err(_) => {
            tracing::warn!(label, timeout_ms = duration.as_millis() as u64, "operation timed out");
            Err(Error::timeout(label))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lotsync_core::RemoteError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(100), Duration::from_millis(1000))
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = fast_policy(5);
        assert_eq!(policy.backoff(1, Duration::ZERO), Duration::from_millis(100));
        assert_eq!(policy.backoff(2, Duration::ZERO), Duration::from_millis(200));
        assert_eq!(policy.backoff(4, Duration::ZERO), Duration::from_millis(800));
        assert_eq!(policy.backoff(5, Duration::ZERO), Duration::from_millis(1000));
        assert_eq!(policy.backoff(60, Duration::ZERO), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_is_added_before_cap() {
        let policy = fast_policy(5);
        assert_eq!(
            policy.backoff(1, Duration::from_millis(250)),
            Duration::from_millis(350)
        );
        assert_eq!(
            policy.backoff(4, Duration::from_millis(999)),
            Duration::from_millis(1000)
        );
    }

    #[test]
    fn test_random_jitter_bounds() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(60));
        for _ in 0..200 {
            let delay = policy.delay_for(2);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay < Duration::from_secs(3));
        }
        let flat = policy.clone().without_jitter();
        assert_eq!(flat.delay_for(2), Duration::from_secs(2));
    }

    #[test]
    fn test_zero_attempts_means_one() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO, Duration::ZERO).max_attempts(), 1);
        assert_eq!(RetryPolicy::once().max_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_generic_error_uses_full_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<()> = retry_with_backoff(&fast_policy(5), || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Err(Error::Network(format!("attempt {}", n))) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        match result {
            Err(Error::Network(msg)) => assert_eq!(msg, "attempt 5"),
            other => panic!("expected last network error, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<()> = retry_with_backoff(&fast_policy(5), || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(RemoteError::unauthorized("JWT expired").into()) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(result.unwrap_err().is_auth());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_statuses_are_not_retried() {
        for remote in [RemoteError::forbidden("no"), RemoteError::not_found("gone")] {
            let calls = Arc::new(AtomicU32::new(0));
            let counter = calls.clone();
            let _ = retry_with_backoff::<(), _, _>(&fast_policy(5), || {
                counter.fetch_add(1, Ordering::SeqCst);
                let remote = remote.clone();
                async move { Err(remote.into()) }
            })
            .await;
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_stops_retrying() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<()> = retry_while_online(&fast_policy(5), || false, || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Network("unreachable".into())) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(Error::Network(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let value = retry_with_backoff(&fast_policy(5), || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::timeout("flaky"))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_callback_sees_each_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut seen = Vec::new();

        let value = retry_notifying(
            &fast_policy(5),
            || true,
            |attempt, error| seen.push((attempt, error.to_string())),
            || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Error::Network(format!("drop {}", n)))
                    } else {
                        Ok(n)
                    }
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(value, 2);
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, 1);
        assert_eq!(seen[1].0, 2);
        assert!(seen[1].1.contains("drop 1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_callback_silent_without_retry() {
        let mut retries = 0;
        let result: Result<()> = retry_notifying(
            &fast_policy(5),
            || true,
            |_, _| retries += 1,
            || async { Err(RemoteError::forbidden("no").into()) },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(retries, 0);

        let ok = retry_notifying(&fast_policy(5), || true, |_, _| retries += 1, || async { Ok(1) })
            .await
            .unwrap();
        assert_eq!(ok, 1);
        assert_eq!(retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_with_label() {
        let start = tokio::time::Instant::now();
        let result: Result<()> =
            with_timeout(std::future::pending(), Duration::from_millis(50), "x").await;
        let elapsed = start.elapsed();

        let error = result.unwrap_err();
        assert!(matches!(error, Error::Timeout { .. }));
        assert!(error.to_string().contains('x'));
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_operation_keeps_running() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let result: Result<()> = with_timeout(
            async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                let _ = tx.send("finished");
                Ok(())
            },
            Duration::from_millis(50),
            "slow write",
        )
        .await;

        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert_eq!(rx.await.unwrap(), "finished");
    }

    #[tokio::test]
    async fn test_fast_operation_wins() {
        let value = with_timeout(async { Ok(7) }, Duration::from_secs(1), "fast")
            .await
            .unwrap();
        assert_eq!(value, 7);
    }
}
