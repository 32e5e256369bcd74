//! Retry helpers for timing-dependent assertions.
//!
//! Control-plane state converges asynchronously: a config change takes a push
//! cycle to reach a proxy, a policy flip takes a cache refresh to affect
//! checks. Tests express those expectations as an action that is retried at
//! a fixed cadence until it succeeds or a deadline passes.

use crate::config::FrameworkConfig;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Default overall timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default delay between attempts.
pub const DEFAULT_DELAY: Duration = Duration::from_millis(10);

/// Retry loop errors.
#[derive(Debug, Error)]
pub enum RetryError {
    #[error("retry timed out after {timeout:?} ({attempts} attempts): {last_error}")]
    Timeout {
        timeout: Duration,
        attempts: usize,
        last_error: String,
    },
}

/// Settings for a retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryOptions {
    timeout: Duration,
    delay: Duration,
    converge: usize,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            delay: DEFAULT_DELAY,
            converge: 1,
        }
    }
}

impl RetryOptions {
    /// Options with the default timeout and delay.
    pub fn new() -> Self {
        Self::default()
    }

    /// Options using the run-wide defaults from the framework config.
    pub fn from_config(config: &FrameworkConfig) -> Self {
        Self::new()
            .timeout(config.retry_timeout)
            .delay(config.retry_delay)
    }

    /// Overall deadline. A zero timeout is raised to one delay so the loop
    /// always makes at least one attempt and still terminates.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Fixed delay between attempts.
    #[must_use]
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Require `successes` consecutive successful attempts before returning.
    #[must_use]
    pub fn converge(mut self, successes: usize) -> Self {
        self.converge = successes.max(1);
        self
    }

    /// Configured overall timeout.
    pub fn get_timeout(&self) -> Duration {
        self.timeout.max(self.delay)
    }

    /// Configured delay between attempts.
    pub fn get_delay(&self) -> Duration {
        self.delay
    }
}

/// Retry `action` until it succeeds or the timeout elapses.
///
/// With `converge(n)`, `n` consecutive successes are required; a failure
/// resets the streak. The value of the last successful attempt is returned.
///
/// # Example
///
/// ```rust,ignore
/// use mesh_test::retry::{until_success, RetryOptions};
///
/// until_success(RetryOptions::new().timeout(Duration::from_secs(40)), || async {
///     let result = backend.check().await?;
///     if result.allowed { Ok(()) } else { Err(anyhow!("check denied")) }
/// })
/// .await?;
/// ```
///
/// # Errors
///
/// Returns [`RetryError::Timeout`] carrying the last observed error message.
pub async fn until_success<F, Fut, T, E>(
    options: RetryOptions,
    mut action: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let timeout = options.get_timeout();
    let start = Instant::now();
    // A timeout past the clock's range never expires
    let deadline = start.checked_add(timeout);
    let mut attempts = 0usize;
    let mut successes = 0usize;
    let mut last_error = String::from("no attempt completed");

    loop {
        attempts += 1;
        match action().await {
            Ok(value) => {
                successes += 1;
                if successes >= options.converge {
                    debug!(
                        target: "mesh_test.retry",
                        attempts,
                        elapsed = ?start.elapsed(),
                        "Retry succeeded"
                    );
                    return Ok(value);
                }
            }
            Err(e) => {
                successes = 0;
                last_error = e.to_string();
            }
        }

        let now = Instant::now();
        if deadline.is_some_and(|deadline| now >= deadline) {
            warn!(
                target: "mesh_test.retry",
                attempts,
                timeout = ?timeout,
                last_error = %last_error,
                "Retry timed out"
            );
            return Err(RetryError::Timeout {
                timeout,
                attempts,
                last_error,
            });
        }

        // Never sleep past the deadline
        let pause = match deadline {
            Some(deadline) => options.delay.min(deadline.saturating_duration_since(now)),
            None => options.delay,
        };
        sleep(pause).await;
    }
}

/// Retry `action` until it succeeds, failing the current test on timeout.
///
/// # Panics
///
/// Panics with the last observed error when the timeout elapses.
#[allow(clippy::panic)]
#[track_caller]
pub fn until_success_or_fail<F, Fut, T, E>(
    options: RetryOptions,
    action: F,
) -> impl Future<Output = T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let caller = std::panic::Location::caller();
    async move {
        match until_success(options, action).await {
            Ok(value) => value,
            Err(e) => panic!("retry::until_success_or_fail ({}): {}", caller, e),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_default_options() {
        let options = RetryOptions::default();
        assert_eq!(options.get_timeout(), DEFAULT_TIMEOUT);
        assert_eq!(options.get_delay(), DEFAULT_DELAY);
    }

    #[test]
    fn test_options_from_config() {
        let config = FrameworkConfig {
            retry_timeout: Duration::from_secs(3),
            retry_delay: Duration::from_millis(50),
            ..FrameworkConfig::default()
        };
        let options = RetryOptions::from_config(&config);
        assert_eq!(options.get_timeout(), Duration::from_secs(3));
        assert_eq!(options.get_delay(), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_until_success_succeeds_immediately() {
        let result = until_success(RetryOptions::new(), || async { Ok::<_, String>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_until_success_succeeds_on_third_attempt() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result = until_success(RetryOptions::new(), move || {
            let attempts = attempts_clone.clone();
            async move {
                let count = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if count >= 3 {
                    Ok(count)
                } else {
                    Err(format!("attempt {} failed", count))
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert!(attempts.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_until_success_times_out_with_last_error() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let timeout = Duration::from_secs(1);
        let start = Instant::now();

        let result = until_success(
            RetryOptions::new()
                .timeout(timeout)
                .delay(Duration::from_millis(100)),
            move || {
                let attempts = attempts_clone.clone();
                async move {
                    let count = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    Err::<(), _>(format!("check failed on attempt {}", count))
                }
            },
        )
        .await;

        let elapsed = start.elapsed();
        let RetryError::Timeout {
            timeout: reported,
            attempts: reported_attempts,
            last_error,
        } = result.expect_err("Should return error on timeout");

        assert_eq!(reported, timeout);
        assert_eq!(reported_attempts, attempts.load(Ordering::SeqCst));
        assert_eq!(
            last_error,
            format!("check failed on attempt {}", reported_attempts)
        );
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_converge_requires_consecutive_successes() {
        // fail, ok, fail, ok, ok, ok -> converges on the 6th attempt
        let script = [false, true, false, true, true, true];
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result = until_success(RetryOptions::new().converge(3), move || {
            let attempts = attempts_clone.clone();
            async move {
                let idx = attempts.fetch_add(1, Ordering::SeqCst);
                if script.get(idx).copied().unwrap_or(true) {
                    Ok(idx)
                } else {
                    Err("not yet")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 5);
        assert_eq!(attempts.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_timeout_does_not_overflow() {
        let result = until_success(RetryOptions::new().timeout(Duration::MAX), || async {
            Ok::<_, String>(1)
        })
        .await;
        assert_eq!(result.unwrap(), 1);

        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let result = until_success(RetryOptions::new().timeout(Duration::MAX), move || {
            let attempts = attempts_clone.clone();
            async move {
                let count = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if count >= 5 {
                    Ok(count)
                } else {
                    Err("not yet")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 5);
    }

    #[tokio::test(start_paused = true)]
    #[should_panic(expected = "retry::until_success_or_fail")]
    async fn test_until_success_or_fail_panics_on_timeout() {
        until_success_or_fail(
            RetryOptions::new().timeout(Duration::from_millis(50)),
            || async { Err::<(), _>("backend never answered") },
        )
        .await;
    }
}
