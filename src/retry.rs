//! Retry and polling utilities
//!
//! Calls against virtualization and load-balancer backends fail
//! transiently; [`retry_with_backoff`] wraps them with exponential backoff
//! and jitter. [`poll_until`] drives fixed-interval readiness checks, such
//! as waiting for a machine's network stack or a provisioning load
//! balancer, and stops as soon as the cancellation token fires.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::error::{Error, Result};

/// Backoff parameters for operations that may fail transiently
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = unbounded)
    pub max_attempts: u32,
    /// Initial delay between attempts
    pub initial_delay: Duration,
    /// Cap on the delay between attempts
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each failure
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Only errors reporting themselves retryable are retried; permanent
/// failures and cancellation return immediately. The cancellation token is
/// honored while sleeping between attempts.
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                // Jitter: 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(jittered_delay) => {}
                }

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

/// Outcome of a single poll probe
pub enum Poll<T> {
    Ready(T),
    Pending,
}

/// Run `probe` at a fixed interval until it reports ready.
///
/// The probe runs once immediately. Errors from the probe are fatal; the
/// only ways out are readiness, a probe error, or cancellation.
pub async fn poll_until<F, Fut, T>(
    interval: Duration,
    cancel: &CancellationToken,
    mut probe: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Poll<T>>>,
{
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match probe().await? {
            Poll::Ready(value) => return Ok(value),
            Poll::Pending => {}
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn transient(msg: &str) -> Error {
        Error::provider(msg)
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let config = RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        };

        let result = retry_with_backoff(&config, &CancellationToken::new(), "op", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(transient("flaky"))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 42);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let config = RetryConfig::with_max_attempts(5);

        let result: Result<()> =
            retry_with_backoff(&config, &CancellationToken::new(), "op", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(Error::validation_for("kl-abc1234", "bad input"))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausts_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let config = RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        };

        let result: Result<()> =
            retry_with_backoff(&config, &CancellationToken::new(), "op", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(transient("always"))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_until_reports_ready() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let value = poll_until(Duration::from_millis(1), &CancellationToken::new(), || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Ok(Poll::Pending)
                } else {
                    Ok(Poll::Ready("up"))
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, "up");
    }

    #[tokio::test]
    async fn test_poll_until_honors_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<()> = poll_until(Duration::from_millis(1), &cancel, || async {
            Ok(Poll::Pending)
        })
        .await;
        assert!(result.unwrap_err().is_cancelled());
    }
}
