//! Exponential backoff with jitter for startup calls
//!
//! ```ignore
//! use accounting::retry::{retry_with_backoff, RetryConfig};
//!
//! retry_with_backoff(&RetryConfig::with_max_attempts(5), "egress policy", || async {
//!     ensure_egress_policy(&client, port).await
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Backoff settings
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = retry forever)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for the delay
    pub max_delay: Duration,
    /// Growth factor between attempts
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Config giving up after `attempts`
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }
}

/// Retry `operation` until it succeeds or the attempts are used up
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_backoff_if(config, operation_name, operation, |_| true).await
}

/// Like [`retry_with_backoff`], but errors for which `retryable` is false are
/// returned immediately
pub async fn retry_with_backoff_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
    retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;
        let e = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !retryable(&e) {
            error!(
                operation = %operation_name,
                attempt,
                error = %e,
                "operation failed permanently"
            );
            return Err(e);
        }
        if config.max_attempts > 0 && attempt >= config.max_attempts {
            error!(
                operation = %operation_name,
                attempt,
                error = %e,
                "operation failed after max retries"
            );
            return Err(e);
        }

        // 0.5x to 1.5x
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
        warn!(
            operation = %operation_name,
            attempt,
            error = %e,
            delay_ms = jittered.as_millis() as u64,
            "operation failed, retrying"
        );
        tokio::time::sleep(jittered).await;

        delay = Duration::from_secs_f64(
            (delay.as_secs_f64() * config.backoff_multiplier).min(config.max_delay.as_secs_f64()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn counting() -> (Arc<AtomicU32>, Arc<AtomicU32>) {
        let count = Arc::new(AtomicU32::new(0));
        (count.clone(), count)
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let (count, c) = counting();
        let result: Result<&str, String> =
            retry_with_backoff(&RetryConfig::with_max_attempts(5), "op", || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("connection refused".to_string())
                    } else {
                        Ok("applied")
                    }
                }
            })
            .await;

        assert_eq!(result, Ok("applied"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let (count, c) = counting();
        let result: Result<(), String> =
            retry_with_backoff(&RetryConfig::with_max_attempts(3), "op", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("always fails".to_string())
                }
            })
            .await;

        assert_eq!(result, Err("always fails".to_string()));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let (count, c) = counting();
        let result: Result<(), crate::Error> = retry_with_backoff_if(
            &RetryConfig::default(),
            "op",
            || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(crate::Error::config("bad port"))
                }
            },
            |e| e.is_retryable(),
        )
        .await;

        assert!(matches!(result, Err(crate::Error::Config(_))));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
