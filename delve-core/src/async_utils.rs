//! Async utilities and patterns
//!
//! Provides retry policies with exponential backoff and timeout helpers

use crate::error::{DelveError, DelveResult, ErrorContext};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Retry policy attached to an external call site
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub max_attempts: usize,
    /// Initial delay between retries in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay between retries in milliseconds
    pub max_delay_ms: u64,
    /// Backoff multiplier (exponential backoff)
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 8000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy for search provider calls
    pub fn search() -> Self {
        Self::default()
    }

    /// Policy for completion calls
    pub fn completion() -> Self {
        Self {
            max_attempts: 2,
            initial_delay_ms: 1000,
            ..Self::default()
        }
    }

    /// A single attempt, no retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retrying after the given failed attempt (1-based), without jitter
    pub fn delay_for_attempt(&self, attempt: usize) -> u64 {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let delay = (self.initial_delay_ms as f64) * self.backoff_multiplier.powi(exponent);
        if !delay.is_finite() {
            return self.max_delay_ms;
        }
        (delay as u64).min(self.max_delay_ms)
    }

    fn jittered(&self, delay: u64) -> u64 {
        if !self.jitter {
            return delay;
        }
        let jitter_factor = 0.1;
        let jitter = (fastrand::f64() - 0.5) * 2.0 * jitter_factor;
        ((delay as f64) * (1.0 + jitter)) as u64
    }
}

/// Retry an async operation with exponential backoff.
///
/// Only recoverable errors are retried. A server supplied retry hint replaces the
/// computed delay, bounded by `max_delay_ms`.
pub async fn retry_async<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    operation: F,
) -> DelveResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DelveResult<T>>,
{
    retry_inner(policy, operation_name, None, operation).await
}

/// Like [`retry_async`], but stops retrying once `cancel` fires.
///
/// The attempt in progress is never aborted; the last error is returned instead of
/// starting another attempt.
pub async fn retry_cancellable<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    cancel: &CancellationToken,
    operation: F,
) -> DelveResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DelveResult<T>>,
{
    retry_inner(policy, operation_name, Some(cancel), operation).await
}

async fn retry_inner<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    cancel: Option<&CancellationToken>,
    mut operation: F,
) -> DelveResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DelveResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        debug!(
            operation = operation_name,
            attempt = attempt,
            max_attempts = max_attempts,
            "Attempting operation"
        );

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(
                        operation = operation_name,
                        attempt = attempt,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) => {
                if !err.is_recoverable() {
                    debug!(
                        operation = operation_name,
                        error = %err,
                        "Operation failed with non-recoverable error"
                    );
                    return Err(err);
                }

                if attempt >= max_attempts {
                    error!(
                        operation = operation_name,
                        attempt = attempt,
                        error = %err,
                        "Operation failed after all retry attempts"
                    );
                    return Err(err);
                }

                if cancel.is_some_and(|c| c.is_cancelled()) {
                    debug!(operation = operation_name, "Cancelled, not retrying");
                    return Err(err);
                }

                let delay = err
                    .retry_delay_ms()
                    .map(|hint| hint.min(policy.max_delay_ms))
                    .unwrap_or_else(|| policy.jittered(policy.delay_for_attempt(attempt)));

                warn!(
                    operation = operation_name,
                    attempt = attempt,
                    error = %err,
                    delay_ms = delay,
                    "Operation failed, retrying"
                );

                match cancel {
                    Some(token) => {
                        tokio::select! {
                            _ = sleep(Duration::from_millis(delay)) => {}
                            _ = token.cancelled() => return Err(err),
                        }
                    }
                    None => sleep(Duration::from_millis(delay)).await,
                }
            }
        }
    }
}

/// Timeout wrapper for async operations
pub async fn with_timeout<F, T>(future: F, timeout_ms: u64, operation_name: &str) -> DelveResult<T>
where
    F: Future<Output = T>,
{
    match timeout(Duration::from_millis(timeout_ms), future).await {
        Ok(result) => Ok(result),
        Err(_) => Err(DelveError::Timeout {
            operation: operation_name.to_string(),
            duration_ms: timeout_ms,
            context: ErrorContext::new("async_utils")
                .with_operation("timeout")
                .with_metadata("timeout_ms", &timeout_ms.to_string())
                .with_suggestion("Increase timeout duration")
                .with_suggestion("Check network connectivity"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_schedule_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 6,
            initial_delay_ms: 100,
            max_delay_ms: 1000,
            backoff_multiplier: 2.0,
            jitter: false,
        };

        assert_eq!(policy.delay_for_attempt(1), 100);
        assert_eq!(policy.delay_for_attempt(2), 200);
        assert_eq!(policy.delay_for_attempt(3), 400);
        assert_eq!(policy.delay_for_attempt(4), 800);
        assert_eq!(policy.delay_for_attempt(5), 1000);
        assert_eq!(policy.delay_for_attempt(500), 1000);
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let delay = policy.jittered(1000);
            assert!((900..=1100).contains(&delay));
        }
    }

    #[test]
    fn test_call_site_defaults() {
        assert_eq!(RetryPolicy::search().max_attempts, 3);
        assert_eq!(RetryPolicy::completion().max_attempts, 2);
        assert_eq!(RetryPolicy::no_retry().max_attempts, 1);
    }
}
