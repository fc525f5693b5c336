//! Retry Logic
//!
//! Bounded retries with a fixed interval by default, optional exponential
//! growth and jitter, and early abort on errors classified as permanent.

use crate::EngineError;
use bigmodel_providers::ProviderError;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Classification of errors for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// May succeed on a later attempt (busy pool, timeouts, 5xx)
    Transient,

    /// Will not succeed on retry (bad input, illegal state)
    Permanent,

    /// Treated as transient
    Unknown,
}

/// Errors that know whether retrying them is worthwhile.
pub trait Classify {
    fn classify(&self) -> ErrorClass;
}

impl Classify for EngineError {
    fn classify(&self) -> ErrorClass {
        match self {
            EngineError::EndpointUnavailable(_) => ErrorClass::Transient,
            EngineError::Transport(e) => e.classify(),
            EngineError::Database(e) if e.is_connection_error() => ErrorClass::Transient,
            EngineError::Broker(_) => ErrorClass::Transient,
            EngineError::Validation(_)
            | EngineError::InvalidStateTransition { .. }
            | EngineError::AlreadyDispatched(_)
            | EngineError::Cancelled
            | EngineError::Config(_)
            | EngineError::Serialization(_) => ErrorClass::Permanent,
            _ => ErrorClass::Unknown,
        }
    }
}

impl Classify for ProviderError {
    fn classify(&self) -> ErrorClass {
        if self.is_retryable() {
            ErrorClass::Transient
        } else if self.is_invalid_request() || matches!(self, ProviderError::Status { .. }) {
            ErrorClass::Permanent
        } else {
            ErrorClass::Unknown
        }
    }
}

/// Retry strategy configuration
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RetryConfig {
    /// Total number of attempts, including the first
    pub max_attempts: u32,

    /// Delay before the second attempt, in milliseconds
    pub initial_backoff_ms: u64,

    /// Upper bound for any single delay, in milliseconds
    pub max_backoff_ms: u64,

    /// Growth factor per attempt; 1.0 keeps the interval fixed
    pub backoff_multiplier: f64,

    /// Add up to 25% random jitter to each delay
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 60_000,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }
}

impl RetryConfig {
    /// Create a configuration with `max_attempts` total attempts
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Fixed `interval` between at most `max_attempts` attempts
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        let ms = interval.as_millis() as u64;
        Self {
            max_attempts,
            initial_backoff_ms: ms,
            max_backoff_ms: ms,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    /// Set initial backoff delay
    pub fn with_initial_backoff(mut self, ms: u64) -> Self {
        self.initial_backoff_ms = ms;
        self
    }

    /// Set maximum backoff delay
    pub fn with_max_backoff(mut self, ms: u64) -> Self {
        self.max_backoff_ms = ms;
        self
    }

    /// Set backoff multiplier
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay after the failed attempt with zero-based `index`
    pub fn backoff_delay(&self, index: u32) -> Duration {
        let delay_ms = (self.initial_backoff_ms as f64
            * self.backoff_multiplier.max(1.0).powi(index as i32)) as u64;

        let delay_ms = delay_ms.min(self.max_backoff_ms);

        let delay_ms = if self.jitter {
            let jitter_amount = (delay_ms as f64 * 0.25 * rand::random::<f64>()) as u64;
            delay_ms + jitter_amount
        } else {
            delay_ms
        };

        Duration::from_millis(delay_ms)
    }
}

/// Position of one call within a retry sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAttempt {
    /// Zero-based attempt number
    pub index: u32,

    /// No further attempt follows this one
    pub is_last: bool,
}

/// Execute `f` until it succeeds, fails permanently, or attempts run out.
///
/// `f` is told whether it is on its final attempt so it can choose a
/// degraded success instead of an error. `max_attempts` of zero is treated
/// as one.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, E>
where
    F: FnMut(RetryAttempt) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Classify + fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut index = 0;

    loop {
        let attempt = RetryAttempt {
            index,
            is_last: index + 1 >= max_attempts,
        };

        if index > 0 {
            info!(
                operation = operation_name,
                attempt = index,
                max_attempts = max_attempts,
                "Retrying operation"
            );
        }

        match f(attempt).await {
            Ok(result) => {
                if index > 0 {
                    info!(
                        operation = operation_name,
                        attempt = index,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                let error_class = e.classify();

                debug!(
                    operation = operation_name,
                    attempt = index,
                    error = %e,
                    classification = ?error_class,
                    "Operation failed"
                );

                if error_class == ErrorClass::Permanent {
                    error!(
                        operation = operation_name,
                        error = %e,
                        "Permanent error detected, aborting retries"
                    );
                    return Err(e);
                }

                if attempt.is_last {
                    error!(
                        operation = operation_name,
                        attempts = max_attempts,
                        error = %e,
                        "All retry attempts exhausted"
                    );
                    return Err(e);
                }

                let delay = config.backoff_delay(index);
                warn!(
                    operation = operation_name,
                    attempt = index,
                    delay_ms = delay.as_millis() as u64,
                    "Transient error, will retry after delay"
                );
                tokio::time::sleep(delay).await;
                index += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_default_is_fixed_interval() {
        let config = RetryConfig::default();
        assert_eq!(config.backoff_delay(0), Duration::from_millis(1000));
        assert_eq!(config.backoff_delay(5), Duration::from_millis(1000));
    }

    #[test]
    fn test_exponential_backoff() {
        let config = RetryConfig::new(5).with_initial_backoff(100).with_multiplier(2.0);

        assert_eq!(config.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(config.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(400));
    }

    #[test]
    fn test_max_backoff_cap() {
        let config = RetryConfig::new(10)
            .with_initial_backoff(1000)
            .with_max_backoff(5000)
            .with_multiplier(2.0);

        assert_eq!(config.backoff_delay(10), Duration::from_millis(5000));
    }

    #[test]
    fn test_jitter_bounds() {
        let config = RetryConfig::fixed(Duration::from_millis(1000), 3).with_jitter(true);
        for _ in 0..20 {
            let delay = config.backoff_delay(0);
            assert!(delay >= Duration::from_millis(1000));
            assert!(delay <= Duration::from_millis(1250));
        }
    }

    #[test]
    fn test_classify_engine_errors() {
        assert_eq!(
            EngineError::EndpointUnavailable("busy".into()).classify(),
            ErrorClass::Transient
        );
        assert_eq!(
            EngineError::Validation("empty desc".into()).classify(),
            ErrorClass::Permanent
        );
        assert_eq!(EngineError::AlreadyDispatched(1).classify(), ErrorClass::Permanent);
        assert_eq!(
            EngineError::Transport(ProviderError::Status {
                status: 503,
                body: String::new()
            })
            .classify(),
            ErrorClass::Transient
        );
        assert_eq!(
            EngineError::Transport(ProviderError::Status {
                status: 400,
                body: String::new()
            })
            .classify(),
            ErrorClass::Permanent
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_runs_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let config = RetryConfig::fixed(Duration::from_millis(500), 4);

        let counter = calls.clone();
        let result: std::result::Result<(), EngineError> =
            retry_with_backoff(&config, "always_fails", |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(EngineError::EndpointUnavailable("busy".into()))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let config = RetryConfig::fixed(Duration::from_millis(10), 5);

        let counter = calls.clone();
        let result = retry_with_backoff(&config, "flaky", |_| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(EngineError::EndpointUnavailable("busy".into()))
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_aborts() {
        let calls = Arc::new(AtomicU32::new(0));
        let config = RetryConfig::fixed(Duration::from_millis(10), 5);

        let counter = calls.clone();
        let result: std::result::Result<(), EngineError> =
            retry_with_backoff(&config, "invalid", |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(EngineError::Validation("bad".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(EngineError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_attempt_flag() {
        let config = RetryConfig::fixed(Duration::from_millis(10), 3);
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let log = seen.clone();
        let result: std::result::Result<&str, EngineError> =
            retry_with_backoff(&config, "degrade", |attempt| {
                log.lock().push(attempt);
                async move {
                    if attempt.is_last {
                        Ok("degraded")
                    } else {
                        Err(EngineError::Broker("unreachable".into()))
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "degraded");
        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], RetryAttempt { index: 0, is_last: false });
        assert_eq!(seen[2], RetryAttempt { index: 2, is_last: true });
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_attempts_still_calls_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let config = RetryConfig::new(0);

        let counter = calls.clone();
        let _: std::result::Result<(), EngineError> = retry_with_backoff(&config, "zero", |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(EngineError::EndpointUnavailable("busy".into()))
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
