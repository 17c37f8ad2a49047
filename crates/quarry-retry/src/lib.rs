//! Retry engine: exponential backoff with jitter and terminal-error
//! classification.
//!
//! Delay calculation is pure; [`retry_with_backoff`] drives an async
//! operation, sleeping between retryable failures and stopping immediately
//! on terminal ones. Callers receive the full error history so the last
//! error is never the only diagnostic.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Configuration for retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first try.
    pub max_attempts: u32,
    /// Initial delay in milliseconds.
    pub initial_delay_ms: f64,
    /// Ceiling on the computed delay in milliseconds.
    pub max_delay_ms: f64,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to apply ±25% random jitter.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 250.0,
            max_delay_ms: 1000.0,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Whether a failure is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Retryable,
    Terminal,
}

/// Outcome of a retried operation.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    /// Attempts actually made (1-based).
    pub attempts: u32,
    /// Stringified error from each failed attempt, in order.
    pub error_history: Vec<String>,
}

impl<T, E> RetryOutcome<T, E> {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

/// Compute the backoff delay for a 0-based attempt index:
/// `min(max_delay, initial · multiplier^attempt)`, scaled by a jitter
/// factor drawn uniformly from [0.75, 1.25] when enabled.
#[must_use]
pub fn calculate_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let mut delay_ms = (config.initial_delay_ms * config.backoff_multiplier.powi(attempt as i32))
        .min(config.max_delay_ms);

    if config.jitter {
        let factor: f64 = rand::thread_rng().gen_range(0.75..=1.25);
        delay_ms *= factor;
    }

    Duration::from_secs_f64(delay_ms / 1000.0)
}

/// Execute `op` with retry and exponential backoff.
///
/// `classify` decides whether a given error is retryable; terminal errors
/// end the loop immediately. No sleep happens after the final attempt.
pub async fn retry_with_backoff<T, E, F, Fut>(
    mut op: F,
    config: &RetryConfig,
    classify: impl Fn(&E) -> RetryClass,
    operation_name: &str,
) -> RetryOutcome<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut error_history = Vec::new();

    for attempt in 0..config.max_attempts {
        debug!(
            operation = operation_name,
            attempt = attempt + 1,
            max_attempts = config.max_attempts,
            "attempting operation"
        );

        match op().await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt + 1,
                    error_history,
                };
            }
            Err(err) => {
                error_history.push(err.to_string());

                if classify(&err) == RetryClass::Terminal {
                    warn!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        error = %err,
                        "non-retryable error, giving up"
                    );
                    return RetryOutcome {
                        result: Err(err),
                        attempts: attempt + 1,
                        error_history,
                    };
                }

                if attempt + 1 < config.max_attempts {
                    let delay = calculate_delay(attempt, config);
                    warn!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retryable failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                } else {
                    return RetryOutcome {
                        result: Err(err),
                        attempts: attempt + 1,
                        error_history,
                    };
                }
            }
        }
    }

    unreachable!("retry loop returns from within")
}
