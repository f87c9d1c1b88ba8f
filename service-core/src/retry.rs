//! Retry utilities for calls to unreliable upstream APIs.
//!
//! Provides configurable retry logic with exponential backoff. Errors decide
//! for themselves whether they are worth retrying through [`Retryable`].

use crate::clock::Clock;
use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// How an error asks to be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryHint {
    /// Not retryable; return to the caller as-is.
    Never,
    /// Retry after the next exponential backoff step.
    Backoff,
    /// Retry no earlier than the given delay (server mandated).
    After(Duration),
}

/// Classification hook for error types passed through [`retry_call`].
pub trait Retryable {
    fn retry_hint(&self) -> RetryHint;
}

/// Configuration for retry behavior.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt).
    pub max_retries: u32,
    /// Initial backoff duration before first retry.
    pub initial_backoff: Duration,
    /// Maximum backoff duration.
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to backoff duration.
    pub add_jitter: bool,
    /// Longest server-mandated delay we are willing to wait inside one call.
    pub max_mandated_wait: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            add_jitter: true,
            max_mandated_wait: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Create a new retry config with the specified max retries.
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Calculate backoff duration for a given attempt.
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let backoff =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let backoff_ms = backoff.min(self.max_backoff.as_millis() as f64) as u64;

        let mut duration = Duration::from_millis(backoff_ms);

        if self.add_jitter {
            // Add up to 25% jitter
            let factor: f64 = rand::thread_rng().gen_range(0.0..1.0);
            let jitter = (backoff_ms as f64 * 0.25 * factor) as u64;
            duration += Duration::from_millis(jitter);
        }

        duration
    }
}

/// Execute a call with retry logic.
///
/// # Arguments
/// * `config` - Retry configuration
/// * `clock` - Delay primitive used between attempts
/// * `operation_name` - Name of the operation for logging
/// * `f` - The async function that performs the call
pub async fn retry_call<F, Fut, T, E>(
    config: &RetryConfig,
    clock: &dyn Clock,
    operation_name: &str,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let mut attempt = 0;

    loop {
        match f().await {
            Ok(result) => {
                if attempt > 0 {
                    info!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "Call succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) => {
                let delay = match err.retry_hint() {
                    RetryHint::Never => {
                        warn!(
                            operation = operation_name,
                            error = %err,
                            "Call failed with non-retryable error"
                        );
                        return Err(err);
                    }
                    RetryHint::Backoff => config.backoff_duration(attempt),
                    RetryHint::After(mandated) => {
                        if mandated > config.max_mandated_wait {
                            warn!(
                                operation = operation_name,
                                retry_after_ms = mandated.as_millis(),
                                "Mandated delay exceeds ceiling, not retrying"
                            );
                            return Err(err);
                        }
                        mandated
                    }
                };

                if attempt >= config.max_retries {
                    warn!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        error = %err,
                        "Call failed after max retries"
                    );
                    return Err(err);
                }

                warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    error = %err,
                    backoff_ms = delay.as_millis(),
                    "Call failed, retrying after backoff"
                );

                clock.sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
