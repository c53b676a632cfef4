//! Retry Handler
//!
//! Async retry-with-backoff combinator shared by the connection clients and
//! the shutdown reporters. It knows nothing about transports: callers decide
//! which errors are worth another attempt.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::RetryConfig;

/// Fraction of the computed delay used as the jitter window (±25%)
const JITTER_RATIO: f64 = 0.25;

/// Backoff policy, immutable per handler
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts for one logical operation (0 behaves like 1)
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Build a policy from the `[retry]` configuration section
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.retry_delay,
            max_delay: config.max_delay,
            backoff_factor: config.backoff_factor,
            jitter: config.jitter,
        }
    }

    /// Same policy with a different attempt budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Un-jittered delay slept after a failed `attempt` (1-based)
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let secs = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);

        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }

    /// Delay slept after a failed `attempt`, jittered when enabled
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }

        let spread = delay.as_secs_f64() * JITTER_RATIO;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.0))
    }
}

/// Failure of a retried operation
#[derive(Debug, Error)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// Every attempt failed; carries the last underlying error
    #[error("{operation} failed after {attempts} attempt(s): {source}")]
    Exhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: E,
    },

    /// The error was not eligible for retry
    #[error("{operation} aborted on attempt {attempt}: {source}")]
    Aborted {
        operation: String,
        attempt: u32,
        #[source]
        source: E,
    },
}

impl<E> RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// Attempts made before giving up
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } => *attempts,
            RetryError::Aborted { attempt, .. } => *attempt,
        }
    }

    pub fn last_error(&self) -> &E {
        match self {
            RetryError::Exhausted { source, .. } | RetryError::Aborted { source, .. } => source,
        }
    }

    pub fn into_last_error(self) -> E {
        match self {
            RetryError::Exhausted { source, .. } | RetryError::Aborted { source, .. } => source,
        }
    }
}

/// Runs an operation until it succeeds or the policy's attempt budget is spent
#[derive(Debug, Clone, Default)]
pub struct RetryHandler {
    policy: RetryPolicy,
}

impl RetryHandler {
    /// Create a new retry handler
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Retry `operation` on every error
    pub async fn execute<T, E, F, Fut>(&self, name: &str, operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        self.execute_if(name, operation, |_| true).await
    }

    /// Retry `operation` while `should_retry` accepts the error.
    ///
    /// The operation receives the 1-based attempt number. A rejected error
    /// stops the loop immediately with [`RetryError::Aborted`].
    pub async fn execute_if<T, E, F, Fut, P>(
        &self,
        name: &str,
        mut operation: F,
        should_retry: P,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
        P: Fn(&E) -> bool,
    {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 1;

        loop {
            debug!(operation = name, attempt, max_attempts, "Starting attempt");

            let error = match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!("{} succeeded on attempt {}/{}", name, attempt, max_attempts);
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !should_retry(&error) {
                warn!(
                    operation = name,
                    attempt,
                    error = %error,
                    "Error is not retryable, giving up"
                );
                return Err(RetryError::Aborted {
                    operation: name.to_string(),
                    attempt,
                    source: error,
                });
            }

            if attempt >= max_attempts {
                warn!("{} failed after {} attempt(s): {}", name, attempt, error);
                return Err(RetryError::Exhausted {
                    operation: name.to_string(),
                    attempts: attempt,
                    source: error,
                });
            }

            let delay = self.policy.delay_for(attempt);
            warn!(
                operation = name,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
