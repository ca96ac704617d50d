//! Bounded retry with exponential backoff.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::config::{QueueConfig, WriterConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, max_retries: u32) -> Self {
        Self {
            base,
            max,
            max_retries,
        }
    }

    pub fn for_publish(config: &QueueConfig) -> Self {
        Self::new(
            Duration::from_millis(config.publish_backoff_ms),
            Duration::from_millis(config.publish_backoff_max_ms),
            config.publish_retries,
        )
    }

    pub fn for_writes(config: &WriterConfig) -> Self {
        Self::new(
            Duration::from_millis(config.retry_base_delay_ms),
            Duration::from_millis(config.retry_max_delay_ms),
            config.max_retries,
        )
    }

    /// Delay before retry `attempt` (0-based): `base * 2^attempt`, capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Sum of every retry delay, i.e. the longest a failing operation waits.
    pub fn total_delay(&self) -> Duration {
        (0..self.max_retries).map(|attempt| self.delay(attempt)).sum()
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E: std::error::Error + 'static> {
    #[error("{operation} failed after {attempts} attempts: {source}")]
    Exhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: E,
    },

    #[error("{operation} failed permanently: {source}")]
    Permanent {
        operation: &'static str,
        #[source]
        source: E,
    },
}

impl<E: std::error::Error + 'static> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { source, .. } | RetryError::Permanent { source, .. } => source,
        }
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// uses up `backoff.max_retries` retries.
pub async fn retry_with_backoff<F, Fut, T, E>(
    backoff: &Backoff,
    operation_name: &'static str,
    is_retryable: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::error::Error + 'static,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if !is_retryable(&err) => {
                return Err(RetryError::Permanent {
                    operation: operation_name,
                    source: err,
                })
            }
            Err(err) if attempt >= backoff.max_retries => {
                return Err(RetryError::Exhausted {
                    operation: operation_name,
                    attempts: attempt + 1,
                    source: err,
                })
            }
            Err(err) => {
                let delay = backoff.delay(attempt);
                debug!(
                    operation = operation_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after delay"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
