//! Retry logic with exponential backoff for store operations.
//!
//! Used by [`crate::store::KvLeaseStore`] to rerun optimistic transactions that
//! lost a race, and by the lease manager to pace refreshes while the store is
//! unreachable.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{LeaseError, Result};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first (default: 5).
    pub max_retries: u32,
    /// Initial backoff in milliseconds (default: 10).
    pub initial_backoff_ms: u64,
    /// Maximum backoff in milliseconds (default: 5000).
    pub max_backoff_ms: u64,
    /// Multiplier for exponential backoff (default: 2.0).
    pub backoff_multiplier: f64,
    /// Whether to add random jitter to backoff (default: true).
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 10,
            max_backoff_ms: 5_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Executor for retry operations.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create a new RetryExecutor with the given configuration.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// The configuration in use.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Execute an operation with retry logic.
    ///
    /// Only retryable errors (see [`LeaseError::is_retryable`]) are retried;
    /// anything else, or the last error once retries run out, is returned.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let backoff = self.backoff(attempt);
                    debug!(attempt, error = %e, ?backoff, "retrying store operation");
                    attempt += 1;
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Backoff before retry number `attempt` (zero based).
    ///
    /// Computes `initial * multiplier^attempt`, capped at the maximum. Jitter
    /// adds up to half of the computed delay, still within the cap.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.initial_backoff_ms as f64;
        let max = self.config.max_backoff_ms as f64;
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let capped = (base * self.config.backoff_multiplier.powi(exponent)).min(max);

        let mut delay_ms = capped as u64;
        if self.config.jitter && delay_ms > 1 {
            delay_ms += rand::thread_rng().gen_range(0..=delay_ms / 2);
            delay_ms = delay_ms.min(self.config.max_backoff_ms);
        }
        Duration::from_millis(delay_ms)
    }
}

/// Returns an error describing exhausted retries, keeping the last cause.
pub fn exhausted(last: LeaseError, attempts: u32) -> LeaseError {
    match last {
        LeaseError::Conflict(what) => {
            LeaseError::Store(format!("gave up after {} conflicting attempts on {}", attempts, what))
        }
        other => other,
    }
}
