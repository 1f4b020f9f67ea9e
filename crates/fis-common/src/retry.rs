//! Bounded retry with linearly increasing delays.
//!
//! Used where a call is expected to fail for a short while after a
//! dependency was created, such as an EKS access entry for an IAM role
//! that has not propagated yet. Every attempt is preceded by a delay of
//! `step * attempt`, so three attempts with a 5s step wait 5s, 10s and 15s.
//!
//! # Example
//!
//! ```ignore
//! use fis_common::retry::{retry_with_linear_backoff, RetryConfig};
//!
//! retry_with_linear_backoff(
//!     &RetryConfig::linear(3, Duration::from_secs(5)),
//!     "create_access_entry",
//!     || async { eks.create_access_entry(&cluster, &role, &user).await },
//! ).await?;
//! ```

use std::time::Duration;

use tracing::{error, warn};

/// Configuration for a bounded linear retry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts, including the first (minimum 1)
    pub max_attempts: u32,
    /// Delay increment; attempt `n` waits `step * n` first
    pub step: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::linear(3, Duration::from_secs(5))
    }
}

impl RetryConfig {
    /// Retry `max_attempts` times with delays of step, 2*step, 3*step...
    pub fn linear(max_attempts: u32, step: Duration) -> Self {
        Self { max_attempts, step }
    }

    /// A single attempt with no delay
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            step: Duration::ZERO,
        }
    }

    /// Delay that precedes the given 1-based attempt
    pub fn delay_before(&self, attempt: u32) -> Duration {
        self.step * attempt
    }
}

/// Execute an async operation with linearly increasing delays between attempts.
///
/// Returns the first success, or the last error once `max_attempts` is spent.
pub async fn retry_with_linear_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let delay = config.delay_before(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt >= max_attempts => {
                error!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    "Operation failed after max retries"
                );
                return Err(e);
            }
            Err(e) => {
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    next_delay_ms = config.delay_before(attempt + 1).as_millis(),
                    "Operation failed, retrying"
                );
            }
        }
    }
}
