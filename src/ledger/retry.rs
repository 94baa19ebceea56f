//! Exponential backoff for transient storage failures.

use crate::error::Result;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Retry policy for ledger I/O.
///
/// # Default Values
///
/// - `max_retries`: 3
/// - `initial_delay`: 50ms
/// - `max_delay`: 2 seconds
/// - `multiplier`: 2
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap on the delay between retries.
    pub max_delay: Duration,
    /// Factor applied to the delay after each retry.
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based), capped at `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Run `operation`, retrying while it fails with a transient error.
///
/// Non-transient errors are returned immediately. The operation must be
/// safe to repeat: ledger writes re-read state and re-apply their change on
/// every attempt.
///
/// # Errors
///
/// Returns the last error once retries are exhausted, or the first
/// non-transient error.
pub async fn retry_transient<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    info!("{operation_name} succeeded after {attempt} retries");
                }
                return Ok(value);
            }
            Err(err) if err.is_transient() && attempt < policy.max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    "{operation_name} failed ({err}); retrying in {}ms",
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
