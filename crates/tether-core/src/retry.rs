//! Bounded retry with exponential backoff
//!
//! Transient failures (see [`Error::is_transient`]) are retried up to
//! `max_attempts`; everything else fails immediately. Exhausting the budget
//! escalates to [`Error::RetriesExhausted`].

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Backoff parameters
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Total attempts including the first one
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let initial_ms = self.initial_delay.as_millis().min(u64::MAX as u128) as u64;
        let max_ms = self.max_delay.as_millis().min(u64::MAX as u128) as u64;
        let exp = attempt.min(31) as i32;
        let delay_ms = (initial_ms as f64 * self.backoff_factor.max(1.0).powi(exp)).min(max_ms as f64);
        Duration::from_millis(delay_ms as u64)
    }
}

/// Run `operation` under `policy`
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, name: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(operation = name, attempts = attempt + 1, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => {
                attempt += 1;
                if attempt >= max_attempts {
                    warn!(operation = name, attempts = attempt, error = %e, "Retries exhausted");
                    return Err(Error::RetriesExhausted {
                        operation: name.to_string(),
                        attempts: attempt,
                        last: e.to_string(),
                    });
                }
                let delay = policy.delay_for_attempt(attempt - 1);
                debug!(operation = name, attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
