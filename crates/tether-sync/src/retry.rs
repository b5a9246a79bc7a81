//! One reusable retry-with-timeout policy.
//!
//! Bootstrap requests and the health poll all go through this instead of
//! carrying their own backoff loops.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{SyncError, SyncResult};

/// Exponential backoff with a per-attempt timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Budget for each individual attempt.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Backoff delay after the given 1-based attempt: doubles from the
    /// base, capped at the maximum.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1 << exponent);
        delay.min(self.max_delay)
    }

    /// Runs `op` until it succeeds or attempts are exhausted, surfacing
    /// the last error. Cancellation short-circuits without further
    /// attempts.
    ///
    /// # Errors
    /// Returns the last attempt's error once `max_attempts` is reached.
    pub async fn run<T, F, Fut>(&self, name: &str, mut op: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let mut last: Option<SyncError> = None;
        for attempt in 1..=self.max_attempts.max(1) {
            match tokio::time::timeout(self.timeout, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) if err.is_cancelled() => return Err(err),
                Ok(Err(err)) => {
                    warn!(request = name, attempt, error = %err, "request attempt failed");
                    last = Some(err);
                }
                Err(_) => {
                    let err = SyncError::timeout(format!(
                        "{name} timed out after {}ms",
                        self.timeout.as_millis()
                    ));
                    warn!(request = name, attempt, error = %err, "request attempt timed out");
                    last = Some(err);
                }
            }
            if attempt < self.max_attempts {
                tokio::time::sleep(self.delay_for(attempt)).await;
            }
        }
        Err(last.unwrap_or_else(|| SyncError::transport(format!("{name} failed"))))
    }
}
