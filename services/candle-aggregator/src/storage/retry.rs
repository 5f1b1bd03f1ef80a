//! Per-call timeout and exponential backoff for collaborator calls

use anyhow::{Result, anyhow};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Timeout and retry policy applied to every cache and sink call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before giving up, at least one
    pub max_attempts: u32,
    /// Delay before the second attempt, doubled for each further one
    pub base_delay: Duration,
    /// Upper bound for one attempt
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            call_timeout: Duration::from_millis(5000),
        }
    }
}

impl RetryPolicy {
    /// Single attempt under the call timeout
    #[must_use]
    pub const fn no_retry(call_timeout: Duration) -> Self {
        Self { max_attempts: 1, base_delay: Duration::ZERO, call_timeout }
    }

    /// Backoff before attempt `attempt + 1`: base, 2x base, 4x base, ...
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
    }

    /// Run `op` once under the call timeout
    pub async fn timed<T, Fut>(&self, operation: &str, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("{operation} timed out after {:?}", self.call_timeout)),
        }
    }

    /// Run `op` with timeout and exponential backoff until it succeeds
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.timed(operation, op()).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        "{operation} failed (attempt {attempt}/{attempts}), retrying in {delay:?}: {e:#}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(e.context(format!("{operation} failed after {attempts} attempts")));
                }
            }
        }
    }
}
