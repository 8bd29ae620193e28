use crate::{Result, SchedulerError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Bounded exponential backoff for transient accessor failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// Run `operation`, retrying transient errors. Other errors return at once.
    pub async fn execute_with_retry<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_transient() => {
                    if attempt < self.max_retries {
                        let delay = self.calculate_delay(attempt);
                        debug!(
                            "Transient failure: {}, retrying in {:?} (attempt {}/{})",
                            e,
                            delay,
                            attempt + 1,
                            self.max_retries
                        );
                        tokio::time::sleep(delay).await;
                    }
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error
            .unwrap_or_else(|| SchedulerError::internal_error("All retries exhausted")))
    }

    /// Delay before the retry following `attempt`
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.min(31));
        std::cmp::min(self.base_delay.saturating_mul(factor), self.max_delay)
    }
}
