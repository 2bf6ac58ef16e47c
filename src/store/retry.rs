//! Retry policy for recoverable storage failures.
//!
//! Exponential backoff with ±20% randomization: 100 ms base, doubling per
//! attempt, capped at 5 s, up to 5 retries. Only errors classified as
//! recoverable (see [`crate::errors::RECOVERABLE_STORAGE_PATTERNS`]) are
//! retried; everything else surfaces immediately.

use std::future::Future;
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use tokio::time::sleep;
use tracing::warn;

use crate::errors::{YokeError, YokeResult};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(self.initial_backoff_ms),
            randomization_factor: 0.2,
            multiplier: 2.0,
            max_interval: Duration::from_millis(self.max_backoff_ms),
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }

    /// Run `operation` until it succeeds, fails non-recoverably, or the
    /// retry budget is exhausted.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> YokeResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = YokeResult<T>>,
    {
        let mut backoff = self.backoff();
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(err) => {
                    if !err.is_recoverable() || attempt >= self.max_retries {
                        return Err(err);
                    }

                    let delay = backoff
                        .next_backoff()
                        .unwrap_or(Duration::from_millis(self.max_backoff_ms));
                    warn!(
                        attempt = attempt + 1,
                        max = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying storage operation"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
