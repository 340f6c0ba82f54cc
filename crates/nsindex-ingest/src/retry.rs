//! Bounded retry with exponential backoff for store operations.

use crate::{Error, Result};
use metrics::counter;
use std::future::Future;
use std::time::Duration;

/// How transient store failures are retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay after the first failure; doubles on each further failure.
    pub base_delay: Duration,
    /// Upper bound on a single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `failures + 1`, after `failures` failures.
    pub fn delay_after(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let shift = failures.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }

    /// Run `operation` until it succeeds, fails permanently, or runs out of
    /// attempts.
    ///
    /// Only errors for which [`Error::is_transient`] holds are retried.
    /// Exhaustion is reported as [`Error::RetriesExhausted`].
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut failures = 0u32;

        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    failures += 1;
                    if failures >= max_attempts {
                        tracing::error!(
                            "{} failed after {} attempts: {}",
                            operation,
                            failures,
                            e
                        );
                        return Err(Error::RetriesExhausted {
                            operation,
                            attempts: failures,
                            source: Box::new(e),
                        });
                    }

                    let delay = self.delay_after(failures);
                    tracing::warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        operation,
                        failures,
                        max_attempts,
                        delay,
                        e
                    );
                    counter!("index_store_retries_total").increment(1);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Like [`RetryPolicy::run`] for a synchronous store call.
    ///
    /// Each attempt runs on the blocking pool, so a slow store never holds a
    /// runtime worker and the calling task stays cancellable. A cancelled
    /// caller abandons the attempt in flight; it still runs to completion.
    pub async fn run_blocking<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn() -> Result<T> + Clone + Send + 'static,
    {
        self.run(operation, || {
            let attempt = f.clone();
            async move { tokio::task::spawn_blocking(attempt).await? }
        })
        .await
    }
}
