use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use backoff::future::retry_notify;
use backoff::{Error as BackoffError, ExponentialBackoffBuilder};
use tracing::debug;

use super::error::StoreError;
use super::store::WriteThrottle;

const DEFAULT_MAX_ATTEMPTS: usize = 4;
const DEFAULT_INITIAL_INTERVAL_MS: u64 = 500;
const DEFAULT_MAX_INTERVAL_SECS: u64 = 16;

/// How transient store errors are retried. Auth and other permanent errors
/// are returned on the first attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one. `1` disables retries.
    pub max_attempts: usize,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    pub randomization_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_interval: Duration::from_millis(DEFAULT_INITIAL_INTERVAL_MS),
            max_interval: Duration::from_secs(DEFAULT_MAX_INTERVAL_SECS),
            multiplier: 2.0,
            randomization_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Retries with a fixed, tiny interval. Used where waiting is pointless.
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(1),
            multiplier: 1.0,
            randomization_factor: 0.0,
        }
    }

    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_multiplier(self.multiplier)
            .with_randomization_factor(self.randomization_factor)
            .with_max_interval(self.max_interval)
            .with_max_elapsed_time(None)
            .build();
        let attempts = AtomicUsize::new(0);
        let max_attempts = self.max_attempts.max(1);

        retry_notify(
            backoff,
            || {
                let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
                let fut = call();
                async move {
                    match fut.await {
                        Ok(value) => Ok(value),
                        Err(err) if err.is_transient() && attempt < max_attempts => {
                            Err(BackoffError::transient(err))
                        }
                        Err(err) => Err(BackoffError::permanent(err)),
                    }
                }
            },
            |err: StoreError, wait: Duration| {
                debug!(
                    operation,
                    error = %err,
                    wait_ms = wait.as_millis() as u64,
                    "retrying remote call"
                );
            },
        )
        .await
    }

    /// Like [`RetryPolicy::run`], but every attempt first waits on `throttle`,
    /// so retries respect the table's minimum write interval.
    pub async fn run_throttled<T, F, Fut>(
        &self,
        operation: &str,
        throttle: &WriteThrottle,
        mut call: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        self.run(operation, || {
            let fut = call();
            async move {
                throttle.wait().await;
                fut.await
            }
        })
        .await
    }
}
