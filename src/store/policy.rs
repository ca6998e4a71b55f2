//! Deadline + retry policy applied to every store call.

use crate::config::QueryConfig;
use crate::error::StoreError;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct QueryPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for QueryPolicy {
    fn default() -> Self {
        Self::from_config(&QueryConfig::default())
    }
}

impl QueryPolicy {
    pub fn from_config(config: &QueryConfig) -> Self {
        Self {
            timeout: config.timeout(),
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Run `query` under the per-attempt deadline, retrying retryable failures with
    /// exponential backoff. Non-retryable errors return immediately.
    pub async fn run<T, F, Fut>(&self, op: &'static str, query: F) -> Result<T, StoreError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut backoff = self.initial_backoff;
        let mut attempt = 0u32;

        loop {
            let err = match timeout(self.timeout, query()).await {
                Ok(Ok(value)) => {
                    if attempt > 0 {
                        debug!(op, attempt, "store query succeeded after retry");
                    }
                    return Ok(value);
                }
                Ok(Err(e)) if !e.is_retryable() => return Err(e),
                Ok(Err(e)) => e,
                Err(_) => StoreError::Timeout {
                    after: self.timeout,
                },
            };

            if attempt >= self.max_retries {
                warn!(op, attempts = attempt + 1, error = %err, "store query failed");
                return Err(err);
            }

            warn!(
                op,
                attempt = attempt + 1,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "retrying store query"
            );
            sleep(backoff).await;
            backoff = (backoff * 2).min(self.max_backoff);
            attempt += 1;
        }
    }
}
