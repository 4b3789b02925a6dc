//! Background units of work with explicit retry policies
//!
//! A spawned unit either follows its parent's cancellation token or is
//! detached from it (abandon-on-cancel), in which case it always runs to
//! completion or exhausts its retries.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Disposition, SinkError, SinkResult};

/// Bounded exponential retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub initial_interval_secs: u64,
    pub backoff_coefficient: f64,
    pub maximum_interval_secs: u64,
    /// Total attempts including the first one
    pub maximum_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval_secs: 15,
            backoff_coefficient: 2.0,
            maximum_interval_secs: 60,
            maximum_attempts: 4,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based)
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1) as i32;
        let secs = self.initial_interval_secs as f64 * self.backoff_coefficient.powi(exp);
        let capped = secs.min(self.maximum_interval_secs as f64).max(0.0);
        Duration::from_secs_f64(capped)
    }
}

/// Options for one spawned unit of work
#[derive(Debug, Clone)]
pub struct TaskOptions {
    pub name: String,
    /// Per-attempt timeout
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// When set the task ignores the parent's cancellation
    pub detach: bool,
}

/// Run `operation` under `options`, retrying retryable failures
pub async fn run_with_policy<F, Fut, T>(options: &TaskOptions, mut operation: F) -> SinkResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SinkResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let outcome = match tokio::time::timeout(options.timeout, operation()).await {
            Ok(result) => result,
            Err(_) => Err(SinkError::Internal(format!(
                "task '{}' timed out after {:?}",
                options.name, options.timeout
            ))),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(err) => {
                if err.disposition() != Disposition::Retry
                    || attempt >= options.retry.maximum_attempts
                {
                    warn!(task = %options.name, attempt, error = %err, "Task failed permanently");
                    return Err(err);
                }
                let delay = options.retry.delay_for_retry(attempt);
                debug!(task = %options.name, attempt, delay_ms = delay.as_millis() as u64, error = %err, "Task failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Spawn a unit of work on the runtime
///
/// Non-detached tasks stop at the next await point once `parent` is
/// cancelled and report an internal error.
pub fn spawn_task<F, Fut, T>(
    options: TaskOptions,
    parent: &CancellationToken,
    operation: F,
) -> JoinHandle<SinkResult<T>>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = SinkResult<T>> + Send + 'static,
    T: Send + 'static,
{
    let token = parent.clone();
    tokio::spawn(async move {
        if options.detach {
            return run_with_policy(&options, operation).await;
        }
        tokio::select! {
            result = run_with_policy(&options, operation) => result,
            _ = token.cancelled() => Err(SinkError::Internal(format!(
                "task '{}' cancelled",
                options.name
            ))),
        }
    })
}
