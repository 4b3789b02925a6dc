//! Mutual exclusion and pacing around external rate limits
//!
//! Provider quotas are shared by every enrichment child running in the
//! process. Reads of a quota go through [`CreditsCache`], which holds a
//! per-source [`RateLimitLock`] while it refreshes, so at most one task asks
//! the provider at a time.

use governor::{Quota, RateLimiter};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{SinkError, SinkResult};

/// Keyed mutex with an acquire timeout
#[derive(Clone, Default)]
pub struct RateLimitLock {
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl RateLimitLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock named `key`, giving up after `timeout`
    ///
    /// The lock is released when the returned guard is dropped.
    pub async fn acquire(&self, key: &str, timeout: Duration) -> SinkResult<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(key.to_string()).or_default().clone()
        };

        match tokio::time::timeout(timeout, lock.lock_owned()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                tracing::warn!(lock = key, timeout_ms = timeout.as_millis() as u64, "Lock acquire timed out");
                Err(SinkError::LockTimeout(key.to_string()))
            }
        }
    }
}

/// Short-lived cache of each source's "has remaining credits" answer
pub struct CreditsCache {
    ttl: Duration,
    lock_timeout: Duration,
    lock: RateLimitLock,
    entries: Mutex<HashMap<String, (bool, Instant)>>,
}

impl CreditsCache {
    pub fn new(ttl: Duration, lock_timeout: Duration, lock: RateLimitLock) -> Self {
        Self {
            ttl,
            lock_timeout,
            lock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Cached answer for `source`, refreshing through `check` when stale
    pub async fn has_remaining_credits<F, Fut>(&self, source: &str, check: F) -> SinkResult<bool>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = SinkResult<bool>>,
    {
        if let Some(cached) = self.fresh(source).await {
            return Ok(cached);
        }

        let _guard = self
            .lock
            .acquire(&format!("enrichment-credits:{}", source), self.lock_timeout)
            .await?;

        // another task may have refreshed while we waited
        if let Some(cached) = self.fresh(source).await {
            return Ok(cached);
        }

        let remaining = check().await?;
        tracing::debug!(source, remaining, "Refreshed provider credits");
        self.entries
            .lock()
            .await
            .insert(source.to_string(), (remaining, Instant::now()));
        Ok(remaining)
    }

    async fn fresh(&self, source: &str) -> Option<bool> {
        let entries = self.entries.lock().await;
        entries
            .get(source)
            .filter(|(_, at)| at.elapsed() < self.ttl)
            .map(|(remaining, _)| *remaining)
    }
}

/// Request pacing for provider calls
pub struct RequestPacer {
    limiter: RateLimiter<
        governor::state::direct::NotKeyed,
        governor::state::InMemoryState,
        governor::clock::DefaultClock,
    >,
}

impl RequestPacer {
    /// Allow `per_second` requests per second (zero is treated as one)
    pub fn per_second(per_second: u32) -> Self {
        let rate = NonZeroU32::new(per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: RateLimiter::direct(Quota::per_second(rate)),
        }
    }

    /// Wait until the next request is permitted
    pub async fn ready(&self) {
        self.limiter.until_ready().await;
    }
}
