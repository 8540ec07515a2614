//! Cache-aside fetch guard.
//!
//! `FetchGuard::fetch` serves a fresh cached value when it can. Otherwise it
//! takes the `fetch:<resource_id>` lock, so at most one fetch per resource is
//! in flight across every process sharing the lock service, then retries
//! with backoff. When every attempt fails, a stale cached value is served
//! instead of an error.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chainrange_fetch::{FetchGuard, FetchGuardConfig, MemoryCache, MemoryLockService, Retryable};
//!
//! #[derive(Debug, thiserror::Error)]
//! #[error("rpc down")]
//! struct RpcDown;
//! impl Retryable for RpcDown {
//!     fn is_retryable(&self) -> bool { true }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let guard = FetchGuard::new(
//!     Arc::new(MemoryCache::new()),
//!     Arc::new(MemoryLockService::new()),
//!     FetchGuardConfig::default(),
//! );
//! let head: u64 = guard
//!     .fetch("ethereum:head", "ethereum:rpc", || async { Ok::<_, RpcDown>(19_000_000) })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn, Level};

use crate::backoff::{Backoff, BackoffConfig};
use crate::cache::{CacheEntry, CacheStore};
use crate::error::{GuardError, LockError, Retryable};
use crate::lock::LockService;

fn default_lock_lease_ms() -> u64 {
    2 * 60 * 1_000
}

fn default_lock_timeout_ms() -> u64 {
    2 * 60 * 1_000
}

/// Configuration for [`FetchGuard`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchGuardConfig {
    /// Maximum age of a cached value served without refetching.
    /// `None` serves any cached value.
    #[serde(default)]
    pub ttl_ms: Option<u64>,
    /// How long a fetch may hold the resource lock.
    #[serde(default = "default_lock_lease_ms")]
    pub lock_lease_ms: u64,
    /// How long to wait for the lock before counting the attempt as failed.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for FetchGuardConfig {
    fn default() -> Self {
        Self {
            ttl_ms: None,
            lock_lease_ms: default_lock_lease_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl FetchGuardConfig {
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_ms.map(Duration::from_millis)
    }
}

enum AttemptError<E> {
    Lock(LockError),
    Fetch(E),
}

impl<E: fmt::Display> fmt::Display for AttemptError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lock(e) => e.fmt(f),
            Self::Fetch(e) => e.fmt(f),
        }
    }
}

/// Deduplicates, retries and caches fetches of external resources.
pub struct FetchGuard {
    cache: Arc<dyn CacheStore>,
    locks: Arc<dyn LockService>,
    config: FetchGuardConfig,
    backoff: Backoff,
}

impl FetchGuard {
    pub fn new(cache: Arc<dyn CacheStore>, locks: Arc<dyn LockService>, config: FetchGuardConfig) -> Self {
        let backoff = Backoff::new(config.backoff.clone());
        Self {
            cache,
            locks,
            config,
            backoff,
        }
    }

    pub fn config(&self) -> &FetchGuardConfig {
        &self.config
    }

    /// Return the value cached under `key`, fetching it with `do_fetch` when
    /// missing or expired.
    ///
    /// `resource_id` names the external resource being hit (an endpoint, an
    /// API); fetches sharing it never run concurrently.
    pub async fn fetch<V, E, F, Fut>(
        &self,
        key: &str,
        resource_id: &str,
        mut do_fetch: F,
    ) -> Result<V, GuardError<E>>
    where
        V: Serialize + DeserializeOwned,
        E: Retryable + fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let cached = self.read_cache::<V>(key).await;
        if let Some((value, true)) = cached {
            debug!(key, "serving fresh cached value");
            return Ok(value);
        }
        let stale = cached.map(|(value, _)| value);

        let lock_id = format!("fetch:{resource_id}");
        let max_attempts = self.backoff.max_attempts().max(1);
        let mut attempts = 0;
        let mut last_error = None;
        for attempt in 1..=max_attempts {
            let delay = self.backoff.delay(attempt, &mut rand::thread_rng());
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            attempts = attempt;
            match self.attempt(key, &lock_id, &mut do_fetch).await {
                Ok(value) => return Ok(value),
                Err(AttemptError::Fetch(e)) if !e.is_retryable() => {
                    warn!(key, resource_id, error = %e, "fetch failed with a non-retryable error");
                    last_error = Some(GuardError::NonRetryable {
                        resource_id: resource_id.to_string(),
                        source: e,
                    });
                    break;
                }
                Err(e) => {
                    log_failed_attempt(attempt, max_attempts, key, resource_id, &e);
                    last_error = Some(match e {
                        AttemptError::Lock(source) => GuardError::Lock {
                            resource_id: resource_id.to_string(),
                            attempts: attempt,
                            source,
                        },
                        AttemptError::Fetch(source) => GuardError::Exhausted {
                            resource_id: resource_id.to_string(),
                            attempts: attempt,
                            source,
                        },
                    });
                }
            }
        }

        if let Some(value) = stale {
            warn!(key, resource_id, attempts, "fetch failed, serving stale cached value");
            return Ok(value);
        }
        match last_error {
            Some(e) => Err(e),
            // unreachable with max_attempts >= 1
            None => Err(GuardError::Lock {
                resource_id: resource_id.to_string(),
                attempts,
                source: LockError::Backend("no fetch attempt was made".into()),
            }),
        }
    }

    /// One locked attempt: re-check the cache, fetch, write back.
    async fn attempt<V, E, F, Fut>(
        &self,
        key: &str,
        lock_id: &str,
        do_fetch: &mut F,
    ) -> Result<V, AttemptError<E>>
    where
        V: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let lease = Duration::from_millis(self.config.lock_lease_ms);
        let timeout = Duration::from_millis(self.config.lock_timeout_ms);
        let token = self
            .locks
            .acquire(lock_id, lease, timeout)
            .await
            .map_err(AttemptError::Lock)?;

        let result = match self.read_cache::<V>(key).await {
            // refreshed by another holder while we waited for the lock
            Some((value, true)) => {
                debug!(key, "cache refreshed while waiting for lock");
                Ok(value)
            }
            _ => match do_fetch().await {
                Ok(value) => {
                    self.write_cache(key, &value).await;
                    Ok(value)
                }
                Err(e) => Err(AttemptError::Fetch(e)),
            },
        };

        if let Err(e) = self.locks.release(&token).await {
            warn!(lock_id, error = %e, "failed to release fetch lock");
        }
        result
    }

    /// Cached value and whether it is still fresh. Unreadable entries count
    /// as missing.
    async fn read_cache<V: DeserializeOwned>(&self, key: &str) -> Option<(V, bool)> {
        let entry = match self.cache.get(key).await {
            Ok(entry) => entry?,
            Err(e) => {
                warn!(key, error = %e, "cache read failed");
                return None;
            }
        };
        let fresh = entry.is_fresh(self.config.ttl(), Utc::now());
        match serde_json::from_value(entry.value) {
            Ok(value) => Some((value, fresh)),
            Err(e) => {
                warn!(key, error = %e, "cached value has an unexpected shape");
                None
            }
        }
    }

    async fn write_cache<V: Serialize>(&self, key: &str, value: &V) {
        let value = match serde_json::to_value(value) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "value is not serializable, not caching it");
                return;
            }
        };
        if let Err(e) = self.cache.put(key, CacheEntry::now(value)).await {
            warn!(key, error = %e, "cache write failed");
        }
    }
}

/// Severity grows with the attempt number: early failures are routine.
fn attempt_log_level(attempt: u32) -> Level {
    match attempt {
        0..=2 => Level::DEBUG,
        3..=4 => Level::INFO,
        5..=7 => Level::WARN,
        _ => Level::ERROR,
    }
}

fn log_failed_attempt<E: fmt::Display>(
    attempt: u32,
    max_attempts: u32,
    key: &str,
    resource_id: &str,
    error: &AttemptError<E>,
) {
    let level = attempt_log_level(attempt);
    if level == Level::DEBUG {
        debug!(attempt, max_attempts, key, resource_id, error = %error, "fetch attempt failed");
    } else if level == Level::INFO {
        info!(attempt, max_attempts, key, resource_id, error = %error, "fetch attempt failed");
    } else if level == Level::WARN {
        warn!(attempt, max_attempts, key, resource_id, error = %error, "fetch attempt failed");
    } else {
        error!(attempt, max_attempts, key, resource_id, error = %error, "fetch attempt failed");
    }
}
