//! Lease-based mutual exclusion over named resources.
//!
//! A lock is held until released or until its lease expires, so a crashed
//! holder never blocks others for longer than one lease.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::error::LockError;

/// Proof of holding a lock, needed to release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub resource_id: String,
    id: u64,
}

/// Distributed (or local) lock contract.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Wait up to `timeout` for `resource_id`, then hold it for at most `lease`.
    async fn acquire(
        &self,
        resource_id: &str,
        lease: Duration,
        timeout: Duration,
    ) -> Result<LockToken, LockError>;

    /// Release a held lock. Releasing an expired lease is an error.
    async fn release(&self, token: &LockToken) -> Result<(), LockError>;
}

struct Lease {
    id: u64,
    expires_at: Instant,
}

/// In-process lock service for single-host deployments and tests.
#[derive(Default)]
pub struct MemoryLockService {
    held: Mutex<HashMap<String, Lease>>,
    released: Notify,
    next_id: AtomicU64,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if `resource_id` is currently held by someone.
    #[cfg(test)]
    pub(crate) fn is_locked(&self, resource_id: &str) -> bool {
        self.held
            .lock()
            .unwrap()
            .get(resource_id)
            .map_or(false, |lease| lease.expires_at > Instant::now())
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn acquire(
        &self,
        resource_id: &str,
        lease: Duration,
        timeout: Duration,
    ) -> Result<LockToken, LockError> {
        let started = Instant::now();
        let deadline = started + timeout;
        loop {
            // registered before the check so a release in between is not missed
            let released = self.released.notified();

            let wait_until = {
                let mut held = self.held.lock().unwrap();
                let now = Instant::now();
                match held.get(resource_id) {
                    Some(current) if current.expires_at > now => current.expires_at.min(deadline),
                    _ => {
                        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                        held.insert(
                            resource_id.to_string(),
                            Lease {
                                id,
                                expires_at: now + lease,
                            },
                        );
                        debug!(resource_id, lease_ms = lease.as_millis() as u64, "lock acquired");
                        return Ok(LockToken {
                            resource_id: resource_id.to_string(),
                            id,
                        });
                    }
                }
            };

            if Instant::now() >= deadline {
                return Err(LockError::Timeout {
                    resource_id: resource_id.to_string(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            let _ = tokio::time::timeout_at(wait_until, released).await;
        }
    }

    async fn release(&self, token: &LockToken) -> Result<(), LockError> {
        let removed = {
            let mut held = self.held.lock().unwrap();
            match held.get(&token.resource_id) {
                Some(lease) if lease.id == token.id => held.remove(&token.resource_id).is_some(),
                _ => false,
            }
        };
        if !removed {
            return Err(LockError::NotHeld {
                resource_id: token.resource_id.clone(),
            });
        }
        debug!(resource_id = %token.resource_id, "lock released");
        self.released.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const LEASE: Duration = Duration::from_secs(120);

    #[tokio::test]
    async fn acquire_release_cycle() {
        let locks = MemoryLockService::new();
        let token = locks.acquire("fetch:a", LEASE, LEASE).await.unwrap();
        assert!(locks.is_locked("fetch:a"));
        assert!(!locks.is_locked("fetch:b"));

        locks.release(&token).await.unwrap();
        assert!(!locks.is_locked("fetch:a"));
        assert!(matches!(locks.release(&token).await, Err(LockError::NotHeld { .. })));
    }

    #[tokio::test]
    async fn acquire_times_out_while_held() {
        let locks = MemoryLockService::new();
        let _token = locks.acquire("r", LEASE, LEASE).await.unwrap();
        let err = locks
            .acquire("r", LEASE, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn waiter_wakes_on_release() {
        let locks = Arc::new(MemoryLockService::new());
        let token = locks.acquire("r", LEASE, LEASE).await.unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire("r", LEASE, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        locks.release(&token).await.unwrap();

        let second = waiter.await.unwrap().unwrap();
        assert_ne!(second, token);
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let locks = MemoryLockService::new();
        let stale = locks
            .acquire("r", Duration::from_millis(10), LEASE)
            .await
            .unwrap();
        let fresh = locks.acquire("r", LEASE, Duration::from_secs(1)).await.unwrap();
        assert_ne!(stale, fresh);
        assert!(matches!(locks.release(&stale).await, Err(LockError::NotHeld { .. })));
        locks.release(&fresh).await.unwrap();
    }
}
