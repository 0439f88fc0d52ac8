/*
 *  Copyright 2025-2026 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Optional cross-instance mutual exclusion for compensation cycles.
//!
//! When several instances scan the same outbox table, a lock keeps their
//! cycles from interleaving and double-driving the same records. The lock
//! is an efficiency mechanism only; correctness of at-least-once delivery
//! never depends on it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::LockError;

/// A held lease on a named lock.
///
/// The token fences stale holders: renewal and release are no-ops for a
/// token that no longer owns the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub name: String,
    pub token: Uuid,
}

/// Lease-based mutual exclusion across instances.
///
/// `try_acquire` never blocks: a held lock yields `Ok(None)` and the
/// caller is expected to skip its turn rather than wait.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockLease>, LockError>;

    /// Extends the lease if `lease` still owns the lock; returns whether
    /// it did.
    async fn renew(&self, lease: &LockLease, ttl: Duration) -> Result<bool, LockError>;

    /// Releases the lease if it still owns the lock. Releasing a lost
    /// lease is not an error.
    async fn release(&self, lease: &LockLease) -> Result<(), LockError>;
}

struct Holder {
    token: Uuid,
    expires_at: Instant,
}

/// In-process lock, for single-instance deployments and tests.
///
/// Expired leases are treated as free; acquisition over an expired holder
/// succeeds and the old token stops renewing.
pub struct LocalLock {
    holders: Mutex<HashMap<String, Holder>>,
}

impl LocalLock {
    pub fn new() -> Self {
        Self {
            holders: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for LocalLock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DistributedLock for LocalLock {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockLease>, LockError> {
        let mut holders = self.holders.lock().unwrap();
        let now = Instant::now();
        if let Some(holder) = holders.get(name) {
            if holder.expires_at > now {
                return Ok(None);
            }
        }
        let token = Uuid::new_v4();
        holders.insert(
            name.to_string(),
            Holder {
                token,
                expires_at: now + ttl,
            },
        );
        Ok(Some(LockLease {
            name: name.to_string(),
            token,
        }))
    }

    async fn renew(&self, lease: &LockLease, ttl: Duration) -> Result<bool, LockError> {
        let mut holders = self.holders.lock().unwrap();
        match holders.get_mut(&lease.name) {
            Some(holder) if holder.token == lease.token && holder.expires_at > Instant::now() => {
                holder.expires_at = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, lease: &LockLease) -> Result<(), LockError> {
        let mut holders = self.holders.lock().unwrap();
        if let Some(holder) = holders.get(&lease.name) {
            if holder.token == lease.token {
                holders.remove(&lease.name);
            }
        }
        Ok(())
    }
}

/// Runs `work` under `name`'s lock, renewing the lease in the background
/// for the duration of the work.
///
/// Returns `Ok(None)` without running when the lock is held elsewhere.
/// Renewal failure is logged, not fatal; the work is already in flight
/// and at-least-once semantics tolerate the overlap a lost lease allows.
pub async fn run_exclusively<F, Fut, T>(
    lock: Arc<dyn DistributedLock>,
    name: &str,
    ttl: Duration,
    work: F,
) -> Result<Option<T>, LockError>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = T>,
{
    let lease = match lock.try_acquire(name, ttl).await? {
        Some(lease) => lease,
        None => {
            debug!(lock = name, "Lock held elsewhere; skipping");
            return Ok(None);
        }
    };

    let renew_lock = lock.clone();
    let renew_lease = lease.clone();
    let renewer = tokio::spawn(async move {
        let interval = ttl / 3;
        loop {
            tokio::time::sleep(interval).await;
            match renew_lock.renew(&renew_lease, ttl).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(lock = %renew_lease.name, "Lock lease lost during renewal");
                    break;
                }
                Err(e) => {
                    warn!(lock = %renew_lease.name, error = %e, "Lock renewal failed");
                    break;
                }
            }
        }
    });

    let result = work().await;

    renewer.abort();
    lock.release(&lease).await?;
    Ok(Some(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_second_acquire_skips() {
        let lock = LocalLock::new();
        let lease = lock
            .try_acquire("scan", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert!(lock
            .try_acquire("scan", Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());

        lock.release(&lease).await.unwrap();
        assert!(lock
            .try_acquire("scan", Duration::from_secs(30))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_is_free() {
        let lock = LocalLock::new();
        let stale = lock
            .try_acquire("scan", Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_secs(11)).await;
        let fresh = lock
            .try_acquire("scan", Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();
        assert_ne!(stale.token, fresh.token);

        // The stale holder can no longer renew or release over the new one.
        assert!(!lock.renew(&stale, Duration::from_secs(10)).await.unwrap());
        lock.release(&stale).await.unwrap();
        assert!(lock.renew(&fresh, Duration::from_secs(10)).await.unwrap());
    }

    #[tokio::test]
    async fn test_run_exclusively_runs_and_releases() {
        let lock: Arc<dyn DistributedLock> = Arc::new(LocalLock::new());
        let ran = Arc::new(AtomicU32::new(0));

        let ran_inner = ran.clone();
        let out = run_exclusively(lock.clone(), "scan", Duration::from_secs(30), || async move {
            ran_inner.fetch_add(1, Ordering::SeqCst);
            7
        })
        .await
        .unwrap();
        assert_eq!(out, Some(7));
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        // Released: a second run goes through.
        let out = run_exclusively(lock, "scan", Duration::from_secs(30), || async { 8 })
            .await
            .unwrap();
        assert_eq!(out, Some(8));
    }

    #[tokio::test]
    async fn test_run_exclusively_skips_when_held() {
        let lock: Arc<dyn DistributedLock> = Arc::new(LocalLock::new());
        let _held = lock
            .try_acquire("scan", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let out = run_exclusively(lock.clone(), "scan", Duration::from_secs(30), || async { 7 })
            .await
            .unwrap();
        assert_eq!(out, None);
    }
}
