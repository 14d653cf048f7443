//! Key-scoped mutual exclusion across coordinator replicas.
//!
//! Locks are leases: an acquisition expires after [`LEASE_TTL`] even
//! if the holder dies without releasing, so a crashed coordinator can
//! never wedge a job. Holders of long-running sections call
//! [`LockLease::renew`].
//!
//! The in-memory implementation covers standalone deployments and
//! tests; a clustered deployment backs the same trait with its
//! datastore (e.g. advisory locks).

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::{DatastoreError, Result};

/// How long a lease lives without renewal.
pub const LEASE_TTL: Duration = Duration::from_secs(60);

/// How long `acquire` waits for a held lock before giving up.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

const RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// Distributed key-scoped mutual-exclusion primitive.
#[async_trait]
pub trait Locker: Send + Sync {
    /// Acquire the lock for `key`, waiting a bounded time for the
    /// current holder. The lease is released on drop.
    async fn acquire(&self, key: &str) -> Result<LockLease>;
}

struct Holder {
    token: u64,
    expires_at: Instant,
}

/// An acquired lease. Dropping it releases the lock (if the lease has
/// not expired and been taken over in the meantime).
pub struct LockLease {
    key: String,
    token: u64,
    locks: Arc<DashMap<String, Holder>>,
}

impl LockLease {
    /// Extend the lease by another [`LEASE_TTL`]. Returns
    /// [`DatastoreError::LockHeld`] if the lease already expired and
    /// someone else took the lock.
    pub fn renew(&self) -> Result<()> {
        let mut entry =
            self.locks
                .get_mut(&self.key)
                .ok_or_else(|| DatastoreError::LockHeld {
                    key: self.key.clone(),
                })?;
        if entry.token != self.token {
            return Err(DatastoreError::LockHeld {
                key: self.key.clone(),
            });
        }
        entry.expires_at = Instant::now() + LEASE_TTL;
        Ok(())
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        self.locks
            .remove_if(&self.key, |_, holder| holder.token == self.token);
    }
}

/// Process-local [`Locker`].
#[derive(Clone, Default)]
pub struct InMemoryLocker {
    locks: Arc<DashMap<String, Holder>>,
    counter: Arc<std::sync::atomic::AtomicU64>,
}

impl InMemoryLocker {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_acquire(&self, key: &str) -> Option<LockLease> {
        let token = self
            .counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let now = Instant::now();
        let mut acquired = false;
        let entry = self.locks.entry(key.to_string());
        let entry = entry.and_modify(|holder| {
            // Take over an expired lease.
            if holder.expires_at <= now {
                holder.token = token;
                holder.expires_at = now + LEASE_TTL;
                acquired = true;
            }
        });
        if let dashmap::mapref::entry::Entry::Vacant(vacant) = entry {
            vacant.insert(Holder {
                token,
                expires_at: now + LEASE_TTL,
            });
            acquired = true;
        }
        acquired.then(|| LockLease {
            key: key.to_string(),
            token,
            locks: Arc::clone(&self.locks),
        })
    }
}

#[async_trait]
impl Locker for InMemoryLocker {
    async fn acquire(&self, key: &str) -> Result<LockLease> {
        let deadline = Instant::now() + ACQUIRE_TIMEOUT;
        loop {
            if let Some(lease) = self.try_acquire(key) {
                return Ok(lease);
            }
            if Instant::now() >= deadline {
                return Err(DatastoreError::LockHeld {
                    key: key.to_string(),
                });
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
