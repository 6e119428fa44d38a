//! Per-resource leases with wall-clock expiry.
//!
//! A lease grants one owner exclusive use of a resource (a key id) until it
//! is released or expires. Expired leases are taken over by the next caller,
//! which is how a lease left behind by a crashed process is reclaimed.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};
use crate::storage::Journal;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub resource: String,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum LeaseEvent {
    Acquired(Lease),
    Released { resource: String, owner: String },
}

struct LeaseInner {
    leases: HashMap<String, Lease>,
    journal: Journal<LeaseEvent>,
}

pub struct LeaseTable {
    inner: Mutex<LeaseInner>,
}

impl LeaseTable {
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(LeaseInner { leases: HashMap::new(), journal: Journal::in_memory() }),
        })
    }

    /// Open the table, replaying and compacting its journal.
    pub fn open(path: Option<&Path>, fsync: bool) -> Result<Arc<Self>> {
        let (mut journal, events) = Journal::<LeaseEvent>::open(path, fsync)?;
        let mut leases = HashMap::new();
        for event in events {
            match event {
                LeaseEvent::Acquired(lease) => {
                    leases.insert(lease.resource.clone(), lease);
                }
                LeaseEvent::Released { resource, owner } => {
                    if leases.get(&resource).map(|l| l.owner == owner).unwrap_or(false) {
                        leases.remove(&resource);
                    }
                }
            }
        }

        let live: Vec<LeaseEvent> = leases.values().cloned().map(LeaseEvent::Acquired).collect();
        journal.rewrite(&live)?;
        if !leases.is_empty() {
            debug!(count = leases.len(), "restored leases from journal");
        }

        Ok(Arc::new(Self { inner: Mutex::new(LeaseInner { leases, journal }) }))
    }

    /// Take the lease if it is free, expired, or already ours.
    pub fn try_acquire(
        self: &Arc<Self>,
        resource: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<LeaseGuard>> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| GatewayError::configuration(format!("lease ttl out of range: {}", e)))?;
        let now = Utc::now();
        let mut inner = self.inner.lock();

        if let Some(existing) = inner.leases.get(resource) {
            if existing.owner != owner {
                if !existing.is_expired_at(now) {
                    return Ok(None);
                }
                warn!(
                    resource,
                    stale_owner = %existing.owner,
                    new_owner = owner,
                    expired_at = %existing.expires_at,
                    "taking over expired lease"
                );
            }
        }

        let lease = Lease {
            resource: resource.to_string(),
            owner: owner.to_string(),
            acquired_at: now,
            expires_at: now + ttl,
        };
        inner.journal.append(&LeaseEvent::Acquired(lease.clone()))?;
        inner.leases.insert(resource.to_string(), lease);

        Ok(Some(LeaseGuard {
            table: Arc::clone(self),
            resource: resource.to_string(),
            owner: owner.to_string(),
        }))
    }

    /// Wait up to `wait` for the lease, polling every `poll`.
    pub async fn acquire(
        self: &Arc<Self>,
        resource: &str,
        owner: &str,
        ttl: Duration,
        wait: Duration,
        poll: Duration,
    ) -> Result<LeaseGuard> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(guard) = self.try_acquire(resource, owner, ttl)? {
                return Ok(guard);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(GatewayError::conflict(format!(
                    "lease on {} not available within {} ms",
                    resource,
                    wait.as_millis()
                )));
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Push out the expiry of a lease `owner` still holds.
    ///
    /// Fails with `ConflictingState` once another owner has taken it over.
    pub fn renew(&self, resource: &str, owner: &str, ttl: Duration) -> Result<Lease> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| GatewayError::configuration(format!("lease ttl out of range: {}", e)))?;
        let mut inner = self.inner.lock();
        let lease = match inner.leases.get(resource) {
            Some(lease) if lease.owner == owner => Lease { expires_at: Utc::now() + ttl, ..lease.clone() },
            Some(lease) => {
                return Err(GatewayError::conflict(format!(
                    "lease on {} was taken over by {}",
                    resource, lease.owner
                )))
            }
            None => return Err(GatewayError::conflict(format!("lease on {} is not held", resource))),
        };
        inner.journal.append(&LeaseEvent::Acquired(lease.clone()))?;
        inner.leases.insert(resource.to_string(), lease.clone());
        Ok(lease)
    }

    pub fn holder(&self, resource: &str) -> Option<Lease> {
        self.inner.lock().leases.get(resource).cloned()
    }

    /// Release the lease if `owner` still holds it.
    pub fn release(&self, resource: &str, owner: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        let held = inner.leases.get(resource).map(|l| l.owner == owner).unwrap_or(false);
        if !held {
            return Ok(false);
        }
        inner.journal.append(&LeaseEvent::Released {
            resource: resource.to_string(),
            owner: owner.to_string(),
        })?;
        inner.leases.remove(resource);
        Ok(true)
    }
}

/// Releases its lease when dropped.
pub struct LeaseGuard {
    table: Arc<LeaseTable>,
    resource: String,
    owner: String,
}

impl LeaseGuard {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn renew(&self, ttl: Duration) -> Result<Lease> {
        self.table.renew(&self.resource, &self.owner, ttl)
    }

    /// Whether we still hold the lease (it may have expired and been taken over).
    pub fn is_held(&self) -> bool {
        self.table
            .holder(&self.resource)
            .map(|l| l.owner == self.owner && !l.is_expired_at(Utc::now()))
            .unwrap_or(false)
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Err(e) = self.table.release(&self.resource, &self.owner) {
            warn!(resource = %self.resource, error = %e, "failed to journal lease release");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusive_until_released() {
        let table = LeaseTable::in_memory();
        let guard = table.try_acquire("k1", "a", Duration::from_secs(10)).unwrap().unwrap();
        assert!(table.try_acquire("k1", "b", Duration::from_secs(10)).unwrap().is_none());
        assert!(guard.is_held());
        drop(guard);
        assert!(table.holder("k1").is_none());
        assert!(table.try_acquire("k1", "b", Duration::from_secs(10)).unwrap().is_some());
    }

    #[test]
    fn test_expired_lease_is_taken_over() {
        let table = LeaseTable::in_memory();
        let stale = table.try_acquire("k1", "crashed", Duration::from_millis(1)).unwrap().unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let fresh = table.try_acquire("k1", "new", Duration::from_secs(10)).unwrap().unwrap();
        assert!(!stale.is_held());
        drop(stale);
        assert_eq!(table.holder("k1").unwrap().owner, "new");
        assert!(fresh.is_held());
    }

    #[test]
    fn test_renew_extends_only_for_the_holder() {
        let table = LeaseTable::in_memory();
        let guard = table.try_acquire("k1", "a", Duration::from_millis(20)).unwrap().unwrap();
        let first = table.holder("k1").unwrap().expires_at;
        let renewed = guard.renew(Duration::from_secs(60)).unwrap();
        assert!(renewed.expires_at > first);
        std::thread::sleep(Duration::from_millis(30));
        assert!(guard.is_held());
        assert!(table.try_acquire("k1", "b", Duration::from_secs(10)).unwrap().is_none());

        let stale = table.try_acquire("k2", "a", Duration::from_millis(1)).unwrap().unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let _taken = table.try_acquire("k2", "b", Duration::from_secs(10)).unwrap().unwrap();
        assert!(matches!(
            stale.renew(Duration::from_secs(60)),
            Err(GatewayError::ConflictingState { .. })
        ));
    }

    #[test]
    fn test_leases_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases.jsonl");
        {
            let table = LeaseTable::open(Some(&path), false).unwrap();
            let guard = table.try_acquire("k1", "a", Duration::from_secs(60)).unwrap().unwrap();
            // simulate a crash: the guard never runs its destructor
            std::mem::forget(guard);
        }
        let table = LeaseTable::open(Some(&path), false).unwrap();
        assert_eq!(table.holder("k1").unwrap().owner, "a");
        assert!(table.try_acquire("k1", "b", Duration::from_secs(60)).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_acquire_times_out_with_conflict() {
        let table = LeaseTable::in_memory();
        let _held = table.try_acquire("k1", "a", Duration::from_secs(60)).unwrap().unwrap();
        let err = table
            .acquire("k1", "b", Duration::from_secs(60), Duration::from_millis(30), Duration::from_millis(5))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, GatewayError::ConflictingState { .. }));
    }
}
