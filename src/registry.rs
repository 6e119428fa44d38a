//! Key registry: metadata and status of every managed key.
//!
//! Records are never deleted. Status changes follow [`VALID_TRANSITIONS`];
//! `Revoked` is terminal.

use std::collections::HashMap;
use std::path::Path;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::error::{GatewayError, Result};
use crate::storage::Journal;
use crate::types::{CertificateId, HsmHandle, KeyId, KeyRecord, KeyStatus, TenantId};

const VALID_TRANSITIONS: &[(KeyStatus, KeyStatus)] = &[
    (KeyStatus::Pending, KeyStatus::Active),
    (KeyStatus::Pending, KeyStatus::Revoked),
    (KeyStatus::Active, KeyStatus::Suspended),
    (KeyStatus::Active, KeyStatus::Revoked),
    (KeyStatus::Suspended, KeyStatus::Active),
    (KeyStatus::Suspended, KeyStatus::Revoked),
];

pub fn validate_transition(from: KeyStatus, to: KeyStatus) -> Result<()> {
    if VALID_TRANSITIONS.contains(&(from, to)) {
        Ok(())
    } else {
        Err(GatewayError::conflict(format!(
            "invalid key status transition {:?} -> {:?}",
            from, to
        )))
    }
}

struct RegistryInner {
    keys: HashMap<KeyId, KeyRecord>,
    journal: Journal<KeyRecord>,
}

pub struct KeyRegistry {
    inner: RwLock<RegistryInner>,
}

impl KeyRegistry {
    pub fn in_memory() -> Self {
        Self {
            inner: RwLock::new(RegistryInner { keys: HashMap::new(), journal: Journal::in_memory() }),
        }
    }

    /// Replay the snapshot journal at `path`, keeping the latest record per key.
    pub fn open(path: Option<&Path>, fsync: bool) -> Result<Self> {
        let (mut journal, snapshots) = Journal::<KeyRecord>::open(path, fsync)?;
        let replayed = snapshots.len();
        let mut keys = HashMap::new();
        for record in snapshots {
            keys.insert(record.key_id.clone(), record);
        }
        if replayed > keys.len() {
            let mut latest: Vec<KeyRecord> = keys.values().cloned().collect();
            latest.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            journal.rewrite(&latest)?;
        }
        debug!(keys = keys.len(), "key registry loaded");
        Ok(Self { inner: RwLock::new(RegistryInner { keys, journal }) })
    }

    pub fn get(&self, key_id: &KeyId) -> Option<KeyRecord> {
        self.inner.read().keys.get(key_id).cloned()
    }

    pub fn list_by_tenant(&self, tenant_id: &TenantId) -> Vec<KeyRecord> {
        let mut keys: Vec<KeyRecord> = self
            .inner
            .read()
            .keys
            .values()
            .filter(|k| &k.tenant_id == tenant_id)
            .cloned()
            .collect();
        keys.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        keys
    }

    /// Keys of `tenant_id` that are not revoked.
    pub fn count_live(&self, tenant_id: &TenantId) -> usize {
        self.inner
            .read()
            .keys
            .values()
            .filter(|k| &k.tenant_id == tenant_id && k.status != KeyStatus::Revoked)
            .count()
    }

    /// Insert a new Pending record. Re-inserting the same key for the same
    /// tenant returns the existing record.
    pub fn insert_pending(&self, record: KeyRecord) -> Result<KeyRecord> {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.keys.get(&record.key_id) {
            if existing.tenant_id != record.tenant_id || existing.algorithm != record.algorithm {
                return Err(GatewayError::conflict(format!(
                    "key {} already exists",
                    record.key_id
                )));
            }
            return Ok(existing.clone());
        }
        if record.status != KeyStatus::Pending {
            return Err(GatewayError::conflict("new keys must start Pending"));
        }
        inner.journal.append(&record)?;
        inner.keys.insert(record.key_id.clone(), record.clone());
        info!(key_id = %record.key_id, tenant_id = %record.tenant_id, algorithm = %record.algorithm, "key registered");
        Ok(record)
    }

    fn update<F>(&self, key_id: &KeyId, mutate: F) -> Result<KeyRecord>
    where
        F: FnOnce(&mut KeyRecord) -> Result<()>,
    {
        let mut inner = self.inner.write();
        let mut record = inner
            .keys
            .get(key_id)
            .cloned()
            .ok_or_else(|| GatewayError::policy(format!("unknown key {}", key_id)))?;
        mutate(&mut record)?;
        record.updated_at = Utc::now();
        inner.journal.append(&record)?;
        inner.keys.insert(key_id.clone(), record.clone());
        Ok(record)
    }

    pub fn attach_handle(&self, key_id: &KeyId, handle: HsmHandle) -> Result<KeyRecord> {
        self.update(key_id, |record| {
            if record.status != KeyStatus::Pending {
                return Err(GatewayError::conflict(format!(
                    "handle can only be attached to a Pending key, {} is {:?}",
                    key_id, record.status
                )));
            }
            record.hsm_handle = Some(handle);
            Ok(())
        })
    }

    /// Point the key at a newly issued certificate.
    pub fn attach_certificate(&self, key_id: &KeyId, certificate_id: CertificateId) -> Result<KeyRecord> {
        self.update(key_id, |record| {
            if record.status.is_terminal() {
                return Err(GatewayError::conflict(format!("key {} is revoked", key_id)));
            }
            record.certificate_id = Some(certificate_id);
            Ok(())
        })
    }

    /// Move `key_id` to `to`. A no-op when already there.
    pub fn transition(&self, key_id: &KeyId, to: KeyStatus, reason: Option<String>) -> Result<KeyRecord> {
        let record = self.update(key_id, |record| {
            if record.status == to {
                return Ok(());
            }
            validate_transition(record.status, to)?;
            if to == KeyStatus::Active && record.certificate_id.is_none() {
                return Err(GatewayError::conflict(format!(
                    "key {} cannot become Active without a certificate",
                    key_id
                )));
            }
            record.status = to;
            record.status_reason = reason;
            Ok(())
        })?;
        info!(key_id = %key_id, status = ?record.status, "key status changed");
        Ok(record)
    }

    pub fn touch_last_used(&self, key_id: &KeyId) -> Result<KeyRecord> {
        self.update(key_id, |record| {
            record.last_used_at = Some(Utc::now());
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::KeyAlgorithm;

    fn pending(key_id: &str, tenant: &str) -> KeyRecord {
        let now = Utc::now();
        KeyRecord {
            key_id: key_id.into(),
            tenant_id: tenant.into(),
            algorithm: KeyAlgorithm::EcdsaSecp256k1,
            status: KeyStatus::Pending,
            hsm_handle: None,
            certificate_id: None,
            label: None,
            rotated_from: None,
            status_reason: None,
            created_at: now,
            updated_at: now,
            last_used_at: None,
        }
    }

    #[test]
    fn test_valid_transitions() {
        assert!(validate_transition(KeyStatus::Pending, KeyStatus::Active).is_ok());
        assert!(validate_transition(KeyStatus::Suspended, KeyStatus::Active).is_ok());
        assert!(validate_transition(KeyStatus::Active, KeyStatus::Revoked).is_ok());
    }

    #[test]
    fn test_revoked_is_terminal() {
        for to in [KeyStatus::Pending, KeyStatus::Active, KeyStatus::Suspended] {
            assert!(validate_transition(KeyStatus::Revoked, to).is_err());
        }
    }

    #[test]
    fn test_active_requires_certificate() {
        let registry = KeyRegistry::in_memory();
        registry.insert_pending(pending("k1", "t1")).unwrap();
        assert!(registry.transition(&"k1".into(), KeyStatus::Active, None).is_err());
        registry.attach_certificate(&"k1".into(), "c1".into()).unwrap();
        let record = registry.transition(&"k1".into(), KeyStatus::Active, None).unwrap();
        assert_eq!(record.status, KeyStatus::Active);
    }

    #[test]
    fn test_insert_is_idempotent_per_tenant() {
        let registry = KeyRegistry::in_memory();
        registry.insert_pending(pending("k1", "t1")).unwrap();
        registry.insert_pending(pending("k1", "t1")).unwrap();
        assert!(registry.insert_pending(pending("k1", "t2")).is_err());
        assert_eq!(registry.count_live(&"t1".into()), 1);
    }

    #[test]
    fn test_latest_snapshot_wins_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.jsonl");
        {
            let registry = KeyRegistry::open(Some(&path), true).unwrap();
            registry.insert_pending(pending("k1", "t1")).unwrap();
            registry.attach_certificate(&"k1".into(), "c1".into()).unwrap();
            registry.transition(&"k1".into(), KeyStatus::Active, None).unwrap();
            registry.transition(&"k1".into(), KeyStatus::Revoked, Some("compromised".into())).unwrap();
        }
        let registry = KeyRegistry::open(Some(&path), true).unwrap();
        let record = registry.get(&"k1".into()).unwrap();
        assert_eq!(record.status, KeyStatus::Revoked);
        assert_eq!(record.status_reason.as_deref(), Some("compromised"));
    }
}
