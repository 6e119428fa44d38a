//! Append-only, hash-chained audit log.
//!
//! Sequence numbers start at 1, are assigned under the log's lock and
//! continue from the last persisted entry after a restart.

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

use crate::audit::entry::{AuditDraft, AuditEntry, GENESIS_HASH};
use crate::error::{GatewayError, Result};
use crate::storage::{journal, Journal};
use crate::types::MerkleProof;
use crate::utils::MerkleTree;

/// Ways a stored chain can fail verification.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("Sequence regression: entry {0} follows {1}")]
    SequenceRegression(u64, u64),
    #[error("Sequence gap: entry {0} follows {1}")]
    SequenceGap(u64, u64),
    #[error("Broken link at entry {0}: prev_hash does not match predecessor")]
    BrokenLink(u64),
    #[error("Hash mismatch at entry {0}: contents were altered")]
    HashMismatch(u64),
}

impl From<ChainError> for GatewayError {
    fn from(e: ChainError) -> Self {
        GatewayError::storage(format!("audit chain invalid: {}", e))
    }
}

/// Entries of a sequence range with a Merkle root over their hashes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditExport {
    pub first_sequence: Option<u64>,
    pub last_sequence: Option<u64>,
    /// Hex SHA3 Merkle root over the entries' `entry_hash` values.
    pub merkle_root: String,
    pub exported_at: DateTime<Utc>,
    pub entries: Vec<AuditEntry>,
}

impl AuditExport {
    pub fn from_entries(entries: Vec<AuditEntry>) -> Self {
        let leaves: Vec<[u8; 32]> = entries.iter().map(AuditEntry::to_leaf).collect();
        let tree = MerkleTree::from_leaves(&leaves);
        Self {
            first_sequence: entries.first().map(|e| e.sequence_number),
            last_sequence: entries.last().map(|e| e.sequence_number),
            merkle_root: hex::encode(tree.root()),
            exported_at: Utc::now(),
            entries,
        }
    }

    /// Recompute the Merkle root and check entry hashes.
    pub fn verify(&self) -> bool {
        let mut leaves = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let hash = entry.compute_hash();
            if hex::encode(hash) != entry.entry_hash {
                return false;
            }
            leaves.push(hash);
        }
        hex::encode(MerkleTree::from_leaves(&leaves).root()) == self.merkle_root
    }

    /// Inclusion proof for the entry with `sequence_number`, if exported.
    pub fn prove(&self, sequence_number: u64) -> Option<MerkleProof> {
        let index = self.entries.iter().position(|e| e.sequence_number == sequence_number)?;
        let leaves: Vec<[u8; 32]> = self.entries.iter().map(AuditEntry::to_leaf).collect();
        MerkleTree::from_leaves(&leaves).prove(index)
    }
}

/// Check that `entry` is the leaf `proof` commits to under the hex
/// `merkle_root` of an export. Needs only the root, not the export.
pub fn verify_inclusion(merkle_root: &str, entry: &AuditEntry, proof: &MerkleProof) -> bool {
    let mut root = [0u8; 32];
    if hex::decode_to_slice(merkle_root, &mut root).is_err() {
        return false;
    }
    entry.compute_hash() == proof.leaf_hash && MerkleTree::verify_proof(&root, proof)
}

/// Load the audit journal at `path` without truncating or appending.
pub fn read_journal(path: &Path) -> Result<Vec<AuditEntry>> {
    journal::read(path)
}

/// Check sequence continuity, links and hashes of a full chain.
pub fn verify_entries(entries: &[AuditEntry]) -> core::result::Result<(), ChainError> {
    let mut prev_hash = GENESIS_HASH.to_string();
    let mut prev_seq = 0u64;

    for entry in entries {
        // Re-derive the hash; never trust the stored one
        if hex::encode(entry.compute_hash()) != entry.entry_hash {
            return Err(ChainError::HashMismatch(entry.sequence_number));
        }
        if entry.sequence_number <= prev_seq {
            return Err(ChainError::SequenceRegression(entry.sequence_number, prev_seq));
        }
        if entry.sequence_number != prev_seq + 1 {
            return Err(ChainError::SequenceGap(entry.sequence_number, prev_seq));
        }
        if entry.prev_hash != prev_hash {
            return Err(ChainError::BrokenLink(entry.sequence_number));
        }
        prev_seq = entry.sequence_number;
        prev_hash = entry.entry_hash.clone();
    }
    Ok(())
}

struct AuditInner {
    entries: Vec<AuditEntry>,
    journal: Journal<AuditEntry>,
}

pub struct AuditLog {
    inner: Mutex<AuditInner>,
}

impl AuditLog {
    pub fn in_memory() -> Self {
        Self { inner: Mutex::new(AuditInner { entries: Vec::new(), journal: Journal::in_memory() }) }
    }

    pub fn open(path: Option<&Path>, fsync: bool) -> Result<Self> {
        let (journal, entries) = Journal::<AuditEntry>::open(path, fsync)?;
        if let Err(e) = verify_entries(&entries) {
            // Keep serving; sequence numbers still continue past the highest seen.
            error!(error = %e, "audit chain failed verification on load");
        }
        debug!(
            entries = entries.len(),
            last_sequence = entries.last().map(|e| e.sequence_number).unwrap_or(0),
            "audit log loaded"
        );
        Ok(Self { inner: Mutex::new(AuditInner { entries, journal }) })
    }

    /// Seal and persist `draft`. This is the only mutation.
    pub fn append(&self, draft: AuditDraft) -> Result<AuditEntry> {
        let mut inner = self.inner.lock();
        let (next_seq, prev_hash) = match inner.entries.last() {
            Some(last) => (last.sequence_number + 1, last.entry_hash.clone()),
            None => (1, GENESIS_HASH.to_string()),
        };

        let entry = AuditEntry::seal(next_seq, Utc::now(), draft, prev_hash);
        inner.journal.append(&entry)?;
        inner.entries.push(entry.clone());
        debug!(
            sequence = entry.sequence_number,
            action = ?entry.action,
            outcome = ?entry.outcome,
            correlation_id = entry.correlation_id.as_deref().unwrap_or(""),
            "audit entry appended"
        );
        Ok(entry)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_sequence(&self) -> u64 {
        self.inner.lock().entries.last().map(|e| e.sequence_number).unwrap_or(0)
    }

    /// Entries with `first <= sequence_number <= last`.
    pub fn range(&self, first: u64, last: Option<u64>) -> Vec<AuditEntry> {
        let last = last.unwrap_or(u64::MAX);
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|e| e.sequence_number >= first && e.sequence_number <= last)
            .cloned()
            .collect()
    }

    pub fn by_correlation(&self, correlation_id: &str) -> Vec<AuditEntry> {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|e| e.correlation_id.as_deref() == Some(correlation_id))
            .cloned()
            .collect()
    }

    pub fn verify_chain(&self) -> Result<u64> {
        let inner = self.inner.lock();
        verify_entries(&inner.entries)?;
        Ok(inner.entries.len() as u64)
    }

    pub fn export(&self, first: u64, last: Option<u64>) -> AuditExport {
        AuditExport::from_entries(self.range(first, last))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditAction;
    use crate::types::Outcome;

    fn draft(correlation: &str) -> AuditDraft {
        AuditDraft::new("tenant-a", AuditAction::Sign, Outcome::Success)
            .subject("k1")
            .correlation(correlation)
    }

    #[test]
    fn test_sequence_numbers_strictly_increase() {
        let log = AuditLog::in_memory();
        let a = log.append(draft("r1")).unwrap();
        let b = log.append(draft("r2")).unwrap();
        assert_eq!(a.sequence_number, 1);
        assert_eq!(b.sequence_number, 2);
        assert_eq!(b.prev_hash, a.entry_hash);
        assert_eq!(log.verify_chain().unwrap(), 2);
    }

    #[test]
    fn test_sequence_continues_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        {
            let log = AuditLog::open(Some(&path), true).unwrap();
            log.append(draft("r1")).unwrap();
            log.append(draft("r2")).unwrap();
        }
        let log = AuditLog::open(Some(&path), true).unwrap();
        let entry = log.append(draft("r3")).unwrap();
        assert_eq!(entry.sequence_number, 3);
        assert!(log.verify_chain().is_ok());
    }

    #[test]
    fn test_tampering_is_detected() {
        let log = AuditLog::in_memory();
        for i in 0..4 {
            log.append(draft(&format!("r{}", i))).unwrap();
        }
        let mut entries = log.range(1, None);
        entries[1].outcome = Outcome::Failed;
        assert_eq!(verify_entries(&entries), Err(ChainError::HashMismatch(2)));

        let mut entries = log.range(1, None);
        entries.remove(2);
        assert_eq!(verify_entries(&entries), Err(ChainError::SequenceGap(4, 2)));

        let mut entries = log.range(1, None);
        entries.swap(0, 1);
        assert!(verify_entries(&entries).is_err());
    }

    #[test]
    fn test_correlation_and_range_queries() {
        let log = AuditLog::in_memory();
        log.append(draft("r1")).unwrap();
        log.append(draft("r2")).unwrap();
        log.append(draft("r1")).unwrap();
        assert_eq!(log.by_correlation("r1").len(), 2);
        assert_eq!(log.range(2, Some(2)).len(), 1);
    }

    #[test]
    fn test_export_root_verifies() {
        let log = AuditLog::in_memory();
        for i in 0..5 {
            log.append(draft(&format!("r{}", i))).unwrap();
        }
        let export = log.export(2, Some(4));
        assert_eq!(export.first_sequence, Some(2));
        assert_eq!(export.last_sequence, Some(4));
        assert!(export.verify());

        let mut forged = export.clone();
        forged.entries[0].actor = "mallory".into();
        assert!(!forged.verify());
    }

    #[test]
    fn test_inclusion_proof_against_export_root() {
        let log = AuditLog::in_memory();
        for i in 0..5 {
            log.append(draft(&format!("r{}", i))).unwrap();
        }
        let export = log.export(1, None);
        let entry = &export.entries[2];
        let proof = export.prove(entry.sequence_number).unwrap();
        assert!(verify_inclusion(&export.merkle_root, entry, &proof));

        assert!(export.prove(99).is_none());
        let mut altered = entry.clone();
        altered.subject_id = Some("k2".into());
        assert!(!verify_inclusion(&export.merkle_root, &altered, &proof));
        assert!(!verify_inclusion(&export.merkle_root, &export.entries[3], &proof));
        assert!(!verify_inclusion("not hex", entry, &proof));
    }

    #[test]
    fn test_read_journal_does_not_repair() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        {
            let log = AuditLog::open(Some(&path), false).unwrap();
            log.append(draft("r1")).unwrap();
            log.append(draft("r2")).unwrap();
        }
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.extend_from_slice(b"{\"sequence_number\":3,");
        std::fs::write(&path, &bytes).unwrap();

        let entries = read_journal(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(verify_entries(&entries).is_ok());
        assert_eq!(std::fs::read(&path).unwrap(), bytes);
    }
}
