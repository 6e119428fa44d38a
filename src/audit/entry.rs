//! Audit entry structure and hash chaining.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};

use crate::types::Outcome;

/// `prev_hash` of the first entry.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// What an audit entry records.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    /// Request refused by authentication, authorization or validation.
    RequestRejected,
    Sign,
    GenerateKey,
    SuspendKey,
    ResumeKey,
    RevokeKey,
    RotateKey,
    RenewCertificate,
    ProveOwnership,
    /// Issuer key and self-signed certificate created.
    IssuerBootstrapped,
    /// A recovery sweep ran.
    Recovery,
}

impl AuditAction {
    pub fn from_lifecycle(name: &str) -> Option<Self> {
        match name {
            "generate_key" => Some(AuditAction::GenerateKey),
            "suspend_key" => Some(AuditAction::SuspendKey),
            "resume_key" => Some(AuditAction::ResumeKey),
            "revoke_key" => Some(AuditAction::RevokeKey),
            "rotate_key" => Some(AuditAction::RotateKey),
            "renew_certificate" => Some(AuditAction::RenewCertificate),
            "prove_ownership" => Some(AuditAction::ProveOwnership),
            _ => None,
        }
    }
}

/// An entry before the log assigns its sequence number and hashes.
#[derive(Clone, Debug, PartialEq)]
pub struct AuditDraft {
    pub actor: String,
    pub action: AuditAction,
    pub subject_id: Option<String>,
    pub outcome: Outcome,
    pub correlation_id: Option<String>,
    pub detail: serde_json::Value,
}

impl AuditDraft {
    pub fn new(actor: impl Into<String>, action: AuditAction, outcome: Outcome) -> Self {
        Self {
            actor: actor.into(),
            action,
            subject_id: None,
            outcome,
            correlation_id: None,
            detail: serde_json::Value::Null,
        }
    }

    pub fn subject(mut self, subject_id: impl Into<String>) -> Self {
        self.subject_id = Some(subject_id.into());
        self
    }

    pub fn correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

/// A sealed, sequence-numbered audit record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub sequence_number: u64,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: AuditAction,
    pub subject_id: Option<String>,
    pub outcome: Outcome,
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub detail: serde_json::Value,
    /// `entry_hash` of the preceding entry (hex).
    pub prev_hash: String,
    /// SHA3-256 over this entry's fields and `prev_hash` (hex).
    pub entry_hash: String,
}

impl AuditEntry {
    pub(crate) fn seal(
        sequence_number: u64,
        timestamp: DateTime<Utc>,
        draft: AuditDraft,
        prev_hash: String,
    ) -> Self {
        let mut entry = Self {
            sequence_number,
            timestamp,
            actor: draft.actor,
            action: draft.action,
            subject_id: draft.subject_id,
            outcome: draft.outcome,
            correlation_id: draft.correlation_id,
            detail: draft.detail,
            prev_hash,
            entry_hash: String::new(),
        };
        entry.entry_hash = hex::encode(entry.compute_hash());
        entry
    }

    /// Recompute the hash from the entry's fields, ignoring the stored `entry_hash`.
    pub fn compute_hash(&self) -> [u8; 32] {
        let mut hasher = Sha3_256::new();
        hasher.update(self.sequence_number.to_le_bytes());
        update_field(&mut hasher, self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true).as_bytes());
        update_field(&mut hasher, self.actor.as_bytes());
        update_field(&mut hasher, format!("{:?}", self.action).as_bytes());
        update_field(&mut hasher, self.subject_id.as_deref().unwrap_or("").as_bytes());
        update_field(&mut hasher, format!("{:?}", self.outcome).as_bytes());
        update_field(&mut hasher, self.correlation_id.as_deref().unwrap_or("").as_bytes());
        update_field(&mut hasher, self.detail.to_string().as_bytes());
        update_field(&mut hasher, self.prev_hash.as_bytes());
        hasher.finalize().into()
    }

    /// Leaf used in export Merkle trees.
    pub fn to_leaf(&self) -> [u8; 32] {
        let mut leaf = [0u8; 32];
        if hex::decode_to_slice(&self.entry_hash, &mut leaf).is_err() {
            return self.compute_hash();
        }
        leaf
    }
}

fn update_field(hasher: &mut Sha3_256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}
