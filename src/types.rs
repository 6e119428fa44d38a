//! Core records shared across the gateway.
//!
//! Identifiers are opaque string newtypes; binary material (digests,
//! signatures) is carried as bytes and serialised as lowercase hex.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ErrorKind, GatewayError};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Unique identifier of a managed key.
    KeyId
);
string_id!(
    /// Tenant owning keys and issuing requests.
    TenantId
);
string_id!(
    /// Idempotency key supplied by the caller.
    RequestId
);
string_id!(
    /// Identifier of an issued certificate.
    CertificateId
);
string_id!(
    /// Opaque reference to key material inside the HSM.
    HsmHandle
);

/// Serde helper for `Vec<u8>` fields carried as hex strings.
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// Signature algorithms the gateway can manage keys for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyAlgorithm {
    /// ECDSA over secp256k1 (prehashed digest, DER signature).
    EcdsaSecp256k1,
    /// ECDSA over NIST P-256 (prehashed digest, DER signature).
    EcdsaP256,
    /// Ed25519 over the 32-byte digest.
    EddsaEd25519,
}

impl KeyAlgorithm {
    /// Length in bytes of the payload digest accepted for signing.
    pub fn digest_len(&self) -> usize {
        32
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyAlgorithm::EcdsaSecp256k1 => "ECDSA_SECP256K1",
            KeyAlgorithm::EcdsaP256 => "ECDSA_P256",
            KeyAlgorithm::EddsaEd25519 => "EDDSA_ED25519",
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyAlgorithm {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ECDSA_SECP256K1" | "SECP256K1" => Ok(KeyAlgorithm::EcdsaSecp256k1),
            "ECDSA_P256" | "P256" | "P-256" | "SECP256R1" => Ok(KeyAlgorithm::EcdsaP256),
            "EDDSA_ED25519" | "ED25519" | "EDDSA" => Ok(KeyAlgorithm::EddsaEd25519),
            other => Err(GatewayError::malformed(format!(
                "algorithm '{}' cannot be mapped to a key algorithm",
                other
            ))),
        }
    }
}

/// Lifecycle status of a managed key.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyStatus {
    Pending,
    Active,
    Suspended,
    Revoked,
}

impl KeyStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, KeyStatus::Revoked)
    }
}

/// Persisted metadata describing a managed key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub key_id: KeyId,
    pub tenant_id: TenantId,
    pub algorithm: KeyAlgorithm,
    pub status: KeyStatus,
    /// Set once the HSM has generated the key.
    pub hsm_handle: Option<HsmHandle>,
    /// The live certificate; required while Active.
    pub certificate_id: Option<CertificateId>,
    pub label: Option<String>,
    /// Predecessor when this key was produced by rotation.
    pub rotated_from: Option<KeyId>,
    pub status_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// An issued X.509 certificate. Never mutated once written.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub certificate_id: CertificateId,
    /// Back-reference to the certified key.
    pub key_id: KeyId,
    pub issuer: String,
    pub subject: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// Hex encoded serial number.
    pub serial_number: String,
    pub pem: String,
    /// Hex SHA-256 of the DER encoding.
    pub fingerprint: String,
    /// Prior certificate this one renews.
    pub supersedes: Option<CertificateId>,
    /// Request that caused the issuance.
    pub request_id: Option<RequestId>,
    pub issued_at: DateTime<Utc>,
}

/// A validated request to sign a digest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningRequest {
    pub request_id: RequestId,
    pub tenant_id: TenantId,
    pub key_id: KeyId,
    #[serde(with = "hex_bytes")]
    pub payload_digest: Vec<u8>,
    pub requested_at: DateTime<Utc>,
}

/// Terminal outcome of an operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    Success,
    Rejected,
    Failed,
}

/// Result of a signing request, stored under its request id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningResult {
    pub request_id: RequestId,
    pub key_id: KeyId,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
    pub hsm_operation_id: Option<String>,
    pub completed_at: DateTime<Utc>,
    pub outcome: Outcome,
    pub attempts: u32,
    pub error_kind: Option<ErrorKind>,
    pub message: Option<String>,
}

/// States of the signing state machine.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SigningState {
    Received,
    Validated,
    HsmInvoked,
    Completed,
    Failed,
    Audited,
}

/// States of the key-lifecycle state machine.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    Requested,
    PolicyChecked,
    HsmExecuted,
    Recorded,
    Audited,
}

/// Progress marker persisted with an in-flight request.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Signing(SigningState),
    Lifecycle(LifecycleState),
}

/// Key-lifecycle actions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleAction {
    GenerateKey {
        algorithm: KeyAlgorithm,
        label: Option<String>,
    },
    SuspendKey {
        key_id: KeyId,
        reason: Option<String>,
    },
    ResumeKey {
        key_id: KeyId,
    },
    RevokeKey {
        key_id: KeyId,
        reason: Option<String>,
    },
    RotateKey {
        key_id: KeyId,
    },
    RenewCertificate {
        key_id: KeyId,
    },
    ProveOwnership {
        key_id: KeyId,
        context: String,
    },
}

impl LifecycleAction {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleAction::GenerateKey { .. } => "generate_key",
            LifecycleAction::SuspendKey { .. } => "suspend_key",
            LifecycleAction::ResumeKey { .. } => "resume_key",
            LifecycleAction::RevokeKey { .. } => "revoke_key",
            LifecycleAction::RotateKey { .. } => "rotate_key",
            LifecycleAction::RenewCertificate { .. } => "renew_certificate",
            LifecycleAction::ProveOwnership { .. } => "prove_ownership",
        }
    }

    /// Key the action targets; `None` for generation.
    pub fn target_key(&self) -> Option<&KeyId> {
        match self {
            LifecycleAction::GenerateKey { .. } => None,
            LifecycleAction::SuspendKey { key_id, .. }
            | LifecycleAction::ResumeKey { key_id }
            | LifecycleAction::RevokeKey { key_id, .. }
            | LifecycleAction::RotateKey { key_id }
            | LifecycleAction::RenewCertificate { key_id }
            | LifecycleAction::ProveOwnership { key_id, .. } => Some(key_id),
        }
    }
}

/// A validated key-lifecycle request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleRequest {
    pub request_id: RequestId,
    pub tenant_id: TenantId,
    pub action: LifecycleAction,
    pub requested_at: DateTime<Utc>,
}

/// Result of a key-lifecycle request, stored under its request id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleResult {
    pub request_id: RequestId,
    pub action: String,
    pub key_id: Option<KeyId>,
    pub outcome: Outcome,
    pub key: Option<KeyRecord>,
    pub certificate_pem: Option<String>,
    /// Proof-of-ownership message, when applicable.
    pub message: Option<String>,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
    /// HSM attempts summed over every device call the action made.
    #[serde(default)]
    pub attempts: u32,
    pub completed_at: DateTime<Utc>,
}

/// Any committed operation result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationResult {
    Signing(SigningResult),
    Lifecycle(LifecycleResult),
}

impl OperationResult {
    pub fn request_id(&self) -> &RequestId {
        match self {
            OperationResult::Signing(r) => &r.request_id,
            OperationResult::Lifecycle(r) => &r.request_id,
        }
    }

    pub fn outcome(&self) -> Outcome {
        match self {
            OperationResult::Signing(r) => r.outcome,
            OperationResult::Lifecycle(r) => r.outcome,
        }
    }
}

/// Merkle inclusion proof over audit entry hashes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    /// Sibling hashes from leaf to root
    pub siblings: Vec<[u8; 32]>,
    /// Index of the leaf
    pub leaf_index: usize,
    /// Hash of the leaf
    pub leaf_hash: [u8; 32],
}

impl MerkleProof {
    pub fn new(siblings: Vec<[u8; 32]>, leaf_index: usize, leaf_hash: [u8; 32]) -> Self {
        Self { siblings, leaf_index, leaf_hash }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_aliases() {
        assert_eq!("secp256k1".parse::<KeyAlgorithm>().unwrap(), KeyAlgorithm::EcdsaSecp256k1);
        assert_eq!("EDDSA_ED25519".parse::<KeyAlgorithm>().unwrap(), KeyAlgorithm::EddsaEd25519);
        assert_eq!("p-256".parse::<KeyAlgorithm>().unwrap(), KeyAlgorithm::EcdsaP256);
        assert!("RSA".parse::<KeyAlgorithm>().is_err());
    }

    #[test]
    fn test_signing_request_digest_serialises_as_hex() {
        let req = SigningRequest {
            request_id: "r1".into(),
            tenant_id: "t1".into(),
            key_id: "k1".into(),
            payload_digest: vec![0xab; 32],
            requested_at: Utc::now(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["payload_digest"], hex::encode([0xab; 32]));
        let back: SigningRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn test_lifecycle_action_target() {
        let action = LifecycleAction::RevokeKey { key_id: "k9".into(), reason: None };
        assert_eq!(action.target_key().map(KeyId::as_str), Some("k9"));
        assert_eq!(action.name(), "revoke_key");
        let gen = LifecycleAction::GenerateKey { algorithm: KeyAlgorithm::EcdsaP256, label: None };
        assert!(gen.target_key().is_none());
    }
}
