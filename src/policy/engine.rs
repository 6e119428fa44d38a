//! Request validator.
//!
//! Turns an authenticated [`RequestEnvelope`] into the typed operation the
//! orchestrator runs, or rejects it. Validation has no side effects: it only
//! reads the key registry.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::ca::CA_TENANT;
use crate::config::PolicyConfig;
use crate::error::{GatewayError, Result};
use crate::policy::evaluator;
use crate::policy::types::{PolicyContext, PolicyRule};
use crate::registry::KeyRegistry;
use crate::runtime::api::{RequestAction, RequestEnvelope, SignAction};
use crate::storage::PendingOperation;
use crate::types::{
    KeyAlgorithm, KeyId, KeyRecord, KeyStatus, LifecycleAction, LifecycleRequest, RequestId,
    SigningRequest, TenantId,
};

/// Longest request id, key id or label accepted.
pub const MAX_IDENTIFIER_LEN: usize = 128;
const MAX_CONTEXT_LEN: usize = 256;
const MAX_REASON_LEN: usize = 512;

/// `[A-Za-z0-9._:-]{1,128}`
pub fn is_valid_identifier(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_IDENTIFIER_LEN
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b':' | b'-'))
}

/// Key statuses in which `operation` may run. Empty when it targets no key.
pub fn allowed_statuses(operation: &PendingOperation) -> &'static [KeyStatus] {
    match operation {
        PendingOperation::Signing(_) => &[KeyStatus::Active],
        PendingOperation::Lifecycle(request) => match &request.action {
            LifecycleAction::GenerateKey { .. } => &[],
            LifecycleAction::ResumeKey { .. } => &[KeyStatus::Suspended],
            LifecycleAction::RevokeKey { .. } => &[KeyStatus::Active, KeyStatus::Suspended],
            LifecycleAction::SuspendKey { .. }
            | LifecycleAction::RotateKey { .. }
            | LifecycleAction::RenewCertificate { .. }
            | LifecycleAction::ProveOwnership { .. } => &[KeyStatus::Active],
        },
    }
}

/// Verifies envelope signatures made by the custody platform.
enum PlatformKey {
    Ed25519(ed25519_dalek::VerifyingKey),
    P256(p256::ecdsa::VerifyingKey),
}

impl PlatformKey {
    fn parse(algorithm: KeyAlgorithm, hex_key: &str) -> Result<Self> {
        let bytes = hex::decode(hex_key.trim()).map_err(|e| {
            GatewayError::configuration(format!("policy.platform_verification_key is not hex: {}", e))
        })?;
        match algorithm {
            KeyAlgorithm::EddsaEd25519 => {
                let raw: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                    GatewayError::configuration("Ed25519 platform key must be 32 bytes")
                })?;
                let key = ed25519_dalek::VerifyingKey::from_bytes(&raw)
                    .map_err(|e| GatewayError::configuration(format!("invalid Ed25519 platform key: {}", e)))?;
                Ok(PlatformKey::Ed25519(key))
            }
            KeyAlgorithm::EcdsaP256 => {
                let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(&bytes)
                    .map_err(|e| GatewayError::configuration(format!("invalid P-256 platform key: {}", e)))?;
                Ok(PlatformKey::P256(key))
            }
            KeyAlgorithm::EcdsaSecp256k1 => Err(GatewayError::configuration(
                "platform envelope signatures must use EDDSA_ED25519 or ECDSA_P256",
            )),
        }
    }

    fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        match self {
            PlatformKey::Ed25519(key) => {
                use ed25519_dalek::Verifier;
                ed25519_dalek::Signature::from_slice(signature)
                    .map(|sig| key.verify(message, &sig).is_ok())
                    .unwrap_or(false)
            }
            PlatformKey::P256(key) => {
                use p256::ecdsa::signature::Verifier;
                let sig = p256::ecdsa::Signature::from_der(signature)
                    .or_else(|_| p256::ecdsa::Signature::from_slice(signature));
                sig.map(|sig| key.verify(message, &sig).is_ok()).unwrap_or(false)
            }
        }
    }
}

/// Bytes the platform signs: `request_id || "|" || JSON(action)`.
pub fn envelope_signing_message(request_id: &str, action: &RequestAction) -> Result<Vec<u8>> {
    let mut message = request_id.as_bytes().to_vec();
    message.push(b'|');
    message.extend(serde_json::to_vec(action)?);
    Ok(message)
}

/// Schema, ownership, status and policy checks.
pub struct RequestValidator {
    registry: Arc<KeyRegistry>,
    rules: Vec<PolicyRule>,
    platform_key: Option<PlatformKey>,
    max_clock_skew: chrono::Duration,
}

fn malformed(reason: impl Into<String>) -> GatewayError {
    GatewayError::malformed(reason)
}

fn check_identifier(field: &str, value: &str) -> Result<()> {
    if is_valid_identifier(value) {
        Ok(())
    } else {
        Err(malformed(format!(
            "{} must be 1-{} characters of [A-Za-z0-9._:-]",
            field, MAX_IDENTIFIER_LEN
        )))
    }
}

fn check_reason(reason: Option<&String>) -> Result<()> {
    match reason {
        Some(r) if r.len() > MAX_REASON_LEN => {
            Err(malformed(format!("reason exceeds {} bytes", MAX_REASON_LEN)))
        }
        _ => Ok(()),
    }
}

impl RequestValidator {
    pub fn new(registry: Arc<KeyRegistry>, config: &PolicyConfig) -> Result<Self> {
        let platform_key = config
            .platform_verification_key
            .as_deref()
            .map(|key| PlatformKey::parse(config.platform_key_algorithm, key))
            .transpose()?;
        let skew_secs = i64::try_from(config.max_clock_skew_secs).unwrap_or(i64::MAX);
        Ok(Self {
            registry,
            rules: config.rules.clone(),
            platform_key,
            max_clock_skew: chrono::Duration::seconds(skew_secs),
        })
    }

    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    pub fn validate(&self, tenant_id: &TenantId, envelope: &RequestEnvelope) -> Result<PendingOperation> {
        self.validate_at(tenant_id, envelope, Utc::now())
    }

    /// Full validation as of `now`: [`parse`](Self::parse) then [`check`](Self::check).
    pub fn validate_at(
        &self,
        tenant_id: &TenantId,
        envelope: &RequestEnvelope,
        now: DateTime<Utc>,
    ) -> Result<PendingOperation> {
        let operation = self.parse(tenant_id, envelope)?;
        self.check(&operation, now)?;
        Ok(operation)
    }

    /// Checks that depend only on the envelope: schema and platform signature.
    pub fn parse(&self, tenant_id: &TenantId, envelope: &RequestEnvelope) -> Result<PendingOperation> {
        if tenant_id.as_str() == CA_TENANT {
            return Err(GatewayError::policy("reserved tenant cannot issue requests"));
        }

        // Schema
        check_identifier("request_id", &envelope.request_id)?;
        let request_id = RequestId::new(envelope.request_id.clone());
        let operation = match &envelope.action {
            RequestAction::Sign(SignAction::Sign { key_id, payload_digest }) => {
                check_identifier("key_id", key_id.as_str())?;
                let digest = hex::decode(payload_digest.trim())
                    .map_err(|e| malformed(format!("payload_digest is not hex: {}", e)))?;
                if digest.is_empty() {
                    return Err(malformed("payload_digest is empty"));
                }
                PendingOperation::Signing(SigningRequest {
                    request_id,
                    tenant_id: tenant_id.clone(),
                    key_id: key_id.clone(),
                    payload_digest: digest,
                    requested_at: envelope.requested_at,
                })
            }
            RequestAction::Lifecycle(action) => {
                self.check_lifecycle_schema(action)?;
                PendingOperation::Lifecycle(LifecycleRequest {
                    request_id,
                    tenant_id: tenant_id.clone(),
                    action: action.clone(),
                    requested_at: envelope.requested_at,
                })
            }
        };

        if let Some(platform_key) = &self.platform_key {
            let signature = envelope
                .envelope_signature
                .as_deref()
                .ok_or_else(|| GatewayError::policy("envelope signature required"))?;
            let signature = hex::decode(signature.trim())
                .map_err(|_| GatewayError::policy("envelope signature is not hex"))?;
            let message = envelope_signing_message(&envelope.request_id, &envelope.action)?;
            if !platform_key.verify(&message, &signature) {
                return Err(GatewayError::policy("envelope signature does not verify"));
            }
        }
        Ok(operation)
    }

    /// Checks against gateway state: clock skew, key ownership and status,
    /// digest length and the configured rules.
    pub fn check(&self, operation: &PendingOperation, now: DateTime<Utc>) -> Result<()> {
        let tenant_id = operation.tenant_id();
        let requested_at = match operation {
            PendingOperation::Signing(request) => request.requested_at,
            PendingOperation::Lifecycle(request) => request.requested_at,
        };
        if requested_at - now > self.max_clock_skew {
            return Err(GatewayError::policy(format!(
                "requested_at {} is ahead of gateway clock",
                requested_at
            )));
        }

        // Ownership and status
        let target = self.target_key(operation)?;
        if let Some(record) = &target {
            if &record.tenant_id != tenant_id {
                return Err(GatewayError::policy(format!(
                    "tenant {} does not own key {}",
                    tenant_id, record.key_id
                )));
            }
            let allowed = allowed_statuses(operation);
            if !allowed.contains(&record.status) {
                return Err(GatewayError::policy(format!(
                    "key {} is {:?}; {} requires {:?}",
                    record.key_id,
                    record.status,
                    operation_name(operation),
                    allowed
                )));
            }
        }

        if let (PendingOperation::Signing(request), Some(record)) = (operation, &target) {
            let expected = record.algorithm.digest_len();
            if request.payload_digest.len() != expected {
                return Err(malformed(format!(
                    "payload_digest must be {} bytes for {}, got {}",
                    expected,
                    record.algorithm,
                    request.payload_digest.len()
                )));
            }
        }

        // Deployment rules
        let (algorithm, creates_key) = match operation {
            PendingOperation::Lifecycle(LifecycleRequest {
                action: LifecycleAction::GenerateKey { algorithm, .. },
                ..
            }) => (Some(*algorithm), true),
            _ => (target.as_ref().map(|r| r.algorithm), false),
        };
        let ctx = PolicyContext {
            tenant_id,
            algorithm,
            creates_key,
            live_keys: if creates_key { self.registry.count_live(tenant_id) } else { 0 },
            requested_at,
            now,
        };
        let evaluation = evaluator::evaluate_rules(&self.rules, &ctx);
        if let (Some(idx), Some(reason)) = (evaluation.failed_rule, evaluation.reason) {
            let rule = self.rules.get(idx).map(PolicyRule::name).unwrap_or("UNKNOWN");
            return Err(GatewayError::policy(format!("{}: {}", rule, reason)));
        }

        debug!(
            request_id = %operation.request_id(),
            tenant_id = %tenant_id,
            operation = operation_name(operation),
            rules = evaluation.satisfied_rules.len(),
            "request validated"
        );
        Ok(())
    }

    fn check_lifecycle_schema(&self, action: &LifecycleAction) -> Result<()> {
        if let Some(key_id) = action.target_key() {
            check_identifier("key_id", key_id.as_str())?;
        }
        match action {
            LifecycleAction::GenerateKey { label, .. } => {
                if let Some(label) = label {
                    check_identifier("label", label)?;
                }
                Ok(())
            }
            LifecycleAction::SuspendKey { reason, .. } | LifecycleAction::RevokeKey { reason, .. } => {
                check_reason(reason.as_ref())
            }
            LifecycleAction::ProveOwnership { context, .. } => {
                if context.is_empty() || context.len() > MAX_CONTEXT_LEN {
                    return Err(malformed(format!(
                        "context must be 1-{} bytes",
                        MAX_CONTEXT_LEN
                    )));
                }
                if context.contains('|') || context.chars().any(char::is_control) {
                    return Err(malformed("context may not contain '|' or control characters"));
                }
                Ok(())
            }
            LifecycleAction::ResumeKey { .. }
            | LifecycleAction::RotateKey { .. }
            | LifecycleAction::RenewCertificate { .. } => Ok(()),
        }
    }

    fn target_key(&self, operation: &PendingOperation) -> Result<Option<KeyRecord>> {
        let key_id: Option<&KeyId> = match operation {
            PendingOperation::Signing(request) => Some(&request.key_id),
            PendingOperation::Lifecycle(request) => request.action.target_key(),
        };
        match key_id {
            None => Ok(None),
            Some(key_id) => self
                .registry
                .get(key_id)
                .map(Some)
                .ok_or_else(|| GatewayError::policy(format!("unknown key {}", key_id))),
        }
    }
}

fn operation_name(operation: &PendingOperation) -> &'static str {
    match operation {
        PendingOperation::Signing(_) => "sign",
        PendingOperation::Lifecycle(request) => request.action.name(),
    }
}
