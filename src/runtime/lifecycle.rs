//! Key lifecycle operations.
//!
//! `Requested -> PolicyChecked -> HsmExecuted -> Recorded -> Audited`.
//! Each action runs under the lease of the key it touches and is written so
//! that a request taken over after a crash can run it again safely.

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ErrorKind, GatewayError, Result};
use crate::hsm::KeyGenParams;
use crate::policy::allowed_statuses;
use crate::runtime::orchestrator::{failure_outcome, is_infrastructure, HsmTrace, SigningOrchestrator};
use crate::runtime::state::Progress;
use crate::storage::{Claim, LeaseGuard, PendingOperation};
use crate::types::{
    CertificateRecord, KeyAlgorithm, KeyId, KeyRecord, KeyStatus, LifecycleAction, LifecycleRequest,
    LifecycleResult, LifecycleState, OperationResult, Outcome, RequestId, Stage, TenantId,
};
use crate::utils::sha256;

/// Key id assigned to the key created by `request_id`.
pub fn derived_key_id(tenant_id: &TenantId, request_id: &RequestId) -> KeyId {
    let name = format!("{}|{}", tenant_id, request_id);
    KeyId::new(format!("key-{}", Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())))
}

/// Message signed to prove control of a key.
pub fn proof_of_ownership_message(key_id: &KeyId, context: &str, unix_time: i64) -> String {
    format!("ExternalKeyStore|Proof of Ownership|{}|{}|{}", key_id, context, unix_time)
}

/// What a successful action hands back.
#[derive(Default)]
struct Effect {
    key: Option<KeyRecord>,
    certificate_pem: Option<String>,
    message: Option<String>,
    signature: Vec<u8>,
}

impl Effect {
    fn key(key: KeyRecord) -> Self {
        Self { key: Some(key), ..Self::default() }
    }
}

struct Step<'p, 'a> {
    claim: &'p Claim,
    request: &'p LifecycleRequest,
    progress: &'p mut Progress<'a>,
    lease: &'p mut Option<LeaseGuard>,
    trace: &'p mut HsmTrace,
}

impl SigningOrchestrator {
    pub(crate) async fn drive_lifecycle(
        &self,
        claim: &Claim,
        request: &LifecycleRequest,
    ) -> Result<OperationResult> {
        let owner = claim.owner.as_str();
        let mut progress = Progress::new(
            &self.shared.requests,
            request.request_id.clone(),
            claim.owner.clone(),
            claim.stage,
        );
        progress.advance(Stage::Lifecycle(LifecycleState::PolicyChecked))?;

        let mut lease = None;
        let mut trace = HsmTrace::default();
        let key_id = match request.action.target_key() {
            Some(key_id) => key_id.clone(),
            None => derived_key_id(&request.tenant_id, &request.request_id),
        };

        let applied = {
            let step = Step {
                claim,
                request,
                progress: &mut progress,
                lease: &mut lease,
                trace: &mut trace,
            };
            self.apply(step, &key_id).await
        };

        let result = match applied {
            Ok(effect) => LifecycleResult {
                request_id: request.request_id.clone(),
                action: request.action.name().to_string(),
                key_id: effect.key.as_ref().map(|k| k.key_id.clone()).or(Some(key_id.clone())),
                outcome: Outcome::Success,
                key: effect.key,
                certificate_pem: effect.certificate_pem,
                message: effect.message,
                signature: effect.signature,
                error_kind: None,
                error: None,
                attempts: trace.attempts,
                completed_at: Utc::now(),
            },
            Err(e) if is_infrastructure(&e) => return Err(e),
            Err(e) => {
                warn!(
                    request_id = %request.request_id,
                    action = request.action.name(),
                    key_id = %key_id,
                    error = %e,
                    "lifecycle action failed"
                );
                LifecycleResult {
                    request_id: request.request_id.clone(),
                    action: request.action.name().to_string(),
                    key_id: Some(key_id.clone()),
                    outcome: failure_outcome(&e),
                    key: self.shared.registry.get(&key_id),
                    certificate_pem: None,
                    message: None,
                    signature: Vec::new(),
                    error_kind: Some(e.kind()),
                    error: Some(e.to_string()),
                    attempts: trace.attempts,
                    completed_at: Utc::now(),
                }
            }
        };
        progress.finish(Stage::Lifecycle(LifecycleState::Recorded))?;

        let committed = self
            .shared
            .requests
            .complete(OperationResult::Lifecycle(result), owner)?;
        drop(lease);

        self.audit_once(&committed, request.tenant_id.as_str(), false)?;
        progress.finish(Stage::Lifecycle(LifecycleState::Audited))?;
        Ok(committed)
    }

    async fn apply(&self, step: Step<'_, '_>, key_id: &KeyId) -> Result<Effect> {
        let Step { claim, request, progress, lease, trace } = step;
        self.acquire_key_lease(key_id, &request.request_id, &claim.owner, lease).await?;
        let lease = lease.as_ref();
        let resumed = claim.takeovers > 0;

        match &request.action {
            LifecycleAction::GenerateKey { algorithm, label } => {
                let (key, certificate) = self
                    .provision(request, key_id, *algorithm, label.clone(), None, progress, lease, trace)
                    .await?;
                Ok(Effect { certificate_pem: Some(certificate.pem), ..Effect::key(key) })
            }
            LifecycleAction::SuspendKey { reason, .. } => {
                let (record, done) = self.locked_key(&claim.operation, key_id, Some(KeyStatus::Suspended), resumed)?;
                if done {
                    return Ok(Effect::key(record));
                }
                let reason = reason.clone().or_else(|| Some("suspended by tenant".to_string()));
                let record = self.shared.registry.transition(key_id, KeyStatus::Suspended, reason)?;
                Ok(Effect::key(record))
            }
            LifecycleAction::ResumeKey { .. } => {
                let (record, done) = self.locked_key(&claim.operation, key_id, Some(KeyStatus::Active), resumed)?;
                if done {
                    return Ok(Effect::key(record));
                }
                let record = self.shared.registry.transition(key_id, KeyStatus::Active, None)?;
                Ok(Effect::key(record))
            }
            LifecycleAction::RevokeKey { reason, .. } => {
                let (record, done) = self.locked_key(&claim.operation, key_id, Some(KeyStatus::Revoked), resumed)?;
                if done {
                    return Ok(Effect::key(record));
                }
                let reason = reason.clone().unwrap_or_else(|| "revoked by tenant".to_string());
                let record = self.retire(&record, reason, progress, lease, trace).await?;
                Ok(Effect::key(record))
            }
            LifecycleAction::RotateKey { .. } => {
                let successor_id = derived_key_id(&request.tenant_id, &request.request_id);
                let (record, done) = self.locked_key(&claim.operation, key_id, Some(KeyStatus::Revoked), resumed)?;
                if done {
                    let successor = self.shared.registry.get(&successor_id).ok_or_else(|| {
                        GatewayError::conflict(format!("key {} was revoked without a successor", key_id))
                    })?;
                    let certificate_pem = successor
                        .certificate_id
                        .as_ref()
                        .and_then(|id| self.shared.ca.get(id))
                        .map(|c| c.pem);
                    return Ok(Effect { certificate_pem, ..Effect::key(successor) });
                }

                let (successor, certificate) = self
                    .provision(
                        request,
                        &successor_id,
                        record.algorithm,
                        record.label.clone(),
                        Some(record.key_id.clone()),
                        progress,
                        lease,
                        trace,
                    )
                    .await?;
                self.retire(&record, format!("rotated to {}", successor.key_id), progress, lease, trace)
                    .await
                    .map_err(|e| {
                        // A lost claim is reported as is
                        if is_infrastructure(&e) || e.kind() == ErrorKind::ConflictingState {
                            return e;
                        }
                        GatewayError::hsm_rejected(format!(
                            "successor {} is active but {} could not be retired: {}",
                            successor.key_id, record.key_id, e
                        ))
                    })?;
                info!(from = %record.key_id, to = %successor.key_id, "key rotated");
                Ok(Effect { certificate_pem: Some(certificate.pem), ..Effect::key(successor) })
            }
            LifecycleAction::RenewCertificate { .. } => {
                let (record, _) = self.locked_key(&claim.operation, key_id, None, resumed)?;
                self.keep_alive(progress, lease)?;
                let certificate = self.shared.ca.renew(&record, &request.request_id).await?;
                progress.advance(Stage::Lifecycle(LifecycleState::HsmExecuted))?;
                let record = self
                    .shared
                    .registry
                    .attach_certificate(key_id, certificate.certificate_id.clone())?;
                Ok(Effect { certificate_pem: Some(certificate.pem), ..Effect::key(record) })
            }
            LifecycleAction::ProveOwnership { context, .. } => {
                let (record, _) = self.locked_key(&claim.operation, key_id, None, resumed)?;
                let handle = record
                    .hsm_handle
                    .clone()
                    .ok_or_else(|| GatewayError::conflict(format!("key {} has no HSM handle", key_id)))?;
                let message = proof_of_ownership_message(key_id, context, request.requested_at.timestamp());
                let digest = sha256(message.as_bytes());
                self.keep_alive(progress, lease)?;

                let call = self.shared.hsm.sign(&handle, record.algorithm, &digest).await;
                trace.record(&call);
                let signature = call.result?;
                progress.advance(Stage::Lifecycle(LifecycleState::HsmExecuted))?;

                if let Err(e) = self.shared.registry.touch_last_used(key_id) {
                    warn!(key_id = %key_id, error = %e, "failed to record key usage");
                }
                Ok(Effect { message: Some(message), signature, ..Effect::key(record) })
            }
        }
    }

    /// Re-read the key under its lease.
    ///
    /// Returns `(record, true)` when a resumed request finds the key already
    /// in `target`, meaning an earlier attempt got that far.
    fn locked_key(
        &self,
        operation: &PendingOperation,
        key_id: &KeyId,
        target: Option<KeyStatus>,
        resumed: bool,
    ) -> Result<(KeyRecord, bool)> {
        let record = self
            .shared
            .registry
            .get(key_id)
            .ok_or_else(|| GatewayError::conflict(format!("key {} disappeared", key_id)))?;
        if &record.tenant_id != operation.tenant_id() {
            return Err(GatewayError::conflict(format!("key {} changed owner", key_id)));
        }
        if resumed && target == Some(record.status) {
            return Ok((record, true));
        }
        if !allowed_statuses(operation).contains(&record.status) {
            return Err(GatewayError::conflict(format!(
                "key {} became {:?} before the change was applied",
                key_id, record.status
            )));
        }
        Ok((record, false))
    }

    /// Create a key in the HSM, certify it and activate it.
    ///
    /// A failure after the device created the key destroys it again and
    /// revokes the record, so no half-provisioned key is left usable.
    #[allow(clippy::too_many_arguments)]
    async fn provision(
        &self,
        request: &LifecycleRequest,
        key_id: &KeyId,
        algorithm: KeyAlgorithm,
        label: Option<String>,
        rotated_from: Option<KeyId>,
        progress: &mut Progress<'_>,
        lease: Option<&LeaseGuard>,
        trace: &mut HsmTrace,
    ) -> Result<(KeyRecord, CertificateRecord)> {
        let now = Utc::now();
        let record = self.shared.registry.insert_pending(KeyRecord {
            key_id: key_id.clone(),
            tenant_id: request.tenant_id.clone(),
            algorithm,
            status: KeyStatus::Pending,
            hsm_handle: None,
            certificate_id: None,
            label,
            rotated_from,
            status_reason: None,
            created_at: now,
            updated_at: now,
            last_used_at: None,
        })?;

        match record.status {
            KeyStatus::Pending => {}
            KeyStatus::Active => {
                let certificate = record
                    .certificate_id
                    .as_ref()
                    .and_then(|id| self.shared.ca.get(id))
                    .ok_or_else(|| GatewayError::issuance(format!("key {} has no certificate", key_id)))?;
                return Ok((record, certificate));
            }
            status => {
                return Err(GatewayError::conflict(format!(
                    "key {} is {:?}: {}",
                    key_id,
                    status,
                    record.status_reason.clone().unwrap_or_default()
                )));
            }
        }

        let record = match record.hsm_handle {
            Some(_) => record,
            None => {
                self.keep_alive(progress, lease)?;
                let call = self
                    .shared
                    .hsm
                    .generate_key(&KeyGenParams { algorithm, label: key_id.to_string() })
                    .await;
                trace.record(&call);
                match call.result {
                    Ok(generated) => self.shared.registry.attach_handle(key_id, generated.handle)?,
                    Err(e) => {
                        self.abandon(key_id, format!("key generation failed: {}", e))?;
                        return Err(e);
                    }
                }
            }
        };
        progress.advance(Stage::Lifecycle(LifecycleState::HsmExecuted))?;

        self.keep_alive(progress, lease)?;
        let certificate = match self.shared.ca.issue(&record, &request.request_id, None).await {
            Ok(certificate) => certificate,
            Err(e) => {
                if let Some(handle) = &record.hsm_handle {
                    if let Err(renew) = self.keep_alive(progress, lease) {
                        warn!(key_id = %key_id, error = %renew, "could not renew claim before cleanup");
                    }
                    let call = self.shared.hsm.destroy_key(handle).await;
                    trace.record(&call);
                    if let Err(destroy) = call.result {
                        warn!(key_id = %key_id, error = %destroy, "could not destroy uncertified key");
                    }
                }
                self.abandon(key_id, format!("certificate issuance failed: {}", e))?;
                return Err(e);
            }
        };

        self.shared
            .registry
            .attach_certificate(key_id, certificate.certificate_id.clone())?;
        let record = self.shared.registry.transition(key_id, KeyStatus::Active, None)?;
        info!(
            key_id = %key_id,
            tenant_id = %record.tenant_id,
            algorithm = %algorithm,
            certificate_id = %certificate.certificate_id,
            "key provisioned"
        );
        Ok((record, certificate))
    }

    fn abandon(&self, key_id: &KeyId, reason: String) -> Result<()> {
        self.shared.registry.transition(key_id, KeyStatus::Revoked, Some(reason))?;
        Ok(())
    }

    /// Destroy the key material, then record the key Revoked.
    async fn retire(
        &self,
        record: &KeyRecord,
        reason: String,
        progress: &mut Progress<'_>,
        lease: Option<&LeaseGuard>,
        trace: &mut HsmTrace,
    ) -> Result<KeyRecord> {
        if let Some(handle) = &record.hsm_handle {
            self.keep_alive(progress, lease)?;
            let call = self.shared.hsm.destroy_key(handle).await;
            trace.record(&call);
            call.result?;
        }
        progress.advance(Stage::Lifecycle(LifecycleState::HsmExecuted))?;
        self.shared
            .registry
            .transition(&record.key_id, KeyStatus::Revoked, Some(reason))
    }
}
