//! Signing orchestrator: drives validated requests through the HSM.
//!
//! Signing: `Received -> Validated -> HsmInvoked -> {Completed | Failed} -> Audited`.
//! Every request is first claimed in the idempotency store, so exactly one
//! task works on a request id. Work on a key happens under that key's lease,
//! and the result is committed before the lease is released.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditAction, AuditDraft, AuditLog};
use crate::ca::CertificateAuthority;
use crate::config::OrchestratorConfig;
use crate::error::{ErrorKind, GatewayError, Result};
use crate::hsm::{HsmCall, HsmGateway};
use crate::registry::KeyRegistry;
use crate::runtime::state::Progress;
use crate::storage::{Claim, ClaimOutcome, IdempotencyStore, LeaseGuard, LeaseTable, PendingOperation};
use crate::types::{
    KeyId, KeyStatus, LifecycleState, OperationResult, Outcome, RequestId, SigningRequest,
    SigningResult, SigningState, Stage,
};

pub(crate) struct Shared {
    pub(crate) registry: Arc<KeyRegistry>,
    pub(crate) ca: Arc<CertificateAuthority>,
    pub(crate) hsm: HsmGateway,
    pub(crate) audit: Arc<AuditLog>,
    pub(crate) requests: Arc<IdempotencyStore>,
    pub(crate) leases: Arc<LeaseTable>,
    pub(crate) config: OrchestratorConfig,
    instance: String,
    /// Serialises the audited check-and-mark between live tasks and recovery.
    audit_gate: Mutex<()>,
}

/// HSM bookkeeping accumulated while serving one request.
#[derive(Debug, Default)]
pub(crate) struct HsmTrace {
    pub(crate) attempts: u32,
    pub(crate) operation_id: Option<String>,
}

impl HsmTrace {
    pub(crate) fn record<T>(&mut self, call: &HsmCall<T>) {
        self.attempts += call.attempts;
        self.operation_id = Some(call.operation_id.clone());
    }
}

/// Outcome reported for an error that ends a request.
pub(crate) fn failure_outcome(error: &GatewayError) -> Outcome {
    if error.is_rejection() || error.kind() == ErrorKind::ConflictingState {
        Outcome::Rejected
    } else {
        Outcome::Failed
    }
}

/// Errors that leave the claim in place for recovery instead of committing a result.
pub(crate) fn is_infrastructure(error: &GatewayError) -> bool {
    matches!(error.kind(), ErrorKind::Storage | ErrorKind::Configuration)
}

fn initial_stage(operation: &PendingOperation) -> Stage {
    match operation {
        PendingOperation::Signing(_) => Stage::Signing(SigningState::Received),
        PendingOperation::Lifecycle(_) => Stage::Lifecycle(LifecycleState::Requested),
    }
}

#[derive(Clone)]
pub struct SigningOrchestrator {
    pub(crate) shared: Arc<Shared>,
}

impl SigningOrchestrator {
    pub fn new(
        registry: Arc<KeyRegistry>,
        ca: Arc<CertificateAuthority>,
        hsm: HsmGateway,
        audit: Arc<AuditLog>,
        requests: Arc<IdempotencyStore>,
        leases: Arc<LeaseTable>,
        config: OrchestratorConfig,
    ) -> Self {
        let instance = format!("gateway-{}", Uuid::new_v4());
        info!(instance = %instance, "orchestrator started");
        Self {
            shared: Arc::new(Shared {
                registry,
                ca,
                hsm,
                audit,
                requests,
                leases,
                config,
                instance,
                audit_gate: Mutex::new(()),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<KeyRegistry> {
        &self.shared.registry
    }

    pub fn certificates(&self) -> &Arc<CertificateAuthority> {
        &self.shared.ca
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.shared.audit
    }

    pub fn requests(&self) -> &Arc<IdempotencyStore> {
        &self.shared.requests
    }

    pub fn hsm(&self) -> &HsmGateway {
        &self.shared.hsm
    }

    /// Owner token for one unit of work. Unique per task so duplicate
    /// deliveries inside one process still contend for the claim.
    pub(crate) fn new_owner(&self) -> String {
        format!("{}/{}", self.shared.instance, Uuid::new_v4())
    }

    /// Run a validated operation to completion.
    ///
    /// The work runs on its own task: dropping the returned future does not
    /// abort it, and the result is still committed and audited.
    pub async fn execute(&self, operation: PendingOperation) -> Result<OperationResult> {
        let this = self.clone();
        tokio::spawn(async move { this.run(operation).await })
            .await
            .map_err(|e| GatewayError::storage(format!("orchestration task aborted: {}", e)))?
    }

    async fn run(self, operation: PendingOperation) -> Result<OperationResult> {
        let owner = self.new_owner();
        let request_id = operation.request_id().clone();
        let tenant_id = operation.tenant_id().clone();
        let stage = initial_stage(&operation);

        let claimed = self
            .shared
            .requests
            .claim(operation, &owner, stage, self.shared.config.lease_ttl());
        match claimed {
            Ok(ClaimOutcome::Claimed(claim)) => self.drive(claim).await,
            Ok(ClaimOutcome::Completed(result)) => {
                debug!(request_id = %request_id, "returning stored result");
                Ok(result)
            }
            Ok(ClaimOutcome::InFlight(claim)) => {
                debug!(request_id = %request_id, owner = %claim.owner, "request in flight, waiting");
                self.await_committed(&request_id).await
            }
            Err(e) if e.kind() == ErrorKind::ConflictingState => {
                self.record_rejection(tenant_id.as_str(), request_id.as_str(), None, &e);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Wait (bounded) for another task to commit `request_id`, taking the
    /// claim over if its owner lets it lapse.
    async fn await_committed(&self, request_id: &RequestId) -> Result<OperationResult> {
        let deadline = tokio::time::Instant::now() + self.shared.config.duplicate_wait();
        loop {
            if let Some(done) = self.shared.requests.completed(request_id) {
                return Ok(done.result);
            }
            if let Some(claim) = self.shared.requests.claim_of(request_id) {
                if claim.is_expired_at(Utc::now()) {
                    let owner = self.new_owner();
                    let retaken = self.shared.requests.claim(
                        claim.operation.clone(),
                        &owner,
                        claim.stage,
                        self.shared.config.lease_ttl(),
                    )?;
                    match retaken {
                        ClaimOutcome::Claimed(claim) => return self.drive(claim).await,
                        ClaimOutcome::Completed(result) => return Ok(result),
                        ClaimOutcome::InFlight(_) => {}
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(GatewayError::conflict(format!(
                    "request {} is still in flight",
                    request_id
                )));
            }
            tokio::time::sleep(self.shared.config.poll_interval()).await;
        }
    }

    /// Drive an owned claim to a committed, audited result.
    pub(crate) async fn drive(&self, claim: Claim) -> Result<OperationResult> {
        match claim.operation.clone() {
            PendingOperation::Signing(request) => self.drive_signing(&claim, &request).await,
            PendingOperation::Lifecycle(request) => self.drive_lifecycle(&claim, &request).await,
        }
    }

    /// Take the per-key lease, then push out the claim to cover the work ahead.
    pub(crate) async fn acquire_key_lease(
        &self,
        key_id: &KeyId,
        request_id: &RequestId,
        owner: &str,
        slot: &mut Option<LeaseGuard>,
    ) -> Result<()> {
        let config = &self.shared.config;
        let guard = self
            .shared
            .leases
            .acquire(
                key_id.as_str(),
                owner,
                config.lease_ttl(),
                config.lease_wait(),
                config.poll_interval(),
            )
            .await?;
        *slot = Some(guard);
        self.shared.requests.extend(request_id, owner, config.lease_ttl())?;
        debug!(request_id = %request_id, key_id = %key_id, "key lease acquired");
        Ok(())
    }

    /// Renew the claim and the key lease ahead of the next HSM step, so
    /// neither lapses while a chain of retried calls is still running.
    pub(crate) fn keep_alive(&self, progress: &Progress<'_>, lease: Option<&LeaseGuard>) -> Result<()> {
        let ttl = self.shared.config.lease_ttl();
        if let Some(guard) = lease {
            guard.renew(ttl)?;
        }
        progress.extend(ttl)
    }

    async fn drive_signing(&self, claim: &Claim, request: &SigningRequest) -> Result<OperationResult> {
        let owner = claim.owner.as_str();
        let mut progress = Progress::new(
            &self.shared.requests,
            request.request_id.clone(),
            claim.owner.clone(),
            claim.stage,
        );
        progress.advance(Stage::Signing(SigningState::Validated))?;

        let mut lease = None;
        let mut trace = HsmTrace::default();
        let signed = self.sign_steps(request, owner, &mut progress, &mut lease, &mut trace).await;

        let result = match signed {
            Ok(signature) => {
                progress.finish(Stage::Signing(SigningState::Completed))?;
                SigningResult {
                    request_id: request.request_id.clone(),
                    key_id: request.key_id.clone(),
                    signature,
                    hsm_operation_id: trace.operation_id,
                    completed_at: Utc::now(),
                    outcome: Outcome::Success,
                    attempts: trace.attempts,
                    error_kind: None,
                    message: None,
                }
            }
            Err(e) if is_infrastructure(&e) => return Err(e),
            Err(e) => {
                warn!(
                    request_id = %request.request_id,
                    key_id = %request.key_id,
                    attempts = trace.attempts,
                    error = %e,
                    "signing failed"
                );
                progress.finish(Stage::Signing(SigningState::Failed))?;
                SigningResult {
                    request_id: request.request_id.clone(),
                    key_id: request.key_id.clone(),
                    signature: Vec::new(),
                    hsm_operation_id: trace.operation_id,
                    completed_at: Utc::now(),
                    outcome: failure_outcome(&e),
                    attempts: trace.attempts,
                    error_kind: Some(e.kind()),
                    message: Some(e.to_string()),
                }
            }
        };

        let committed = self.shared.requests.complete(OperationResult::Signing(result), owner)?;
        drop(lease);

        self.audit_once(&committed, request.tenant_id.as_str(), false)?;
        progress.finish(Stage::Signing(SigningState::Audited))?;
        Ok(committed)
    }

    async fn sign_steps(
        &self,
        request: &SigningRequest,
        owner: &str,
        progress: &mut Progress<'_>,
        lease: &mut Option<LeaseGuard>,
        trace: &mut HsmTrace,
    ) -> Result<Vec<u8>> {
        self.acquire_key_lease(&request.key_id, &request.request_id, owner, lease).await?;

        // Status may have changed between validation and the lease.
        let record = self
            .shared
            .registry
            .get(&request.key_id)
            .ok_or_else(|| GatewayError::conflict(format!("key {} disappeared", request.key_id)))?;
        if record.tenant_id != request.tenant_id {
            return Err(GatewayError::conflict(format!(
                "key {} changed owner",
                request.key_id
            )));
        }
        if record.status != KeyStatus::Active {
            return Err(GatewayError::conflict(format!(
                "key {} became {:?} before signing",
                request.key_id, record.status
            )));
        }
        let handle = record
            .hsm_handle
            .clone()
            .ok_or_else(|| GatewayError::conflict(format!("key {} has no HSM handle", request.key_id)))?;

        progress.advance(Stage::Signing(SigningState::HsmInvoked))?;
        self.keep_alive(progress, lease.as_ref())?;
        let call = self
            .shared
            .hsm
            .sign(&handle, record.algorithm, &request.payload_digest)
            .await;
        trace.record(&call);
        let signature = call.result?;

        if let Err(e) = self.shared.registry.touch_last_used(&request.key_id) {
            warn!(key_id = %request.key_id, error = %e, "failed to record key usage");
        }
        debug!(
            request_id = %request.request_id,
            key_id = %request.key_id,
            attempts = trace.attempts,
            "digest signed"
        );
        Ok(signature)
    }

    /// Append the audit entry for a committed result unless one was already
    /// confirmed. With `check_log`, an entry already present in the log (from
    /// a crash between append and confirmation) is confirmed instead of duplicated.
    pub(crate) fn audit_once(&self, result: &OperationResult, actor: &str, check_log: bool) -> Result<bool> {
        let _gate = self.shared.audit_gate.lock();
        let request_id = result.request_id();
        if let Some(done) = self.shared.requests.completed(request_id) {
            if done.audited {
                return Ok(false);
            }
        }

        let draft = audit_draft(result, actor)?;
        let already_logged = check_log
            && self
                .shared
                .audit
                .by_correlation(request_id.as_str())
                .iter()
                .any(|e| e.action == draft.action);
        if !already_logged {
            self.shared.audit.append(draft)?;
        }
        self.shared.requests.mark_audited(request_id)?;
        Ok(!already_logged)
    }

    /// Record a refused request. Failing to audit is logged, not surfaced,
    /// so the caller still sees the original error.
    pub fn record_rejection(&self, actor: &str, correlation_id: &str, subject: Option<&str>, error: &GatewayError) {
        let correlation: String = correlation_id.chars().take(256).collect();
        let mut draft = AuditDraft::new(actor, AuditAction::RequestRejected, Outcome::Rejected)
            .correlation(correlation)
            .detail(json!({
                "error_kind": error.kind(),
                "reason": error.to_string(),
            }));
        if let Some(subject) = subject {
            draft = draft.subject(subject);
        }
        if let Err(e) = self.shared.audit.append(draft) {
            error!(correlation_id, error = %e, "failed to audit rejected request");
        }
    }
}

fn audit_draft(result: &OperationResult, actor: &str) -> Result<AuditDraft> {
    let draft = match result {
        OperationResult::Signing(r) => AuditDraft::new(actor, AuditAction::Sign, r.outcome)
            .subject(r.key_id.as_str())
            .correlation(r.request_id.as_str())
            .detail(json!({
                "attempts": r.attempts,
                "hsm_operation_id": r.hsm_operation_id,
                "error_kind": r.error_kind,
                "message": r.message,
            })),
        OperationResult::Lifecycle(r) => {
            let action = AuditAction::from_lifecycle(&r.action).ok_or_else(|| {
                GatewayError::storage(format!("unknown lifecycle action {}", r.action))
            })?;
            let mut draft = AuditDraft::new(actor, action, r.outcome)
                .correlation(r.request_id.as_str())
                .detail(json!({
                    "attempts": r.attempts,
                    "status": r.key.as_ref().map(|k| k.status),
                    "certificate_id": r.key.as_ref().and_then(|k| k.certificate_id.clone()),
                    "error_kind": r.error_kind,
                    "error": r.error,
                }));
            if let Some(key_id) = &r.key_id {
                draft = draft.subject(key_id.as_str());
            }
            draft
        }
    };
    Ok(draft)
}
