//! Gateway entry points and wire envelopes.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::audit::{AuditAction, AuditDraft, AuditExport, AuditLog};
use crate::auth::{AuthGate, CredentialIntrospector, Scope};
use crate::ca::CertificateAuthority;
use crate::config::GatewayConfig;
use crate::error::{ErrorKind, GatewayError, Result};
use crate::hsm::software_hsm::generate_mnemonic;
use crate::hsm::{HsmConnector, HsmGateway, SoftwareHsm};
use crate::policy::RequestValidator;
use crate::registry::KeyRegistry;
use crate::runtime::orchestrator::{failure_outcome, SigningOrchestrator};
use crate::runtime::recovery::RecoveryReport;
use crate::storage::{self, DirLock, IdempotencyStore, LeaseTable};
use crate::types::{
    CertificateRecord, KeyId, KeyRecord, LifecycleAction, OperationResult, Outcome, RequestId, Stage,
};

/// The signing action on the wire: `{"type": "SIGN", "key_id": .., "payload_digest": ..}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignAction {
    Sign {
        key_id: KeyId,
        /// Hex encoded digest of the payload.
        payload_digest: String,
    },
}

/// Any action a caller can request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestAction {
    Sign(SignAction),
    Lifecycle(LifecycleAction),
}

impl RequestAction {
    pub fn sign(key_id: impl Into<KeyId>, payload_digest: impl Into<String>) -> Self {
        RequestAction::Sign(SignAction::Sign { key_id: key_id.into(), payload_digest: payload_digest.into() })
    }

    /// Scope a credential needs to request this action.
    pub fn required_scope(&self) -> Scope {
        match self {
            RequestAction::Sign(_) | RequestAction::Lifecycle(LifecycleAction::ProveOwnership { .. }) => {
                Scope::KeyOperation
            }
            RequestAction::Lifecycle(_) => Scope::KeyManagement,
        }
    }

    pub fn target_key(&self) -> Option<&KeyId> {
        match self {
            RequestAction::Sign(SignAction::Sign { key_id, .. }) => Some(key_id),
            RequestAction::Lifecycle(action) => action.target_key(),
        }
    }
}

/// Inbound request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Caller-chosen idempotency key.
    pub request_id: String,
    /// `Bearer <token>` or a bare token.
    #[serde(default, skip_serializing)]
    pub credential: Option<String>,
    pub action: RequestAction,
    pub requested_at: DateTime<Utc>,
    /// Hex platform signature over the request id and action.
    #[serde(default)]
    pub envelope_signature: Option<String>,
}

/// Outbound response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub request_id: String,
    pub outcome: Outcome,
    /// Hex signature for SIGN and PROVE_OWNERSHIP.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// PEM certificate for GENERATE_KEY, ROTATE_KEY and RENEW_CERTIFICATE.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<KeyRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub attempts: u32,
}

fn non_empty_hex(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() {
        None
    } else {
        Some(hex::encode(bytes))
    }
}

impl ResponseEnvelope {
    pub fn from_result(result: &OperationResult) -> Self {
        match result {
            OperationResult::Signing(r) => Self {
                request_id: r.request_id.to_string(),
                outcome: r.outcome,
                signature: non_empty_hex(&r.signature),
                certificate: None,
                key: None,
                error_kind: r.error_kind,
                message: r.message.clone(),
                attempts: r.attempts,
            },
            OperationResult::Lifecycle(r) => Self {
                request_id: r.request_id.to_string(),
                outcome: r.outcome,
                signature: non_empty_hex(&r.signature),
                certificate: r.certificate_pem.clone(),
                key: r.key.clone(),
                error_kind: r.error_kind,
                message: r.error.clone().or_else(|| r.message.clone()),
                attempts: r.attempts,
            },
        }
    }

    pub fn from_error(request_id: impl Into<String>, error: &GatewayError) -> Self {
        Self {
            request_id: request_id.into(),
            outcome: failure_outcome(error),
            signature: None,
            certificate: None,
            key: None,
            error_kind: Some(error.kind()),
            message: Some(error.to_string()),
            attempts: 0,
        }
    }
}

/// Where a request currently stands.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Completed { result: OperationResult, audited: bool },
    InFlight { stage: Stage, expires_at: DateTime<Utc>, takeovers: u32 },
    Unknown,
}

/// Build the bundled software HSM from configuration.
///
/// A persistent key store needs the mnemonic that protects it; without a
/// data directory keys live in memory and a fresh mnemonic is generated.
pub fn software_hsm(config: &GatewayConfig) -> Result<SoftwareHsm> {
    let dir: Option<PathBuf> = config
        .storage
        .data_dir
        .as_ref()
        .map(|d| d.join(storage::HSM_KEYSTORE_DIR));
    let software = &config.hsm.software;
    let mnemonic = match (&software.mnemonic, &dir) {
        (Some(mnemonic), _) => mnemonic.clone(),
        (None, Some(dir)) => {
            return Err(GatewayError::configuration(format!(
                "hsm.software.mnemonic is required to open the key store at {}",
                dir.display()
            )))
        }
        (None, None) => generate_mnemonic()?,
    };
    Ok(SoftwareHsm::open(dir, &mnemonic, &software.passphrase)?)
}

pub struct Gateway {
    auth: AuthGate,
    validator: RequestValidator,
    orchestrator: SigningOrchestrator,
    sweeper: Option<JoinHandle<()>>,
    _lock: Option<DirLock>,
}

impl Drop for Gateway {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

impl Gateway {
    /// Open every store under `storage.data_dir`, bootstrap the issuer and
    /// authenticate with the configured static tokens.
    pub async fn open(config: GatewayConfig, connector: Arc<dyn HsmConnector>) -> Result<Self> {
        let auth = AuthGate::from_config(&config.auth);
        Self::assemble(config, connector, auth).await
    }

    /// Like [`Gateway::open`] with a custom credential introspector.
    pub async fn open_with_introspector(
        config: GatewayConfig,
        connector: Arc<dyn HsmConnector>,
        introspector: Arc<dyn CredentialIntrospector>,
    ) -> Result<Self> {
        let auth = AuthGate::new(introspector, config.auth.cache_ttl());
        Self::assemble(config, connector, auth).await
    }

    async fn assemble(config: GatewayConfig, connector: Arc<dyn HsmConnector>, auth: AuthGate) -> Result<Self> {
        config.validate()?;
        let fsync = config.storage.fsync;
        let path = |name: &str| config.storage.journal_path(name);

        let lock = match &config.storage.data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                Some(DirLock::acquire(dir)?)
            }
            None => None,
        };
        let registry = Arc::new(KeyRegistry::open(path(storage::REGISTRY_JOURNAL).as_deref(), fsync)?);
        let audit = Arc::new(AuditLog::open(path(storage::AUDIT_JOURNAL).as_deref(), fsync)?);
        let requests = Arc::new(IdempotencyStore::open(path(storage::IDEMPOTENCY_JOURNAL).as_deref(), fsync)?);
        let leases = LeaseTable::open(path(storage::LEASE_JOURNAL).as_deref(), fsync)?;

        let hsm = HsmGateway::new(connector, config.hsm.clone());
        let ca = Arc::new(CertificateAuthority::open(
            path(storage::CERTIFICATE_JOURNAL).as_deref(),
            fsync,
            hsm.clone(),
            Arc::clone(&registry),
            config.certificates.clone(),
        )?);
        if let Some(certificate) = ca.bootstrap().await? {
            audit.append(
                AuditDraft::new("gateway", AuditAction::IssuerBootstrapped, Outcome::Success)
                    .subject(certificate.key_id.as_str())
                    .detail(json!({
                        "certificate_id": certificate.certificate_id,
                        "serial_number": certificate.serial_number,
                        "fingerprint": certificate.fingerprint,
                    })),
            )?;
        }

        let validator = RequestValidator::new(Arc::clone(&registry), &config.policy)?;
        let orchestrator = SigningOrchestrator::new(
            registry,
            ca,
            hsm,
            audit,
            requests,
            leases,
            config.orchestrator.clone(),
        );
        let sweeper = config
            .orchestrator
            .recovery_interval()
            .map(|period| orchestrator.spawn_sweeper(period));
        info!(
            data_dir = ?config.storage.data_dir,
            pool_size = config.hsm.pool_size,
            rules = config.policy.rules.len(),
            recovery_interval_ms = config.orchestrator.recovery_interval_ms,
            "gateway ready"
        );
        Ok(Self { auth, validator, orchestrator, sweeper, _lock: lock })
    }

    /// Serve one request. Never fails: errors become a response.
    pub async fn handle(&self, envelope: RequestEnvelope) -> ResponseEnvelope {
        let request_id = envelope.request_id.clone();
        match self.submit(envelope).await {
            Ok(result) => ResponseEnvelope::from_result(&result),
            Err(e) => ResponseEnvelope::from_error(request_id, &e),
        }
    }

    /// Serve one request, returning the committed result.
    #[instrument(skip_all, fields(request_id = %envelope.request_id))]
    pub async fn submit(&self, envelope: RequestEnvelope) -> Result<OperationResult> {
        let subject = envelope.action.target_key().map(|k| k.to_string());
        let identity = match self.auth.authenticate(envelope.credential.as_deref()).await {
            Ok(identity) => identity,
            Err(e) => {
                warn!(error = %e, "request refused");
                self.orchestrator
                    .record_rejection("anonymous", &envelope.request_id, subject.as_deref(), &e);
                return Err(e);
            }
        };
        let tenant = identity.tenant_id.as_str();

        let parsed = self
            .auth
            .authorize(&identity, envelope.action.required_scope())
            .and_then(|_| self.validator.parse(&identity.tenant_id, &envelope));
        let operation = match parsed {
            Ok(operation) => operation,
            Err(e) => {
                warn!(tenant_id = tenant, error = %e, "request refused");
                self.orchestrator
                    .record_rejection(tenant, &envelope.request_id, subject.as_deref(), &e);
                return Err(e);
            }
        };

        // A request id already seen skips policy checks: the stored (or
        // in-flight) outcome stands, provided the payload matches.
        let requests = self.orchestrator.requests();
        let request_id = operation.request_id();
        let known = requests.completed(request_id).is_some() || requests.claim_of(request_id).is_some();
        if !known {
            if let Err(e) = self.validator.check(&operation, Utc::now()) {
                warn!(tenant_id = tenant, error = %e, "request refused");
                self.orchestrator
                    .record_rejection(tenant, &envelope.request_id, subject.as_deref(), &e);
                return Err(e);
            }
        } else {
            debug!(tenant_id = tenant, "request id already known");
        }

        self.orchestrator.execute(operation).await
    }

    /// Status of a request owned by the caller's tenant.
    pub async fn request_status(&self, credential: Option<&str>, request_id: &str) -> Result<RequestStatus> {
        let identity = self.auth.authenticate(credential).await?;
        if !identity.has_scope(Scope::KeyManagement) {
            self.auth.authorize(&identity, Scope::KeyOperation)?;
        }
        let request_id = RequestId::new(request_id);
        let requests = self.orchestrator.requests();

        if let Some(done) = requests.completed(&request_id) {
            if done.tenant_id == identity.tenant_id {
                return Ok(RequestStatus::Completed { result: done.result, audited: done.audited });
            }
            return Ok(RequestStatus::Unknown);
        }
        match requests.claim_of(&request_id) {
            Some(claim) if claim.operation.tenant_id() == &identity.tenant_id => Ok(RequestStatus::InFlight {
                stage: claim.stage,
                expires_at: claim.expires_at,
                takeovers: claim.takeovers,
            }),
            _ => Ok(RequestStatus::Unknown),
        }
    }

    /// Audit entries in `[first, last]` with their Merkle root.
    pub async fn export_audit(&self, credential: Option<&str>, first: u64, last: Option<u64>) -> Result<AuditExport> {
        let identity = self.auth.authenticate(credential).await?;
        self.auth.authorize(&identity, Scope::Service)?;
        let export = self.orchestrator.audit().export(first, last);
        info!(
            tenant_id = %identity.tenant_id,
            first = export.first_sequence,
            last = export.last_sequence,
            entries = export.entries.len(),
            "audit exported"
        );
        Ok(export)
    }

    /// Run a recovery sweep on behalf of a service credential.
    pub async fn recover(&self, credential: Option<&str>) -> Result<RecoveryReport> {
        let identity = self.auth.authenticate(credential).await?;
        self.auth.authorize(&identity, Scope::Service)?;
        self.orchestrator.recover().await
    }

    /// Recovery sweep without a credential, for startup and operator tooling.
    pub async fn recover_now(&self) -> Result<RecoveryReport> {
        self.orchestrator.recover().await
    }

    pub fn key(&self, key_id: &KeyId) -> Option<KeyRecord> {
        self.orchestrator.registry().get(key_id)
    }

    pub fn certificate_history(&self, key_id: &KeyId) -> Vec<CertificateRecord> {
        self.orchestrator.certificates().history(key_id)
    }

    pub fn issuer_certificate(&self) -> Option<CertificateRecord> {
        self.orchestrator.certificates().issuer_certificate()
    }

    pub fn audit_log(&self) -> &AuditLog {
        self.orchestrator.audit()
    }

    pub fn orchestrator(&self) -> &SigningOrchestrator {
        &self.orchestrator
    }

    pub fn hsm(&self) -> &HsmGateway {
        self.orchestrator.hsm()
    }
}
