//! Gateway configuration layered with Figment.
//!
//! Precedence (lowest to highest):
//! 1. Compiled defaults
//! 2. TOML config file
//! 3. Environment variables (`EKS_` prefix)
//!
//! Example: `EKS_HSM__POOL_SIZE=16` -> `hsm.pool_size`

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::auth::Scope;
use crate::error::{GatewayError, Result};
use crate::policy::PolicyRule;
use crate::types::{KeyAlgorithm, TenantId};

/// Environment variable prefix for config overrides.
const ENV_PREFIX: &str = "EKS_";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub hsm: HsmConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub certificates: CertificateConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

/// Where journals live. `data_dir = None` keeps everything in memory.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Call `sync_data` after every journal append.
    #[serde(default = "default_true")]
    pub fsync: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { data_dir: None, fsync: true }
    }
}

impl StorageConfig {
    pub fn journal_path(&self, name: &str) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join(name))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HsmConfig {
    /// Maximum concurrently open HSM sessions.
    pub pool_size: usize,
    /// How long a caller waits for a free session before `HsmUnavailable`.
    pub acquire_timeout_ms: u64,
    /// Deadline for a single HSM call.
    pub attempt_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub software: SoftwareHsmConfig,
}

impl Default for HsmConfig {
    fn default() -> Self {
        Self {
            pool_size: 8,
            acquire_timeout_ms: 2_000,
            attempt_timeout_ms: 5_000,
            retry: RetryConfig::default(),
            software: SoftwareHsmConfig::default(),
        }
    }
}

impl HsmConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    /// Upper bound on wall time spent inside one retried HSM call.
    pub fn worst_case_budget(&self) -> Duration {
        let attempts = self.retry.max_attempts.max(1);
        let per_attempt = self.acquire_timeout() + self.attempt_timeout();
        let mut total = per_attempt * attempts;
        for attempt in 0..attempts.saturating_sub(1) {
            total += self.retry.max_delay(attempt);
        }
        total
    }

    /// Upper bound on one orchestration step between claim renewals.
    /// Certificate issuance is the longest: an export and a sign.
    pub fn worst_case_step_budget(&self) -> Duration {
        self.worst_case_budget() * HSM_CALLS_PER_STEP
    }
}

/// Most HSM calls made between two renewals of a claim and its key lease.
pub const HSM_CALLS_PER_STEP: u32 = 2;

/// Exponential backoff for transient HSM failures.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_attempts: 4, initial_backoff_ms: 50, max_backoff_ms: 2_000 }
    }
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Largest delay (including jitter) that can follow `attempt`.
    pub fn max_delay(&self, attempt: u32) -> Duration {
        let base = self
            .initial_backoff()
            .saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
        let capped = base.min(self.max_backoff());
        capped + capped / 2
    }
}

/// Settings for the bundled software HSM.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SoftwareHsmConfig {
    /// BIP-39 mnemonic protecting the key store. Generated when absent.
    #[serde(default)]
    pub mnemonic: Option<String>,
    #[serde(default)]
    pub passphrase: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
    pub cache_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self { tokens: Vec::new(), cache_ttl_secs: 300 }
    }
}

impl AuthConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// A statically provisioned bearer token.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenConfig {
    pub token: String,
    pub tenant_id: TenantId,
    pub scopes: Vec<Scope>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    /// Hex public key the platform signs envelopes with.
    #[serde(default)]
    pub platform_verification_key: Option<String>,
    #[serde(default = "default_platform_algorithm")]
    pub platform_key_algorithm: KeyAlgorithm,
    /// Tolerated future skew on `requested_at`.
    pub max_clock_skew_secs: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            platform_verification_key: None,
            platform_key_algorithm: default_platform_algorithm(),
            max_clock_skew_secs: 30,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CertificateConfig {
    /// Distinguished name of the issuing authority.
    pub issuer_name: String,
    /// Label of the HSM-held issuer key.
    pub issuer_key_label: String,
    pub validity_days: u32,
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            issuer_name: "CN=External Key Store Validation CA,O=eks-gateway".to_string(),
            issuer_key_label: "validation-key".to_string(),
            validity_days: 365,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Expiry of per-key leases and idempotency claims.
    pub lease_ttl_ms: u64,
    /// Poll interval while waiting on a held lease or in-flight duplicate.
    pub poll_interval_ms: u64,
    /// Bound on how long a duplicate request waits for the committed result.
    pub duplicate_wait_ms: u64,
    /// Bound on how long a request waits for a key lease.
    pub lease_wait_ms: u64,
    /// Period of the background recovery sweep. `0` disables it.
    #[serde(default = "default_recovery_interval")]
    pub recovery_interval_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            lease_ttl_ms: 60_000,
            poll_interval_ms: 10,
            duplicate_wait_ms: 30_000,
            lease_wait_ms: 30_000,
            recovery_interval_ms: default_recovery_interval(),
        }
    }
}

impl OrchestratorConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn duplicate_wait(&self) -> Duration {
        Duration::from_millis(self.duplicate_wait_ms)
    }

    pub fn lease_wait(&self) -> Duration {
        Duration::from_millis(self.lease_wait_ms)
    }

    pub fn recovery_interval(&self) -> Option<Duration> {
        (self.recovery_interval_ms > 0).then(|| Duration::from_millis(self.recovery_interval_ms))
    }
}

fn default_recovery_interval() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_platform_algorithm() -> KeyAlgorithm {
    KeyAlgorithm::EddsaEd25519
}

impl GatewayConfig {
    /// Defaults overlaid with `EKS_*` environment variables.
    pub fn load() -> Result<Self> {
        let config: GatewayConfig = Figment::from(Serialized::defaults(GatewayConfig::default()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults, then `path`, then `EKS_*` environment variables.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        info!(path = %path.display(), "loading configuration");
        let config: GatewayConfig = Figment::from(Serialized::defaults(GatewayConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        debug!(
            data_dir = ?config.storage.data_dir,
            pool_size = config.hsm.pool_size,
            tokens = config.auth.tokens.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.hsm.pool_size == 0 {
            return Err(GatewayError::configuration("hsm.pool_size must be at least 1"));
        }
        if self.hsm.retry.max_attempts == 0 {
            return Err(GatewayError::configuration("hsm.retry.max_attempts must be at least 1"));
        }
        if self.hsm.retry.initial_backoff_ms > self.hsm.retry.max_backoff_ms {
            return Err(GatewayError::configuration(
                "hsm.retry.initial_backoff_ms exceeds hsm.retry.max_backoff_ms",
            ));
        }
        if self.hsm.attempt_timeout_ms == 0 {
            return Err(GatewayError::configuration("hsm.attempt_timeout_ms must be positive"));
        }
        let budget = self.hsm.worst_case_step_budget();
        if self.orchestrator.lease_ttl() <= budget {
            return Err(GatewayError::configuration(format!(
                "orchestrator.lease_ttl_ms ({}) must exceed the worst-case HSM step budget ({} ms)",
                self.orchestrator.lease_ttl_ms,
                budget.as_millis()
            )));
        }
        if self.orchestrator.poll_interval_ms == 0 {
            return Err(GatewayError::configuration("orchestrator.poll_interval_ms must be positive"));
        }
        if self.certificates.validity_days == 0 {
            return Err(GatewayError::configuration("certificates.validity_days must be positive"));
        }
        for (i, token) in self.auth.tokens.iter().enumerate() {
            if token.token.is_empty() {
                return Err(GatewayError::configuration(format!("auth.tokens[{}] is empty", i)));
            }
            if token.tenant_id.as_str() == crate::ca::CA_TENANT {
                return Err(GatewayError::configuration(format!(
                    "auth.tokens[{}] uses the reserved tenant {}",
                    i,
                    crate::ca::CA_TENANT
                )));
            }
            if token.scopes.is_empty() {
                return Err(GatewayError::configuration(format!(
                    "auth.tokens[{}] grants no scopes",
                    i
                )));
            }
        }
        if let Some(key) = &self.policy.platform_verification_key {
            hex::decode(key).map_err(|e| {
                GatewayError::configuration(format!("policy.platform_verification_key: {}", e))
            })?;
        }
        Ok(())
    }
}
