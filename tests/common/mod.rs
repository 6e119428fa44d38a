//! Shared fixtures: an instrumented HSM connector and gateway builders.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use eks_gateway::config::TokenConfig;
use eks_gateway::hsm::{GeneratedKey, HsmError, HsmSession, KeyGenParams};
use eks_gateway::types::{HsmHandle, KeyAlgorithm, KeyRecord, LifecycleAction};
use eks_gateway::{
    Gateway, GatewayConfig, HsmConnector, RequestAction, RequestEnvelope, ResponseEnvelope, Scope, SoftwareHsm,
};

pub const TENANT_1: &str = "Bearer tenant-1-token";
pub const TENANT_2: &str = "Bearer tenant-2-token";
pub const SIGN_ONLY: &str = "Bearer tenant-1-sign-only";
pub const SERVICE: &str = "Bearer service-token";
pub const MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

#[derive(Default)]
struct Faults {
    sign: VecDeque<HsmError>,
    generate: VecDeque<HsmError>,
    destroy: VecDeque<HsmError>,
}

#[derive(Default)]
pub struct Instruments {
    pub generate_calls: AtomicU32,
    pub sign_calls: AtomicU32,
    pub destroy_calls: AtomicU32,
    sign_delay_ms: AtomicU32,
    call_delay_ms: AtomicU32,
    faults: Mutex<Faults>,
    intervals: Mutex<HashMap<HsmHandle, Vec<(Instant, Instant)>>>,
}

impl Instruments {
    pub fn sign_calls(&self) -> u32 {
        self.sign_calls.load(Ordering::SeqCst)
    }

    pub fn generate_calls(&self) -> u32 {
        self.generate_calls.load(Ordering::SeqCst)
    }

    pub fn destroy_calls(&self) -> u32 {
        self.destroy_calls.load(Ordering::SeqCst)
    }

    pub fn set_sign_delay(&self, delay: Duration) {
        self.sign_delay_ms.store(delay.as_millis() as u32, Ordering::SeqCst);
    }

    /// Delay every HSM call, not just signing.
    pub fn set_call_delay(&self, delay: Duration) {
        self.call_delay_ms.store(delay.as_millis() as u32, Ordering::SeqCst);
    }

    async fn call_delay(&self) {
        let delay = self.call_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(u64::from(delay))).await;
        }
    }

    pub fn fail_next_sign(&self, error: HsmError) {
        self.faults.lock().sign.push_back(error);
    }

    pub fn fail_next_generate(&self, error: HsmError) {
        self.faults.lock().generate.push_back(error);
    }

    pub fn fail_next_destroy(&self, error: HsmError) {
        self.faults.lock().destroy.push_back(error);
    }

    /// Whether any two sign calls on the same handle overlapped in time.
    pub fn overlapping_signs(&self) -> bool {
        self.intervals.lock().values().any(|spans| {
            let mut spans = spans.clone();
            spans.sort_by_key(|(start, _)| *start);
            spans.windows(2).any(|w| w[1].0 < w[0].1)
        })
    }
}

/// Wraps the software HSM, counting calls and injecting faults.
#[derive(Clone)]
pub struct InstrumentedHsm {
    inner: SoftwareHsm,
    pub instruments: Arc<Instruments>,
}

impl InstrumentedHsm {
    pub fn new(inner: SoftwareHsm) -> Self {
        Self { inner, instruments: Arc::new(Instruments::default()) }
    }

    pub fn ephemeral() -> Self {
        Self::new(SoftwareHsm::ephemeral())
    }
}

#[async_trait]
impl HsmConnector for InstrumentedHsm {
    async fn open_session(&self) -> Result<Box<dyn HsmSession>, HsmError> {
        let inner = self.inner.open_session().await?;
        Ok(Box::new(InstrumentedSession { inner, instruments: Arc::clone(&self.instruments) }))
    }
}

struct InstrumentedSession {
    inner: Box<dyn HsmSession>,
    instruments: Arc<Instruments>,
}

#[async_trait]
impl HsmSession for InstrumentedSession {
    async fn generate_key(&mut self, params: &KeyGenParams) -> Result<GeneratedKey, HsmError> {
        self.instruments.generate_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(fault) = self.instruments.faults.lock().generate.pop_front() {
            return Err(fault);
        }
        self.instruments.call_delay().await;
        self.inner.generate_key(params).await
    }

    async fn sign(&mut self, handle: &HsmHandle, algorithm: KeyAlgorithm, digest: &[u8]) -> Result<Vec<u8>, HsmError> {
        self.instruments.sign_calls.fetch_add(1, Ordering::SeqCst);
        let fault = self.instruments.faults.lock().sign.pop_front();
        if let Some(fault) = fault {
            return Err(fault);
        }
        let start = Instant::now();
        let delay = self.instruments.sign_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(u64::from(delay))).await;
        }
        self.instruments.call_delay().await;
        let result = self.inner.sign(handle, algorithm, digest).await;
        self.instruments
            .intervals
            .lock()
            .entry(handle.clone())
            .or_default()
            .push((start, Instant::now()));
        result
    }

    async fn export_public_key(&mut self, handle: &HsmHandle) -> Result<Vec<u8>, HsmError> {
        self.instruments.call_delay().await;
        self.inner.export_public_key(handle).await
    }

    async fn destroy_key(&mut self, handle: &HsmHandle) -> Result<(), HsmError> {
        self.instruments.destroy_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(fault) = self.instruments.faults.lock().destroy.pop_front() {
            return Err(fault);
        }
        self.instruments.call_delay().await;
        self.inner.destroy_key(handle).await
    }
}

fn token(token: &str, tenant: &str, scopes: Vec<Scope>) -> TokenConfig {
    TokenConfig {
        token: token.trim_start_matches("Bearer ").to_string(),
        tenant_id: tenant.into(),
        scopes,
        expires_at: None,
    }
}

/// Fast retries and short timeouts so fault tests finish quickly.
pub fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.auth.tokens = vec![
        token(TENANT_1, "t1", vec![Scope::KeyOperation, Scope::KeyManagement]),
        token(TENANT_2, "t2", vec![Scope::KeyOperation, Scope::KeyManagement]),
        token(SIGN_ONLY, "t1", vec![Scope::KeyOperation]),
        token(SERVICE, "ops", vec![Scope::Service]),
    ];
    config.hsm.acquire_timeout_ms = 200;
    config.hsm.attempt_timeout_ms = 500;
    config.hsm.retry.max_attempts = 3;
    config.hsm.retry.initial_backoff_ms = 5;
    config.hsm.retry.max_backoff_ms = 20;
    config.orchestrator.lease_ttl_ms = 5_000;
    config.orchestrator.poll_interval_ms = 5;
    config.orchestrator.duplicate_wait_ms = 5_000;
    config.orchestrator.lease_wait_ms = 5_000;
    config
}

/// A config persisting under `dir`, with leases short enough to expire in a test.
pub fn persistent_config(dir: &Path) -> GatewayConfig {
    let mut config = test_config();
    config.storage.data_dir = Some(dir.to_path_buf());
    config.storage.fsync = false;
    config.hsm.software.mnemonic = Some(MNEMONIC.to_string());
    config.hsm.acquire_timeout_ms = 100;
    config.hsm.attempt_timeout_ms = 200;
    config.hsm.retry.max_attempts = 2;
    config.orchestrator.lease_ttl_ms = 1_500;
    config
}

pub async fn gateway() -> (Gateway, Arc<Instruments>) {
    gateway_with(test_config()).await
}

pub async fn gateway_with(config: GatewayConfig) -> (Gateway, Arc<Instruments>) {
    let hsm = InstrumentedHsm::ephemeral();
    let instruments = Arc::clone(&hsm.instruments);
    let gateway = Gateway::open(config, Arc::new(hsm)).await.expect("gateway opens");
    (gateway, instruments)
}

pub fn envelope(credential: &str, request_id: &str, action: RequestAction) -> RequestEnvelope {
    RequestEnvelope {
        request_id: request_id.to_string(),
        credential: Some(credential.to_string()),
        action,
        requested_at: Utc::now(),
        envelope_signature: None,
    }
}

pub fn digest(message: &str) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(message.as_bytes()))
}

pub fn generate(algorithm: KeyAlgorithm) -> RequestAction {
    RequestAction::Lifecycle(LifecycleAction::GenerateKey { algorithm, label: None })
}

/// Generate an Active key for the tenant behind `credential`.
pub async fn active_key(gateway: &Gateway, credential: &str, request_id: &str, algorithm: KeyAlgorithm) -> KeyRecord {
    let response: ResponseEnvelope = gateway.handle(envelope(credential, request_id, generate(algorithm))).await;
    response.key.expect("generated key")
}
