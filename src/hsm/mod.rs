//! Hardware Security Module (HSM) integration.
//!
//! Backends implement [`HsmConnector`], which hands out [`HsmSession`]s.
//! The rest of the gateway only talks to the device through
//! [`HsmGateway`], which bounds the number of open sessions, applies
//! per-attempt timeouts and retries transient failures.

pub mod gateway;
pub mod retry;
pub mod software_hsm;

pub use gateway::{HsmCall, HsmGateway};
pub use software_hsm::SoftwareHsm;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::GatewayError;
use crate::types::{HsmHandle, KeyAlgorithm};

/// Errors raised at the device boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HsmError {
    #[error("HSM unreachable: {0}")]
    Unavailable(String),
    #[error("Session failure: {0}")]
    Session(String),
    #[error("Key not found: {0}")]
    KeyNotFound(String),
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("Operation rejected: {0}")]
    Rejected(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HsmError {
    /// Connectivity and session failures may succeed on a fresh session.
    pub fn is_transient(&self) -> bool {
        matches!(self, HsmError::Unavailable(_) | HsmError::Session(_))
    }
}

impl From<HsmError> for GatewayError {
    fn from(e: HsmError) -> Self {
        if e.is_transient() {
            GatewayError::hsm_unavailable(e.to_string())
        } else {
            GatewayError::hsm_rejected(e.to_string())
        }
    }
}

/// Parameters for key generation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyGenParams {
    pub algorithm: KeyAlgorithm,
    pub label: String,
}

/// A freshly generated key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneratedKey {
    pub handle: HsmHandle,
    /// SubjectPublicKeyInfo DER of the public key.
    pub public_key_der: Vec<u8>,
}

/// An open session with the device. Dropping it closes the session.
#[async_trait]
pub trait HsmSession: Send {
    async fn generate_key(&mut self, params: &KeyGenParams) -> Result<GeneratedKey, HsmError>;

    /// Sign a prehashed digest. ECDSA signatures are DER encoded.
    async fn sign(
        &mut self,
        handle: &HsmHandle,
        algorithm: KeyAlgorithm,
        digest: &[u8],
    ) -> Result<Vec<u8>, HsmError>;

    /// SubjectPublicKeyInfo DER of the key behind `handle`.
    async fn export_public_key(&mut self, handle: &HsmHandle) -> Result<Vec<u8>, HsmError>;

    async fn destroy_key(&mut self, handle: &HsmHandle) -> Result<(), HsmError>;
}

/// Opens sessions against an HSM backend.
#[async_trait]
pub trait HsmConnector: Send + Sync {
    async fn open_session(&self) -> Result<Box<dyn HsmSession>, HsmError>;
}
