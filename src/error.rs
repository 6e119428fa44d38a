//! Error types for gateway operations.
//!
//! Provides the gateway's error taxonomy using `thiserror`. Every variant maps
//! onto a serialisable [`ErrorKind`] that is returned to callers in the
//! response envelope and recorded in the audit trail.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while serving a gateway request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Missing or invalid bearer credential.
    #[error("Unauthorized: {reason}")]
    Unauthorized { reason: String },
    /// Valid credential without the scope required by the operation.
    #[error("Forbidden: {reason}")]
    Forbidden { reason: String },
    /// Request does not conform to the envelope schema.
    #[error("Malformed request: {reason}")]
    MalformedRequest { reason: String },
    /// Tenant does not own the key, or the key status forbids the action.
    #[error("Policy violation: {reason}")]
    PolicyViolation { reason: String },
    /// Connectivity or session failure at the HSM boundary (retryable).
    #[error("HSM unavailable: {reason}")]
    HsmUnavailable { reason: String },
    /// Device-level denial (terminal).
    #[error("HSM rejected operation: {reason}")]
    HsmRejected { reason: String },
    /// Certificate could not be issued.
    #[error("Certificate issuance failed: {reason}")]
    IssuanceError { reason: String },
    /// Operation raced with a conflicting state change.
    #[error("Conflicting state: {reason}")]
    ConflictingState { reason: String },
    /// Durable storage failed.
    #[error("Storage error: {reason}")]
    Storage { reason: String },
    /// Configuration is invalid.
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },
}

/// Wire-level discriminant of a [`GatewayError`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Unauthorized,
    Forbidden,
    MalformedRequest,
    PolicyViolation,
    HsmUnavailable,
    HsmRejected,
    IssuanceError,
    ConflictingState,
    Storage,
    Configuration,
}

impl GatewayError {
    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self::Unauthorized { reason: reason.into() }
    }

    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::Forbidden { reason: reason.into() }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedRequest { reason: reason.into() }
    }

    pub fn policy(reason: impl Into<String>) -> Self {
        Self::PolicyViolation { reason: reason.into() }
    }

    pub fn hsm_unavailable(reason: impl Into<String>) -> Self {
        Self::HsmUnavailable { reason: reason.into() }
    }

    pub fn hsm_rejected(reason: impl Into<String>) -> Self {
        Self::HsmRejected { reason: reason.into() }
    }

    pub fn issuance(reason: impl Into<String>) -> Self {
        Self::IssuanceError { reason: reason.into() }
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::ConflictingState { reason: reason.into() }
    }

    pub fn storage(reason: impl Into<String>) -> Self {
        Self::Storage { reason: reason.into() }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration { reason: reason.into() }
    }

    /// The wire discriminant of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unauthorized { .. } => ErrorKind::Unauthorized,
            Self::Forbidden { .. } => ErrorKind::Forbidden,
            Self::MalformedRequest { .. } => ErrorKind::MalformedRequest,
            Self::PolicyViolation { .. } => ErrorKind::PolicyViolation,
            Self::HsmUnavailable { .. } => ErrorKind::HsmUnavailable,
            Self::HsmRejected { .. } => ErrorKind::HsmRejected,
            Self::IssuanceError { .. } => ErrorKind::IssuanceError,
            Self::ConflictingState { .. } => ErrorKind::ConflictingState,
            Self::Storage { .. } => ErrorKind::Storage,
            Self::Configuration { .. } => ErrorKind::Configuration,
        }
    }

    /// Only HSM connectivity failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::HsmUnavailable { .. })
    }

    /// Errors raised before any side effect took place.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Unauthorized { .. }
                | Self::Forbidden { .. }
                | Self::MalformedRequest { .. }
                | Self::PolicyViolation { .. }
        )
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(e: std::io::Error) -> Self {
        Self::storage(format!("I/O failure: {}", e))
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        Self::storage(format!("serialization failure: {}", e))
    }
}

impl From<figment::Error> for GatewayError {
    fn from(e: figment::Error) -> Self {
        Self::configuration(e.to_string())
    }
}

/// Result type alias for gateway operations.
pub type Result<T> = core::result::Result<T, GatewayError>;
