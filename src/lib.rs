//! # EKS Gateway
//!
//! External Key Store gateway: a custody service that signs digests and
//! manages key lifecycles on behalf of tenants, with key material held in an
//! HSM behind a connector boundary.
//!
//! ## Features
//!
//! - **Exactly-once execution**: request ids are claimed in a durable
//!   idempotency store, so a redelivered request returns the stored result
//! - **Per-key leases**: at most one HSM operation per key at a time
//! - **Policy**: ownership, key status and configurable deployment rules
//! - **Certificates**: an internal CA issues and renews X.509 certificates
//! - **Audit**: a hash-chained, append-only log with Merkle export
//! - **Recovery**: orphaned requests are re-driven after a crash
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chrono::Utc;
//! use eks_gateway::{Gateway, GatewayConfig, RequestAction, RequestEnvelope, SoftwareHsm};
//! use eks_gateway::types::{KeyAlgorithm, LifecycleAction};
//!
//! # async fn run() -> eks_gateway::Result<()> {
//! let config = GatewayConfig::load()?;
//! let gateway = Gateway::open(config, Arc::new(SoftwareHsm::ephemeral())).await?;
//!
//! let response = gateway
//!     .handle(RequestEnvelope {
//!         request_id: "req-1".into(),
//!         credential: Some("Bearer management-token".into()),
//!         action: RequestAction::Lifecycle(LifecycleAction::GenerateKey {
//!             algorithm: KeyAlgorithm::EcdsaP256,
//!             label: Some("payments".into()),
//!         }),
//!         requested_at: Utc::now(),
//!         envelope_signature: None,
//!     })
//!     .await;
//! println!("{:?}", response.outcome);
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod auth;
pub mod ca;
pub mod config;
pub mod error;
pub mod hsm;
pub mod logging;
pub mod policy;
pub mod registry;
pub mod runtime;
pub mod storage;
pub mod types;
pub mod utils;

pub use audit::{AuditEntry, AuditExport, AuditLog};
pub use auth::{AuthGate, CredentialIntrospector, Identity, Scope};
pub use ca::CertificateAuthority;
pub use config::GatewayConfig;
pub use error::{ErrorKind, GatewayError, Result};
pub use hsm::{HsmConnector, HsmGateway, SoftwareHsm};
pub use policy::RequestValidator;
pub use registry::KeyRegistry;
pub use runtime::{
    software_hsm, Gateway, RecoveryReport, RequestAction, RequestEnvelope, RequestStatus, ResponseEnvelope,
    SigningOrchestrator,
};
pub use utils::MerkleTree;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod integration_tests {
    use super::*;
    use crate::config::TokenConfig;
    use crate::types::{KeyAlgorithm, KeyStatus, LifecycleAction, Outcome};
    use chrono::Utc;
    use sha2::{Digest, Sha256};
    use std::sync::Arc;

    fn config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.auth.tokens = vec![TokenConfig {
            token: "t1-token".into(),
            tenant_id: "t1".into(),
            scopes: vec![Scope::KeyOperation, Scope::KeyManagement],
            expires_at: None,
        }];
        config
    }

    fn envelope(request_id: &str, action: RequestAction) -> RequestEnvelope {
        RequestEnvelope {
            request_id: request_id.into(),
            credential: Some("Bearer t1-token".into()),
            action,
            requested_at: Utc::now(),
            envelope_signature: None,
        }
    }

    #[tokio::test]
    async fn test_full_flow() {
        let gateway = Gateway::open(config(), Arc::new(SoftwareHsm::ephemeral())).await.unwrap();

        // Generate
        let generated = gateway
            .handle(envelope(
                "g1",
                RequestAction::Lifecycle(LifecycleAction::GenerateKey {
                    algorithm: KeyAlgorithm::EcdsaP256,
                    label: None,
                }),
            ))
            .await;
        assert_eq!(generated.outcome, Outcome::Success);
        assert!(generated.certificate.is_some());
        let key = generated.key.unwrap();
        assert_eq!(key.status, KeyStatus::Active);

        // Sign
        let digest = hex::encode(Sha256::digest(b"integration test message"));
        let signed = gateway
            .handle(envelope("s1", RequestAction::sign(key.key_id.clone(), digest.clone())))
            .await;
        assert_eq!(signed.outcome, Outcome::Success);
        assert!(signed.signature.is_some());

        // Redelivery returns the stored signature
        let again = gateway.handle(envelope("s1", RequestAction::sign(key.key_id.clone(), digest))).await;
        assert_eq!(again.signature, signed.signature);

        assert!(gateway.audit_log().verify_chain().is_ok());
    }

    #[tokio::test]
    async fn test_missing_credential_is_refused_and_audited() {
        let gateway = Gateway::open(config(), Arc::new(SoftwareHsm::ephemeral())).await.unwrap();
        let before = gateway.audit_log().len();
        let mut request = envelope("s1", RequestAction::sign("k1", "00"));
        request.credential = None;

        let response = gateway.handle(request).await;
        assert_eq!(response.outcome, Outcome::Rejected);
        assert_eq!(response.error_kind, Some(ErrorKind::Unauthorized));
        assert_eq!(gateway.audit_log().len(), before + 1);
    }
}
