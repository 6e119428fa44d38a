//! Request execution: the gateway facade, the signing orchestrator, the
//! lifecycle handlers and crash recovery.

pub mod api;
pub mod lifecycle;
pub mod orchestrator;
pub mod recovery;
pub mod state;

pub use api::{software_hsm, Gateway, RequestAction, RequestEnvelope, RequestStatus, ResponseEnvelope, SignAction};
pub use lifecycle::{derived_key_id, proof_of_ownership_message};
pub use orchestrator::SigningOrchestrator;
pub use recovery::RecoveryReport;
