//! Request validation and deployment policy.
//!
//! Every request is checked here before any side effect: schema, tenant
//! ownership of the referenced key, key status, envelope signature and the
//! configured [`PolicyRule`]s.

pub mod types;
pub mod evaluator;
pub mod engine;

pub use types::{PolicyContext, PolicyEvaluation, PolicyRule};
pub use engine::{allowed_statuses, envelope_signing_message, is_valid_identifier, RequestValidator};
