//! Policy types for request validation.
//!
//! Rules are configured per deployment and evaluated in order; the first
//! rule that does not hold rejects the request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{KeyAlgorithm, TenantId};

/// A deployment-wide policy rule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyRule {
    /// Only these algorithms may be generated or used.
    AllowedAlgorithms { algorithms: Vec<KeyAlgorithm> },

    /// Upper bound on non-revoked keys per tenant, enforced at generation.
    MaxKeysPerTenant { limit: usize },

    /// Reject requests whose `requested_at` is older than this.
    MaxRequestAge { max_age_secs: u64 },
}

impl PolicyRule {
    pub fn name(&self) -> &'static str {
        match self {
            PolicyRule::AllowedAlgorithms { .. } => "ALLOWED_ALGORITHMS",
            PolicyRule::MaxKeysPerTenant { .. } => "MAX_KEYS_PER_TENANT",
            PolicyRule::MaxRequestAge { .. } => "MAX_REQUEST_AGE",
        }
    }
}

/// What a rule gets to look at.
#[derive(Clone, Debug)]
pub struct PolicyContext<'a> {
    pub tenant_id: &'a TenantId,
    /// Algorithm being generated, or of the key being used.
    pub algorithm: Option<KeyAlgorithm>,
    /// Whether the request creates a new key.
    pub creates_key: bool,
    /// Non-revoked keys the tenant currently holds.
    pub live_keys: usize,
    pub requested_at: DateTime<Utc>,
    pub now: DateTime<Utc>,
}

/// Outcome of evaluating the configured rules against one request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyEvaluation {
    pub compliant: bool,
    /// Indices of rules that held, in evaluation order.
    pub satisfied_rules: Vec<usize>,
    /// Index of the first failing rule.
    pub failed_rule: Option<usize>,
    pub reason: Option<String>,
}

impl PolicyEvaluation {
    pub fn compliant(satisfied_rules: Vec<usize>) -> Self {
        Self { compliant: true, satisfied_rules, failed_rule: None, reason: None }
    }

    pub fn violated(satisfied_rules: Vec<usize>, failed_rule: usize, reason: String) -> Self {
        Self { compliant: false, satisfied_rules, failed_rule: Some(failed_rule), reason: Some(reason) }
    }
}
