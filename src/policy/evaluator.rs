//! Deterministic evaluators for policy rules.

use crate::policy::types::{PolicyContext, PolicyEvaluation, PolicyRule};

/// Evaluates a single rule. Returns the violation message when it does not hold.
pub fn evaluate_rule(rule: &PolicyRule, ctx: &PolicyContext<'_>) -> Option<String> {
    match rule {
        PolicyRule::AllowedAlgorithms { algorithms } => evaluate_algorithms(algorithms, ctx),
        PolicyRule::MaxKeysPerTenant { limit } => evaluate_key_quota(*limit, ctx),
        PolicyRule::MaxRequestAge { max_age_secs } => evaluate_request_age(*max_age_secs, ctx),
    }
}

/// Evaluates `rules` in order, stopping at the first violation.
pub fn evaluate_rules(rules: &[PolicyRule], ctx: &PolicyContext<'_>) -> PolicyEvaluation {
    let mut satisfied = Vec::with_capacity(rules.len());
    for (idx, rule) in rules.iter().enumerate() {
        match evaluate_rule(rule, ctx) {
            None => satisfied.push(idx),
            Some(reason) => return PolicyEvaluation::violated(satisfied, idx, reason),
        }
    }
    PolicyEvaluation::compliant(satisfied)
}

fn evaluate_algorithms(
    allowed: &[crate::types::KeyAlgorithm],
    ctx: &PolicyContext<'_>,
) -> Option<String> {
    let algorithm = ctx.algorithm?;
    if allowed.contains(&algorithm) {
        None
    } else {
        Some(format!("algorithm {} is not permitted", algorithm))
    }
}

fn evaluate_key_quota(limit: usize, ctx: &PolicyContext<'_>) -> Option<String> {
    if !ctx.creates_key || ctx.live_keys < limit {
        return None;
    }
    Some(format!(
        "tenant {} already holds {} keys (limit {})",
        ctx.tenant_id, ctx.live_keys, limit
    ))
}

fn evaluate_request_age(max_age_secs: u64, ctx: &PolicyContext<'_>) -> Option<String> {
    let age = ctx.now.signed_duration_since(ctx.requested_at);
    let max_age = chrono::Duration::seconds(i64::try_from(max_age_secs).unwrap_or(i64::MAX));
    if age <= max_age {
        None
    } else {
        Some(format!(
            "request is {} s old, maximum is {} s",
            age.num_seconds(),
            max_age_secs
        ))
    }
}
