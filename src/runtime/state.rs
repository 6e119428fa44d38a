//! Transition tables for the signing and lifecycle state machines.
//!
//! The current stage of an in-flight request is persisted on its claim, so a
//! request taken over after a crash resumes from where it stopped.

use std::time::Duration;

use tracing::debug;

use crate::error::{GatewayError, Result};
use crate::storage::IdempotencyStore;
use crate::types::{LifecycleState, RequestId, SigningState, Stage};

const SIGNING_TRANSITIONS: &[(SigningState, SigningState)] = &[
    (SigningState::Received, SigningState::Validated),
    (SigningState::Validated, SigningState::HsmInvoked),
    (SigningState::Validated, SigningState::Failed),
    (SigningState::HsmInvoked, SigningState::Completed),
    (SigningState::HsmInvoked, SigningState::Failed),
    (SigningState::Completed, SigningState::Audited),
    (SigningState::Failed, SigningState::Audited),
];

const LIFECYCLE_TRANSITIONS: &[(LifecycleState, LifecycleState)] = &[
    (LifecycleState::Requested, LifecycleState::PolicyChecked),
    (LifecycleState::PolicyChecked, LifecycleState::HsmExecuted),
    (LifecycleState::PolicyChecked, LifecycleState::Recorded),
    (LifecycleState::HsmExecuted, LifecycleState::Recorded),
    (LifecycleState::Recorded, LifecycleState::Audited),
];

fn signing_rank(state: SigningState) -> u8 {
    match state {
        SigningState::Received => 0,
        SigningState::Validated => 1,
        SigningState::HsmInvoked => 2,
        SigningState::Completed | SigningState::Failed => 3,
        SigningState::Audited => 4,
    }
}

fn lifecycle_rank(state: LifecycleState) -> u8 {
    match state {
        LifecycleState::Requested => 0,
        LifecycleState::PolicyChecked => 1,
        LifecycleState::HsmExecuted => 2,
        LifecycleState::Recorded => 3,
        LifecycleState::Audited => 4,
    }
}

pub fn validate_transition(from: Stage, to: Stage) -> Result<()> {
    if from == to {
        return Ok(());
    }
    let valid = match (from, to) {
        (Stage::Signing(a), Stage::Signing(b)) => SIGNING_TRANSITIONS.contains(&(a, b)),
        (Stage::Lifecycle(a), Stage::Lifecycle(b)) => LIFECYCLE_TRANSITIONS.contains(&(a, b)),
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(GatewayError::conflict(format!("invalid state transition {:?} -> {:?}", from, to)))
    }
}

/// Whether `to` lies strictly after `from` in the same machine.
pub fn is_forward(from: Stage, to: Stage) -> bool {
    match (from, to) {
        (Stage::Signing(a), Stage::Signing(b)) => signing_rank(b) > signing_rank(a),
        (Stage::Lifecycle(a), Stage::Lifecycle(b)) => lifecycle_rank(b) > lifecycle_rank(a),
        _ => false,
    }
}

pub fn is_terminal(stage: Stage) -> bool {
    matches!(
        stage,
        Stage::Signing(SigningState::Completed | SigningState::Failed | SigningState::Audited)
            | Stage::Lifecycle(LifecycleState::Recorded | LifecycleState::Audited)
    )
}

/// Tracks and persists the stage of one owned request.
pub(crate) struct Progress<'a> {
    store: &'a IdempotencyStore,
    request_id: RequestId,
    owner: String,
    stage: Stage,
}

impl<'a> Progress<'a> {
    pub(crate) fn new(store: &'a IdempotencyStore, request_id: RequestId, owner: String, stage: Stage) -> Self {
        Self { store, request_id, owner, stage }
    }

    pub(crate) fn stage(&self) -> Stage {
        self.stage
    }

    /// Move to `next`. Stages already passed (when resuming) are skipped.
    pub(crate) fn advance(&mut self, next: Stage) -> Result<()> {
        if !is_forward(self.stage, next) {
            return Ok(());
        }
        validate_transition(self.stage, next)?;
        self.store.advance(&self.request_id, &self.owner, next)?;
        debug!(request_id = %self.request_id, from = ?self.stage, to = ?next, "state transition");
        self.stage = next;
        Ok(())
    }

    /// Push out the claim's expiry by `ttl` from now.
    pub(crate) fn extend(&self, ttl: Duration) -> Result<()> {
        self.store.extend(&self.request_id, &self.owner, ttl)
    }

    /// Terminal stages are not persisted on the claim: committing the result removes it.
    pub(crate) fn finish(&mut self, terminal: Stage) -> Result<()> {
        if !is_forward(self.stage, terminal) {
            return Ok(());
        }
        validate_transition(self.stage, terminal)?;
        debug!(request_id = %self.request_id, from = ?self.stage, to = ?terminal, "state transition");
        self.stage = terminal;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        let s = Stage::Signing;
        assert!(validate_transition(s(SigningState::Received), s(SigningState::Validated)).is_ok());
        assert!(validate_transition(s(SigningState::HsmInvoked), s(SigningState::Failed)).is_ok());
        let l = Stage::Lifecycle;
        assert!(validate_transition(l(LifecycleState::PolicyChecked), l(LifecycleState::Recorded)).is_ok());
    }

    #[test]
    fn test_invalid_transitions() {
        let s = Stage::Signing;
        assert!(validate_transition(s(SigningState::Received), s(SigningState::HsmInvoked)).is_err());
        assert!(validate_transition(s(SigningState::Completed), s(SigningState::Validated)).is_err());
        assert!(validate_transition(s(SigningState::Received), Stage::Lifecycle(LifecycleState::Recorded)).is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(is_terminal(Stage::Signing(SigningState::Failed)));
        assert!(is_terminal(Stage::Lifecycle(LifecycleState::Recorded)));
        assert!(!is_terminal(Stage::Signing(SigningState::HsmInvoked)));
    }

    #[test]
    fn test_resumed_progress_skips_passed_stages() {
        assert!(!is_forward(Stage::Signing(SigningState::HsmInvoked), Stage::Signing(SigningState::Validated)));
        assert!(is_forward(Stage::Signing(SigningState::HsmInvoked), Stage::Signing(SigningState::Completed)));
    }
}
