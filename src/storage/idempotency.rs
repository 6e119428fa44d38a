//! Durable insert-if-absent map from request id to outcome.
//!
//! A request is first *claimed*: the claim records who is working on it,
//! how far it got, and when the claim lapses. Exactly one claimant may
//! commit a result; later deliveries of the same request id observe either
//! the live claim or the committed result. A claim whose holder crashed
//! expires and can be taken over by the recovery sweep.
//!
//! Opening the store compacts its journal to one snapshot event per claim
//! and per committed result.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};
use crate::storage::Journal;
use crate::types::{
    LifecycleAction, LifecycleRequest, OperationResult, RequestId, SigningRequest, Stage, TenantId,
};
use crate::utils::sha256;

/// The validated request a claim was made for, kept so recovery can re-drive it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PendingOperation {
    Signing(SigningRequest),
    Lifecycle(LifecycleRequest),
}

impl PendingOperation {
    pub fn request_id(&self) -> &RequestId {
        match self {
            PendingOperation::Signing(r) => &r.request_id,
            PendingOperation::Lifecycle(r) => &r.request_id,
        }
    }

    pub fn tenant_id(&self) -> &TenantId {
        match self {
            PendingOperation::Signing(r) => &r.tenant_id,
            PendingOperation::Lifecycle(r) => &r.tenant_id,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub request_id: RequestId,
    /// Digest of tenant and action; a replay must match it exactly.
    pub fingerprint: String,
    pub owner: String,
    pub stage: Stage,
    pub claimed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub operation: PendingOperation,
    /// Number of times the claim has been taken over after expiring.
    #[serde(default)]
    pub takeovers: u32,
}

impl Claim {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedOperation {
    pub tenant_id: TenantId,
    pub fingerprint: String,
    pub result: OperationResult,
    pub audited: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum IdempotencyEvent {
    Claimed(Claim),
    Advanced { request_id: RequestId, stage: Stage },
    Extended { request_id: RequestId, expires_at: DateTime<Utc> },
    Completed { request_id: RequestId, tenant_id: TenantId, fingerprint: String, result: OperationResult },
    Audited { request_id: RequestId },
}

/// Result of attempting to claim a request id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller now owns the request (possibly taken over from a dead owner).
    Claimed(Claim),
    /// Another live owner is working on it.
    InFlight(Claim),
    /// A result was already committed.
    Completed(OperationResult),
}

#[derive(Default)]
struct IdempotencyInner {
    claims: HashMap<RequestId, Claim>,
    completed: HashMap<RequestId, CompletedOperation>,
}

impl IdempotencyInner {
    fn apply(&mut self, event: IdempotencyEvent) {
        match event {
            IdempotencyEvent::Claimed(claim) => {
                self.claims.insert(claim.request_id.clone(), claim);
            }
            IdempotencyEvent::Advanced { request_id, stage } => {
                if let Some(claim) = self.claims.get_mut(&request_id) {
                    claim.stage = stage;
                }
            }
            IdempotencyEvent::Extended { request_id, expires_at } => {
                if let Some(claim) = self.claims.get_mut(&request_id) {
                    claim.expires_at = expires_at;
                }
            }
            IdempotencyEvent::Completed { request_id, tenant_id, fingerprint, result } => {
                self.claims.remove(&request_id);
                self.completed
                    .entry(request_id)
                    .or_insert(CompletedOperation { tenant_id, fingerprint, result, audited: false });
            }
            IdempotencyEvent::Audited { request_id } => {
                if let Some(done) = self.completed.get_mut(&request_id) {
                    done.audited = true;
                }
            }
        }
    }

    /// Events that rebuild the current state and nothing more.
    fn snapshot(&self) -> Vec<IdempotencyEvent> {
        let mut claims: Vec<&Claim> = self.claims.values().collect();
        claims.sort_by_key(|c| c.claimed_at);
        let mut completed: Vec<(&RequestId, &CompletedOperation)> = self.completed.iter().collect();
        completed.sort_by(|a, b| a.0.cmp(b.0));

        let mut events: Vec<IdempotencyEvent> = Vec::with_capacity(claims.len() + completed.len() * 2);
        for (request_id, done) in completed {
            events.push(IdempotencyEvent::Completed {
                request_id: request_id.clone(),
                tenant_id: done.tenant_id.clone(),
                fingerprint: done.fingerprint.clone(),
                result: done.result.clone(),
            });
            if done.audited {
                events.push(IdempotencyEvent::Audited { request_id: request_id.clone() });
            }
        }
        events.extend(claims.into_iter().cloned().map(IdempotencyEvent::Claimed));
        events
    }
}

pub struct IdempotencyStore {
    state: Mutex<(IdempotencyInner, Journal<IdempotencyEvent>)>,
}

/// Hex SHA-256 over the tenant and the canonical JSON of the action.
fn request_fingerprint<A: Serialize>(tenant_id: &TenantId, action: &A) -> Result<String> {
    let mut material = tenant_id.as_str().as_bytes().to_vec();
    material.push(b'|');
    material.extend(serde_json::to_vec(action)?);
    Ok(hex::encode(sha256(&material)))
}

impl PendingOperation {
    pub fn fingerprint(&self) -> Result<String> {
        #[derive(Serialize)]
        #[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
        enum SignAction<'a> {
            Sign { key_id: &'a str, payload_digest: String },
        }
        match self {
            PendingOperation::Signing(r) => request_fingerprint(
                &r.tenant_id,
                &SignAction::Sign {
                    key_id: r.key_id.as_str(),
                    payload_digest: hex::encode(&r.payload_digest),
                },
            ),
            PendingOperation::Lifecycle(r) => {
                request_fingerprint::<LifecycleAction>(&r.tenant_id, &r.action)
            }
        }
    }
}

impl IdempotencyStore {
    pub fn in_memory() -> Self {
        Self { state: Mutex::new((IdempotencyInner::default(), Journal::in_memory())) }
    }

    pub fn open(path: Option<&Path>, fsync: bool) -> Result<Self> {
        let (mut journal, events) = Journal::<IdempotencyEvent>::open(path, fsync)?;
        let mut inner = IdempotencyInner::default();
        let replayed = events.len();
        for event in events {
            inner.apply(event);
        }
        let snapshot = inner.snapshot();
        if snapshot.len() < replayed {
            journal.rewrite(&snapshot)?;
            debug!(from = replayed, to = snapshot.len(), "idempotency journal compacted");
        }
        debug!(
            events = replayed,
            in_flight = inner.claims.len(),
            completed = inner.completed.len(),
            "idempotency store replayed"
        );
        Ok(Self { state: Mutex::new((inner, journal)) })
    }

    fn commit(&self, event: IdempotencyEvent) -> Result<()> {
        let mut state = self.state.lock();
        state.1.append(&event)?;
        state.0.apply(event);
        Ok(())
    }

    /// The committed result for `request_id`, if any.
    pub fn completed(&self, request_id: &RequestId) -> Option<CompletedOperation> {
        self.state.lock().0.completed.get(request_id).cloned()
    }

    pub fn claim_of(&self, request_id: &RequestId) -> Option<Claim> {
        self.state.lock().0.claims.get(request_id).cloned()
    }

    /// Insert-if-absent claim for `operation`.
    ///
    /// Fails with `ConflictingState` when the request id was already used
    /// for a different tenant or action.
    pub fn claim(
        &self,
        operation: PendingOperation,
        owner: &str,
        initial_stage: Stage,
        ttl: Duration,
    ) -> Result<ClaimOutcome> {
        let fingerprint = operation.fingerprint()?;
        let request_id = operation.request_id().clone();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| GatewayError::configuration(format!("claim ttl out of range: {}", e)))?;
        let now = Utc::now();

        let mut state = self.state.lock();
        let (inner, journal) = &mut *state;

        if let Some(done) = inner.completed.get(&request_id) {
            if done.fingerprint != fingerprint {
                return Err(reused(&request_id));
            }
            return Ok(ClaimOutcome::Completed(done.result.clone()));
        }

        let claim = match inner.claims.get(&request_id) {
            Some(existing) if existing.fingerprint != fingerprint => {
                return Err(reused(&request_id));
            }
            Some(existing) if existing.owner == owner => return Ok(ClaimOutcome::Claimed(existing.clone())),
            Some(existing) if !existing.is_expired_at(now) => {
                return Ok(ClaimOutcome::InFlight(existing.clone()));
            }
            Some(existing) => {
                warn!(
                    request_id = %request_id,
                    stale_owner = %existing.owner,
                    stage = ?existing.stage,
                    "taking over expired claim"
                );
                Claim {
                    owner: owner.to_string(),
                    expires_at: now + ttl,
                    takeovers: existing.takeovers + 1,
                    ..existing.clone()
                }
            }
            None => Claim {
                request_id: request_id.clone(),
                fingerprint,
                owner: owner.to_string(),
                stage: initial_stage,
                claimed_at: now,
                expires_at: now + ttl,
                operation,
                takeovers: 0,
            },
        };

        let event = IdempotencyEvent::Claimed(claim.clone());
        journal.append(&event)?;
        inner.apply(event);
        Ok(ClaimOutcome::Claimed(claim))
    }

    /// Record progress of an owned claim.
    pub fn advance(&self, request_id: &RequestId, owner: &str, stage: Stage) -> Result<()> {
        self.ensure_owner(request_id, owner)?;
        self.commit(IdempotencyEvent::Advanced { request_id: request_id.clone(), stage })
    }

    /// Push out the expiry of an owned claim.
    pub fn extend(&self, request_id: &RequestId, owner: &str, ttl: Duration) -> Result<()> {
        self.ensure_owner(request_id, owner)?;
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| GatewayError::configuration(format!("claim ttl out of range: {}", e)))?;
        self.commit(IdempotencyEvent::Extended {
            request_id: request_id.clone(),
            expires_at: Utc::now() + ttl,
        })
    }

    fn ensure_owner(&self, request_id: &RequestId, owner: &str) -> Result<()> {
        match self.claim_of(request_id) {
            Some(claim) if claim.owner == owner => Ok(()),
            Some(claim) => Err(GatewayError::conflict(format!(
                "request {} was taken over by {}",
                request_id, claim.owner
            ))),
            None => Err(GatewayError::conflict(format!("request {} is not claimed", request_id))),
        }
    }

    /// Commit the result of an owned claim. The first committed result wins
    /// and is returned.
    pub fn complete(&self, result: OperationResult, owner: &str) -> Result<OperationResult> {
        let request_id = result.request_id().clone();
        let mut state = self.state.lock();
        let (inner, journal) = &mut *state;

        if let Some(done) = inner.completed.get(&request_id) {
            return Ok(done.result.clone());
        }
        let claim = inner
            .claims
            .get(&request_id)
            .ok_or_else(|| GatewayError::conflict(format!("request {} is not claimed", request_id)))?;
        if claim.owner != owner {
            return Err(GatewayError::conflict(format!(
                "request {} was taken over by {}",
                request_id, claim.owner
            )));
        }

        let event = IdempotencyEvent::Completed {
            request_id: request_id.clone(),
            tenant_id: claim.operation.tenant_id().clone(),
            fingerprint: claim.fingerprint.clone(),
            result: result.clone(),
        };
        journal.append(&event)?;
        inner.apply(event);
        Ok(result)
    }

    pub fn mark_audited(&self, request_id: &RequestId) -> Result<()> {
        self.commit(IdempotencyEvent::Audited { request_id: request_id.clone() })
    }

    /// Claims whose owner has gone quiet past expiry.
    pub fn orphans(&self, now: DateTime<Utc>) -> Vec<Claim> {
        let mut orphans: Vec<Claim> = self
            .state
            .lock()
            .0
            .claims
            .values()
            .filter(|c| c.is_expired_at(now))
            .cloned()
            .collect();
        orphans.sort_by_key(|c| c.claimed_at);
        orphans
    }

    /// Committed results whose audit entry was never confirmed.
    pub fn unaudited(&self) -> Vec<CompletedOperation> {
        let mut pending: Vec<CompletedOperation> = self
            .state
            .lock()
            .0
            .completed
            .values()
            .filter(|c| !c.audited)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.result.request_id().cmp(b.result.request_id()));
        pending
    }
}

fn reused(request_id: &RequestId) -> GatewayError {
    GatewayError::conflict(format!(
        "request id {} was already used for a different request",
        request_id
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Outcome, SigningResult, SigningState};

    fn signing(request_id: &str, digest: u8) -> PendingOperation {
        PendingOperation::Signing(SigningRequest {
            request_id: request_id.into(),
            tenant_id: "t1".into(),
            key_id: "k1".into(),
            payload_digest: vec![digest; 32],
            requested_at: Utc::now(),
        })
    }

    fn result(request_id: &str) -> OperationResult {
        OperationResult::Signing(SigningResult {
            request_id: request_id.into(),
            key_id: "k1".into(),
            signature: vec![1, 2, 3],
            hsm_operation_id: Some("op".into()),
            completed_at: Utc::now(),
            outcome: Outcome::Success,
            attempts: 1,
            error_kind: None,
            message: None,
        })
    }

    const RECEIVED: Stage = Stage::Signing(SigningState::Received);

    #[test]
    fn test_second_claim_sees_in_flight_then_result() {
        let store = IdempotencyStore::in_memory();
        let ttl = Duration::from_secs(30);
        assert!(matches!(
            store.claim(signing("r1", 1), "a", RECEIVED, ttl).unwrap(),
            ClaimOutcome::Claimed(_)
        ));
        assert!(matches!(
            store.claim(signing("r1", 1), "b", RECEIVED, ttl).unwrap(),
            ClaimOutcome::InFlight(_)
        ));
        assert!(store.complete(result("r1"), "b").is_err());
        let committed = store.complete(result("r1"), "a").unwrap();
        assert_eq!(
            store.claim(signing("r1", 1), "b", RECEIVED, ttl).unwrap(),
            ClaimOutcome::Completed(committed)
        );
    }

    #[test]
    fn test_reused_request_id_with_different_payload_conflicts() {
        let store = IdempotencyStore::in_memory();
        let ttl = Duration::from_secs(30);
        store.claim(signing("r1", 1), "a", RECEIVED, ttl).unwrap();
        let err = store.claim(signing("r1", 2), "b", RECEIVED, ttl).unwrap_err();
        assert!(matches!(err, GatewayError::ConflictingState { .. }));
    }

    #[test]
    fn test_first_result_wins() {
        let store = IdempotencyStore::in_memory();
        store.claim(signing("r1", 1), "a", RECEIVED, Duration::from_secs(30)).unwrap();
        let first = store.complete(result("r1"), "a").unwrap();
        let mut other = result("r1");
        if let OperationResult::Signing(r) = &mut other {
            r.signature = vec![9, 9];
        }
        assert_eq!(store.complete(other, "a").unwrap(), first);
    }

    #[test]
    fn test_expired_claim_is_orphan_and_can_be_taken_over() {
        let store = IdempotencyStore::in_memory();
        store.claim(signing("r1", 1), "dead", RECEIVED, Duration::from_millis(1)).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(store.orphans(Utc::now()).len(), 1);
        match store.claim(signing("r1", 1), "sweeper", RECEIVED, Duration::from_secs(30)).unwrap() {
            ClaimOutcome::Claimed(claim) => {
                assert_eq!(claim.owner, "sweeper");
                assert_eq!(claim.takeovers, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(store.advance(&"r1".into(), "dead", RECEIVED).is_err());
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requests.jsonl");
        {
            let store = IdempotencyStore::open(Some(&path), true).unwrap();
            store.claim(signing("r1", 1), "a", RECEIVED, Duration::from_secs(30)).unwrap();
            store.claim(signing("r2", 1), "a", RECEIVED, Duration::from_secs(30)).unwrap();
            store.complete(result("r1"), "a").unwrap();
        }
        let store = IdempotencyStore::open(Some(&path), true).unwrap();
        assert_eq!(store.completed(&"r1".into()).unwrap().tenant_id.as_str(), "t1");
        assert_eq!(store.unaudited().len(), 1);
        assert!(store.claim_of(&"r2".into()).is_some());
        store.mark_audited(&"r1".into()).unwrap();
        assert!(store.unaudited().is_empty());
    }

    #[test]
    fn test_reopen_compacts_journal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requests.jsonl");
        let lines = || std::fs::read_to_string(&path).unwrap().lines().count();
        {
            let store = IdempotencyStore::open(Some(&path), false).unwrap();
            for n in 0..3 {
                let request_id = format!("r{}", n);
                store.claim(signing(&request_id, 1), "a", RECEIVED, Duration::from_secs(30)).unwrap();
                store
                    .advance(&request_id.as_str().into(), "a", Stage::Signing(SigningState::HsmInvoked))
                    .unwrap();
                store.extend(&request_id.as_str().into(), "a", Duration::from_secs(30)).unwrap();
            }
            store.complete(result("r0"), "a").unwrap();
            store.mark_audited(&"r0".into()).unwrap();
            store.complete(result("r1"), "a").unwrap();
        }
        assert_eq!(lines(), 12);

        let store = IdempotencyStore::open(Some(&path), false).unwrap();
        // r0 completed and audited, r1 completed, r2 still claimed
        assert_eq!(lines(), 4);
        assert!(store.completed(&"r0".into()).unwrap().audited);
        assert!(!store.completed(&"r1".into()).unwrap().audited);
        let claim = store.claim_of(&"r2".into()).unwrap();
        assert_eq!(claim.stage, Stage::Signing(SigningState::HsmInvoked));

        // Appends after compaction still replay
        store.mark_audited(&"r1".into()).unwrap();
        drop(store);
        let store = IdempotencyStore::open(Some(&path), false).unwrap();
        assert!(store.unaudited().is_empty());
        assert!(store.claim_of(&"r2".into()).is_some());
        assert_eq!(lines(), 5);
    }
}
