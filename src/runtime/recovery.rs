//! Recovery sweep.
//!
//! Re-drives claims whose owner stopped renewing them (crash, lost process)
//! and writes the audit entries of results that were committed but never
//! confirmed as audited.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::audit::{AuditAction, AuditDraft};
use crate::error::Result;
use crate::runtime::orchestrator::SigningOrchestrator;
use crate::runtime::state::is_terminal;
use crate::storage::ClaimOutcome;
use crate::types::{Outcome, RequestId};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Orphaned requests driven to a committed result.
    pub redriven: Vec<RequestId>,
    /// Committed results whose audit entry was written or confirmed.
    pub audited: Vec<RequestId>,
    /// Requests the sweep could not finish, with the reason.
    pub failed: Vec<(RequestId, String)>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.redriven.is_empty() && self.audited.is_empty() && self.failed.is_empty()
    }
}

impl SigningOrchestrator {
    /// Run one recovery sweep.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let requests = &self.shared.requests;

        for orphan in requests.orphans(Utc::now()) {
            let request_id = orphan.request_id.clone();
            if is_terminal(orphan.stage) {
                warn!(request_id = %request_id, stage = ?orphan.stage, "orphan claim past its terminal stage");
            }
            let owner = self.new_owner();
            let claimed = requests.claim(
                orphan.operation.clone(),
                &owner,
                orphan.stage,
                self.shared.config.lease_ttl(),
            );
            match claimed {
                Ok(ClaimOutcome::Claimed(claim)) => {
                    info!(
                        request_id = %request_id,
                        stage = ?claim.stage,
                        takeovers = claim.takeovers,
                        "re-driving orphaned request"
                    );
                    match self.drive(claim).await {
                        Ok(_) => report.redriven.push(request_id),
                        Err(e) => report.failed.push((request_id, e.to_string())),
                    }
                }
                // Finished or picked up by someone else meanwhile
                Ok(_) => {}
                Err(e) => report.failed.push((request_id, e.to_string())),
            }
        }

        for done in requests.unaudited() {
            let request_id = done.result.request_id().clone();
            match self.audit_once(&done.result, done.tenant_id.as_str(), true) {
                Ok(_) => report.audited.push(request_id),
                Err(e) => report.failed.push((request_id, e.to_string())),
            }
        }

        if !report.is_empty() {
            let outcome = if report.failed.is_empty() { Outcome::Success } else { Outcome::Failed };
            self.shared.audit.append(
                AuditDraft::new("gateway", AuditAction::Recovery, outcome).detail(json!({
                    "redriven": report.redriven,
                    "audited": report.audited,
                    "failed": report.failed.len(),
                })),
            )?;
            info!(
                redriven = report.redriven.len(),
                audited = report.audited.len(),
                failed = report.failed.len(),
                "recovery sweep finished"
            );
        }
        Ok(report)
    }

    /// Run [`recover`](Self::recover) every `period` until the handle is
    /// aborted. The first sweep happens one period after spawning.
    pub(crate) fn spawn_sweeper(&self, period: Duration) -> JoinHandle<()> {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                match orchestrator.recover().await {
                    Ok(report) if report.is_empty() => debug!("recovery sweep found nothing to do"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "recovery sweep failed"),
                }
            }
        })
    }
}
