//! Audit Recorder: the append-only event sink every decision writes to.
//!
//! Agent identities are replaced with a keyed pseudonym before storage.
//! A row recording a refusal or a verification outcome must land: after
//! `write_retries` failed attempts the caller gets `GateError::System`. A
//! row recording an ordinary success is best-effort and only logged when
//! it cannot be written.

use std::collections::BTreeMap;
use std::sync::Arc;

use jitgate_storage::{
    AuditAction, AuditRecord, AuditResult, CaseId, GateStorage, NewAuditEntry, Role,
};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{error, warn};

use crate::clock::Clock;
use crate::crypto::Pseudonymizer;
use crate::error::GateError;
use crate::Actor;

/// Per-case summary of the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaseReport {
    pub case_id: CaseId,
    pub events: usize,
    pub denied: usize,
    pub failed: usize,
    pub last_action: AuditAction,
    pub last_result: AuditResult,
    #[serde(with = "time::serde::rfc3339")]
    pub last_at: OffsetDateTime,
}

pub struct AuditRecorder<S> {
    storage: Arc<S>,
    clock: Arc<dyn Clock>,
    pseudonyms: Pseudonymizer,
    write_retries: u32,
}

impl<S> Clone for AuditRecorder<S> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            clock: self.clock.clone(),
            pseudonyms: self.pseudonyms.clone(),
            write_retries: self.write_retries,
        }
    }
}

impl<S: GateStorage> AuditRecorder<S> {
    pub fn new(
        storage: Arc<S>,
        clock: Arc<dyn Clock>,
        pseudonyms: Pseudonymizer,
        write_retries: u32,
    ) -> Self {
        Self {
            storage,
            clock,
            pseudonyms,
            write_retries: write_retries.max(1),
        }
    }

    /// The identifier stored for `actor`: a pseudonym for agents, a plain
    /// role-prefixed id otherwise.
    pub fn actor_ref(&self, actor: Actor) -> Result<String, GateError> {
        match actor.role {
            Role::Agent => self.pseudonyms.agent_ref(actor.id),
            Role::User => Ok(format!("USER-{}", actor.id)),
            Role::Auditor => Ok(format!("AUDITOR-{}", actor.id)),
        }
    }

    pub async fn record(
        &self,
        case_id: CaseId,
        actor: Actor,
        action: AuditAction,
        result: AuditResult,
        context: impl Into<String>,
    ) -> Result<(), GateError> {
        let entry = NewAuditEntry {
            case_id,
            actor_ref: self.actor_ref(actor)?,
            actor_role: actor.role,
            action,
            result,
            context: context.into(),
            timestamp: self.clock.now(),
        };

        let mut last_err = None;
        for attempt in 1..=self.write_retries {
            match self.storage.append_audit(entry.clone()).await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    warn!(case_id, %action, %result, attempt, error = %e, "audit write failed");
                    last_err = Some(e);
                }
            }
        }
        let reason = last_err.map(|e| e.to_string()).unwrap_or_default();

        if result == AuditResult::Success {
            error!(case_id, %action, error = %reason, "audit record dropped");
            return Ok(());
        }
        error!(case_id, %action, %result, error = %reason, "audit record for a decision could not be persisted");
        Err(GateError::System(format!(
            "audit record could not be persisted: {reason}"
        )))
    }

    /// The whole log, oldest first.
    pub async fn trail(&self) -> Result<Vec<AuditRecord>, GateError> {
        Ok(self.storage.list_audit(None).await?)
    }

    pub async fn by_case(&self, case_id: CaseId) -> Result<Vec<AuditRecord>, GateError> {
        Ok(self.storage.list_audit(Some(case_id)).await?)
    }

    /// One summary per case that has any audit rows, ordered by case id.
    pub async fn case_reports(&self) -> Result<Vec<CaseReport>, GateError> {
        let rows = self.storage.list_audit(None).await?;
        let mut reports: BTreeMap<CaseId, CaseReport> = BTreeMap::new();
        for row in rows {
            let report = reports.entry(row.case_id).or_insert(CaseReport {
                case_id: row.case_id,
                events: 0,
                denied: 0,
                failed: 0,
                last_action: row.action,
                last_result: row.result,
                last_at: row.timestamp,
            });
            report.events += 1;
            match row.result {
                AuditResult::Denied => report.denied += 1,
                AuditResult::Failed => report.failed += 1,
                AuditResult::Success | AuditResult::Passed => {}
            }
            report.last_action = row.action;
            report.last_result = row.result;
            report.last_at = row.timestamp;
        }
        Ok(reports.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use jitgate_storage::MemoryStorage;
    use time::macros::datetime;
    use time::Duration;

    fn recorder() -> (AuditRecorder<MemoryStorage>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(datetime!(2026-04-01 8:00 UTC)));
        let recorder = AuditRecorder::new(
            Arc::new(MemoryStorage::new()),
            clock.clone(),
            Pseudonymizer::new(b"audit-test".to_vec()),
            3,
        );
        (recorder, clock)
    }

    #[tokio::test]
    async fn agent_ids_never_stored_in_clear() {
        let (audit, _) = recorder();
        audit
            .record(
                4,
                Actor::agent(17),
                AuditAction::ClaimCase,
                AuditResult::Success,
                "",
            )
            .await
            .unwrap();
        audit
            .record(
                4,
                Actor::user(9),
                AuditAction::OpenCase,
                AuditResult::Success,
                "",
            )
            .await
            .unwrap();

        let rows = audit.by_case(4).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].actor_role, Role::Agent);
        assert_eq!(rows[0].actor_ref.len(), 64);
        assert_ne!(rows[0].actor_ref, "17");
        assert_eq!(rows[0].actor_ref, audit.actor_ref(Actor::agent(17)).unwrap());
        assert_eq!(rows[1].actor_ref, "USER-9");
    }

    #[tokio::test]
    async fn reports_summarise_each_case() {
        let (audit, clock) = recorder();
        audit
            .record(1, Actor::agent(2), AuditAction::ClaimCase, AuditResult::Success, "")
            .await
            .unwrap();
        clock.advance(Duration::minutes(1));
        audit
            .record(
                1,
                Actor::agent(2),
                AuditAction::StartVerification,
                AuditResult::Denied,
                "risk score 90",
            )
            .await
            .unwrap();
        clock.advance(Duration::minutes(1));
        audit
            .record(2, Actor::user(5), AuditAction::OpenCase, AuditResult::Success, "")
            .await
            .unwrap();

        let reports = audit.case_reports().await.unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].case_id, 1);
        assert_eq!(reports[0].events, 2);
        assert_eq!(reports[0].denied, 1);
        assert_eq!(reports[0].last_action, AuditAction::StartVerification);
        assert_eq!(reports[0].last_at, datetime!(2026-04-01 8:01 UTC));
        assert_eq!(reports[1].events, 1);
        assert_eq!(reports[1].denied, 0);
    }
}
