//! Case Claim Coordinator.
//!
//! An agent works one case at a time. A claim checks the agent's active
//! count and the case status inside a single snapshot, so of two agents
//! racing for the same OPEN case exactly one ends up assigned.

use std::sync::Arc;

use jitgate_storage::{
    AssignmentRecord, AuditAction, AuditResult, CaseId, CaseRecord, CaseStatus, GateStorage,
    Role, StorageError,
};
use tracing::{info, warn};

use crate::audit::AuditRecorder;
use crate::clock::Clock;
use crate::error::{ConflictReason, GateError, PolicyReason};
use crate::Actor;

pub struct ClaimCoordinator<S> {
    storage: Arc<S>,
    clock: Arc<dyn Clock>,
    audit: AuditRecorder<S>,
}

impl<S> Clone for ClaimCoordinator<S> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            clock: self.clock.clone(),
            audit: self.audit.clone(),
        }
    }
}

const MAX_SUBJECT_LEN: usize = 200;

impl<S: GateStorage> ClaimCoordinator<S> {
    pub fn new(storage: Arc<S>, clock: Arc<dyn Clock>, audit: AuditRecorder<S>) -> Self {
        Self {
            storage,
            clock,
            audit,
        }
    }

    /// Open a new case on behalf of its owner.
    pub async fn open_case(&self, owner: Actor, subject: &str) -> Result<CaseRecord, GateError> {
        if owner.role != Role::User {
            return Err(GateError::Unauthorized);
        }
        let subject = subject.trim();
        if subject.is_empty() {
            return Err(GateError::InvalidInput("subject must not be empty".to_string()));
        }
        if subject.chars().count() > MAX_SUBJECT_LEN {
            return Err(GateError::InvalidInput(format!(
                "subject must be at most {MAX_SUBJECT_LEN} characters"
            )));
        }

        let mut snap = self.storage.begin_snapshot().await?;
        let case = self
            .storage
            .insert_case(&mut snap, owner.id, subject, self.clock.now())
            .await?;
        self.storage.commit_snapshot(snap).await?;

        info!(case_id = case.id, owner_id = owner.id, "case opened");
        self.audit
            .record(case.id, owner, AuditAction::OpenCase, AuditResult::Success, "")
            .await?;
        Ok(case)
    }

    /// Cases waiting for an agent, oldest first.
    pub async fn open_queue(&self) -> Result<Vec<CaseRecord>, GateError> {
        Ok(self.storage.list_cases(Some(CaseStatus::Open)).await?)
    }

    pub async fn claim(&self, agent: Actor, case_id: CaseId) -> Result<(), GateError> {
        if agent.role != Role::Agent {
            self.deny(case_id, agent, AuditAction::ClaimCase, "role may not claim cases")
                .await?;
            return Err(GateError::Unauthorized);
        }

        let now = self.clock.now();
        let mut snap = self.storage.begin_snapshot().await?;

        let active = self
            .storage
            .count_active_cases_for_agent(&mut snap, agent.id)
            .await?;
        if active > 0 {
            self.storage.abort_snapshot(snap).await?;
            warn!(case_id, agent_id = agent.id, "claim denied: agent already has an active case");
            self.deny(
                case_id,
                agent,
                AuditAction::ClaimCase,
                "agent already has an active case",
            )
            .await?;
            return Err(GateError::PolicyViolation(PolicyReason::ActiveLimit));
        }

        let case = match self.storage.get_case_for_update(&mut snap, case_id).await {
            Ok(case) => case,
            Err(e) => {
                self.storage.abort_snapshot(snap).await?;
                return Err(e.into());
            }
        };
        if case.status != CaseStatus::Open {
            self.storage.abort_snapshot(snap).await?;
            return self.lost_race(case_id, agent).await;
        }

        let assigned = self
            .storage
            .insert_assignment(
                &mut snap,
                AssignmentRecord {
                    case_id,
                    agent_id: agent.id,
                    assigned_at: now,
                },
            )
            .await;
        let flipped = match assigned {
            Ok(()) => {
                self.storage
                    .update_case_status(
                        &mut snap,
                        case_id,
                        CaseStatus::Open,
                        CaseStatus::InProgress,
                        now,
                    )
                    .await
            }
            Err(e) => Err(e),
        };
        match flipped {
            Ok(()) => self.storage.commit_snapshot(snap).await?,
            Err(StorageError::AlreadyAssigned { .. })
            | Err(StorageError::ConcurrentConflict { .. }) => {
                self.storage.abort_snapshot(snap).await?;
                return self.lost_race(case_id, agent).await;
            }
            Err(e) => {
                self.storage.abort_snapshot(snap).await?;
                return Err(e.into());
            }
        }

        info!(case_id, agent_id = agent.id, "case claimed");
        self.audit
            .record(case_id, agent, AuditAction::ClaimCase, AuditResult::Success, "")
            .await?;
        Ok(())
    }

    /// Close a case. Only its owner or its assigned agent may do so.
    pub async fn close(&self, requestor: Actor, case_id: CaseId) -> Result<(), GateError> {
        let mut snap = self.storage.begin_snapshot().await?;
        let case = match self.storage.get_case_for_update(&mut snap, case_id).await {
            Ok(case) => case,
            Err(e) => {
                self.storage.abort_snapshot(snap).await?;
                return Err(e.into());
            }
        };

        let authorized = match requestor.role {
            Role::User => case.owner_id == requestor.id,
            Role::Agent => self
                .storage
                .get_assignment_for_update(&mut snap, case_id)
                .await?
                .is_some_and(|a| a.agent_id == requestor.id),
            Role::Auditor => false,
        };
        if !authorized {
            self.storage.abort_snapshot(snap).await?;
            warn!(case_id, role = %requestor.role, "close denied: not owner or assignee");
            self.deny(
                case_id,
                requestor,
                AuditAction::CloseCase,
                "requestor is neither owner nor assigned agent",
            )
            .await?;
            return Err(GateError::Unauthorized);
        }

        if case.status == CaseStatus::Closed {
            self.storage.abort_snapshot(snap).await?;
            self.deny(case_id, requestor, AuditAction::CloseCase, "case already closed")
                .await?;
            return Err(GateError::Conflict(ConflictReason::AlreadyClosed));
        }

        match self
            .storage
            .update_case_status(
                &mut snap,
                case_id,
                case.status,
                CaseStatus::Closed,
                self.clock.now(),
            )
            .await
        {
            Ok(()) => self.storage.commit_snapshot(snap).await?,
            Err(StorageError::ConcurrentConflict { .. }) => {
                self.storage.abort_snapshot(snap).await?;
                return Err(GateError::Conflict(ConflictReason::AlreadyClosed));
            }
            Err(e) => {
                self.storage.abort_snapshot(snap).await?;
                return Err(e.into());
            }
        }

        info!(case_id, role = %requestor.role, "case closed");
        self.audit
            .record(
                case_id,
                requestor,
                AuditAction::CloseCase,
                AuditResult::Success,
                format!("closed from {}", case.status),
            )
            .await?;
        Ok(())
    }

    async fn lost_race(&self, case_id: CaseId, agent: Actor) -> Result<(), GateError> {
        warn!(case_id, agent_id = agent.id, "claim refused: case no longer open");
        self.deny(case_id, agent, AuditAction::ClaimCase, "case is no longer open")
            .await?;
        Err(GateError::Conflict(ConflictReason::AlreadyClaimed))
    }

    async fn deny(
        &self,
        case_id: CaseId,
        actor: Actor,
        action: AuditAction,
        context: &str,
    ) -> Result<(), GateError> {
        self.audit
            .record(case_id, actor, action, AuditResult::Denied, context)
            .await
    }
}
