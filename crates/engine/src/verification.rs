//! Verification State Machine: the owner's step-up challenge.
//!
//! ```text
//! PENDING ──(all answers correct)──▶ PASSED   (grant minted for the agent)
//!    │
//!    └──(wrong, attempts == max)───▶ FAILED   (owner risk score raised)
//! ```
//!
//! PASSED and FAILED are terminal. A PENDING session read after its
//! deadline is EXPIRED without any write.

use std::collections::HashMap;
use std::sync::Arc;

use jitgate_storage::{
    AuditAction, AuditResult, CaseId, CaseStatus, GateStorage, Grantee, QuestionCategory,
    QuestionId, QuestionRecord, Role, SessionRecord, SessionStatus, StorageError,
};
use rand::seq::SliceRandom;
use serde::Serialize;
use time::{Duration, OffsetDateTime};
use tracing::{error, info, warn};

use crate::audit::AuditRecorder;
use crate::clock::Clock;
use crate::config::GateConfig;
use crate::crypto;
use crate::error::{GateError, PolicyReason};
use crate::ledger::PrivilegeLedger;
use crate::Actor;

/// Returned to the agent when a session starts. Carries nothing that
/// identifies the case or its owner.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationLink {
    pub verification_url: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

/// A question as shown to the owner. The answer digest stays behind.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChallengeQuestion {
    pub id: QuestionId,
    pub category: QuestionCategory,
    pub prompt: String,
}

impl From<QuestionRecord> for ChallengeQuestion {
    fn from(q: QuestionRecord) -> Self {
        Self {
            id: q.id,
            category: q.category,
            prompt: q.prompt,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitOutcome {
    pub passed: bool,
    pub status: SessionStatus,
    pub message: String,
}

pub struct VerificationEngine<S> {
    storage: Arc<S>,
    clock: Arc<dyn Clock>,
    audit: AuditRecorder<S>,
    ledger: PrivilegeLedger<S>,
    config: Arc<GateConfig>,
}

impl<S> Clone for VerificationEngine<S> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            clock: self.clock.clone(),
            audit: self.audit.clone(),
            ledger: self.ledger.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: GateStorage> VerificationEngine<S> {
    pub fn new(
        storage: Arc<S>,
        clock: Arc<dyn Clock>,
        audit: AuditRecorder<S>,
        ledger: PrivilegeLedger<S>,
        config: Arc<GateConfig>,
    ) -> Self {
        Self {
            storage,
            clock,
            audit,
            ledger,
            config,
        }
    }

    /// Start a session for the owner of `case_id`. Only the agent working
    /// the case may do this.
    pub async fn start(&self, agent: Actor, case_id: CaseId) -> Result<VerificationLink, GateError> {
        let case = self.storage.get_case(case_id).await?;
        let assignee = self.storage.get_assignment(case_id).await?;
        let working_it = agent.role == Role::Agent
            && case.status == CaseStatus::InProgress
            && assignee.is_some_and(|a| a.agent_id == agent.id);
        if !working_it {
            warn!(case_id, "verification refused: requestor is not working the case");
            self.deny(case_id, agent, "requestor is not the assigned agent")
                .await?;
            return Err(GateError::Unauthorized);
        }

        let v = &self.config.verification;
        let owner = self.storage.get_user(case.owner_id).await?;
        if owner.risk_score >= v.risk_threshold {
            warn!(case_id, risk_score = owner.risk_score, "verification refused: high risk");
            self.deny(case_id, agent, &format!("risk score {}", owner.risk_score))
                .await?;
            return Err(GateError::PolicyViolation(PolicyReason::HighRisk));
        }

        let now = self.clock.now();
        let recent = self
            .storage
            .count_sessions_since(owner.id, now - Duration::hours(24))
            .await?;
        if recent >= v.max_sessions_per_day {
            warn!(case_id, recent, "verification refused: rate limited");
            self.deny(case_id, agent, &format!("{recent} sessions in the last 24h"))
                .await?;
            return Err(GateError::PolicyViolation(PolicyReason::RateLimited));
        }

        let question_ids = self.pick_questions().await?;

        let session = SessionRecord {
            id: crypto::generate_token(),
            case_id,
            owner_id: owner.id,
            status: SessionStatus::Pending,
            attempt_count: 0,
            expires_at: now + self.config.session_ttl(),
            created_at: now,
        };
        let url = format!(
            "{}/verify/{}",
            v.verify_base_url.trim_end_matches('/'),
            session.id
        );
        let expires_at = session.expires_at;

        let mut snap = self.storage.begin_snapshot().await?;
        self.storage
            .insert_session(&mut snap, session, &question_ids)
            .await?;
        self.storage.commit_snapshot(snap).await?;

        info!(case_id, "verification session started");
        self.audit
            .record(
                case_id,
                agent,
                AuditAction::StartVerification,
                AuditResult::Success,
                format!("session pending until {expires_at}"),
            )
            .await?;
        Ok(VerificationLink {
            verification_url: url,
            expires_at,
        })
    }

    /// One random question from each category, in category order.
    async fn pick_questions(&self) -> Result<Vec<QuestionId>, GateError> {
        let mut banks = Vec::with_capacity(QuestionCategory::ALL.len());
        for category in QuestionCategory::ALL {
            banks.push((category, self.storage.list_questions(category).await?));
        }
        let mut rng = rand::thread_rng();
        let mut picked = Vec::with_capacity(banks.len());
        for (category, bank) in &banks {
            match bank.choose(&mut rng) {
                Some(q) => picked.push(q.id),
                None => {
                    error!(%category, "question bank has no entries for category");
                    return Err(GateError::System(format!(
                        "no challenge questions in category {category}"
                    )));
                }
            }
        }
        Ok(picked)
    }

    /// The bound questions of a live session.
    pub async fn get_challenge(&self, session_id: &str) -> Result<Vec<ChallengeQuestion>, GateError> {
        let session = self
            .live_session(session_id, AuditAction::GetChallenge)
            .await?;
        let questions = self.storage.session_questions(session_id).await?;
        self.audit
            .record(
                session.case_id,
                Actor::user(session.owner_id),
                AuditAction::GetChallenge,
                AuditResult::Success,
                "",
            )
            .await?;
        Ok(questions.into_iter().map(ChallengeQuestion::from).collect())
    }

    pub async fn submit_answers(
        &self,
        session_id: &str,
        answers: &HashMap<QuestionId, String>,
    ) -> Result<SubmitOutcome, GateError> {
        let session = self
            .live_session(session_id, AuditAction::VerificationAttempt)
            .await?;
        let questions = self.storage.session_questions(session_id).await?;
        let all_correct = !questions.is_empty()
            && questions.iter().all(|q| {
                answers
                    .get(&q.id)
                    .is_some_and(|given| crypto::verify_answer(&q.answer_digest, given))
            });

        if all_correct {
            self.pass(session).await
        } else {
            self.fail(session).await
        }
    }

    async fn fail(&self, session: SessionRecord) -> Result<SubmitOutcome, GateError> {
        let now = self.clock.now();
        let v = &self.config.verification;
        let mut snap = self.storage.begin_snapshot().await?;
        let current = self.storage.get_session_for_update(&mut snap, &session.id).await?;
        if !current.is_answerable(now) {
            self.storage.abort_snapshot(snap).await?;
            return Err(GateError::InvalidSession);
        }

        let attempts = current.attempt_count + 1;
        let status = if attempts >= v.max_attempts {
            SessionStatus::Failed
        } else {
            SessionStatus::Pending
        };
        match self
            .storage
            .update_session_progress(&mut snap, &current.id, current.attempt_count, attempts, status)
            .await
        {
            Ok(()) => {}
            Err(StorageError::ConcurrentConflict { .. }) => {
                self.storage.abort_snapshot(snap).await?;
                return Err(GateError::InvalidSession);
            }
            Err(e) => {
                self.storage.abort_snapshot(snap).await?;
                return Err(e.into());
            }
        }
        if status == SessionStatus::Failed && v.lockout_risk_penalty > 0 {
            self.storage
                .adjust_risk_score(&mut snap, current.owner_id, v.lockout_risk_penalty)
                .await?;
        }
        self.storage.commit_snapshot(snap).await?;

        let message = if status == SessionStatus::Failed {
            warn!(case_id = current.case_id, "verification locked out");
            "verification locked: too many failed attempts, a new case is required".to_string()
        } else {
            let remaining = v.max_attempts - attempts;
            info!(case_id = current.case_id, attempts, "verification attempt failed");
            format!(
                "{remaining} {} remaining",
                if remaining == 1 { "attempt" } else { "attempts" }
            )
        };
        self.audit
            .record(
                current.case_id,
                Actor::user(current.owner_id),
                AuditAction::VerificationAttempt,
                AuditResult::Failed,
                format!("session {}, attempt {attempts}, status {status}", current.id),
            )
            .await?;
        Ok(SubmitOutcome {
            passed: false,
            status,
            message,
        })
    }

    async fn pass(&self, session: SessionRecord) -> Result<SubmitOutcome, GateError> {
        let now = self.clock.now();
        let mut snap = self.storage.begin_snapshot().await?;
        let current = self.storage.get_session_for_update(&mut snap, &session.id).await?;
        if !current.is_answerable(now) {
            self.storage.abort_snapshot(snap).await?;
            return Err(GateError::InvalidSession);
        }

        let Some(assignment) = self
            .storage
            .get_assignment_for_update(&mut snap, current.case_id)
            .await?
        else {
            self.storage.abort_snapshot(snap).await?;
            error!(case_id = current.case_id, "verification passed but case has no assigned agent");
            return Err(GateError::System(
                "case is not assigned to any agent".to_string(),
            ));
        };

        let grant_action = self.config.privilege.grant_action;
        self.ledger
            .grant_in(
                &mut snap,
                Grantee::Agent(assignment.agent_id),
                current.case_id,
                grant_action,
                self.config.grant_ttl(),
            )
            .await?;
        match self
            .storage
            .update_session_progress(
                &mut snap,
                &current.id,
                current.attempt_count,
                current.attempt_count,
                SessionStatus::Passed,
            )
            .await
        {
            Ok(()) => self.storage.commit_snapshot(snap).await?,
            Err(StorageError::ConcurrentConflict { .. }) => {
                self.storage.abort_snapshot(snap).await?;
                return Err(GateError::InvalidSession);
            }
            Err(e) => {
                self.storage.abort_snapshot(snap).await?;
                return Err(e.into());
            }
        }

        info!(case_id = current.case_id, %grant_action, "verification passed; privilege granted");
        self.audit
            .record(
                current.case_id,
                Actor::user(current.owner_id),
                AuditAction::VerificationSuccess,
                AuditResult::Passed,
                format!("{grant_action} granted to the assigned agent"),
            )
            .await?;
        Ok(SubmitOutcome {
            passed: true,
            status: SessionStatus::Passed,
            message: "verification passed".to_string(),
        })
    }

    /// Load a session that can still be answered, or refuse uniformly.
    async fn live_session(
        &self,
        session_id: &str,
        action: AuditAction,
    ) -> Result<SessionRecord, GateError> {
        let session = match self.storage.get_session(session_id).await {
            Ok(session) => session,
            Err(StorageError::NotFound { .. }) => {
                warn!(%action, "unknown verification session");
                return Err(GateError::InvalidSession);
            }
            Err(e) => return Err(e.into()),
        };
        let now = self.clock.now();
        if session.is_answerable(now) {
            return Ok(session);
        }
        let cause = match session.effective_status(now) {
            SessionStatus::Expired => "session expired".to_string(),
            other => format!("session already {other}"),
        };
        warn!(case_id = session.case_id, %action, cause = %cause, "verification session refused");
        self.audit
            .record(
                session.case_id,
                Actor::user(session.owner_id),
                action,
                AuditResult::Denied,
                cause,
            )
            .await?;
        Err(GateError::InvalidSession)
    }

    async fn deny(&self, case_id: CaseId, agent: Actor, context: &str) -> Result<(), GateError> {
        self.audit
            .record(
                case_id,
                agent,
                AuditAction::StartVerification,
                AuditResult::Denied,
                context,
            )
            .await
    }
}
