//! In-process reference backend.
//!
//! Snapshots take an owned lock on the table set for their whole lifetime
//! and stage writes on a private copy, so they are serial with respect to
//! each other. Commit publishes the copy; abort or drop discards it. The
//! audit log lives behind its own lock because appends happen outside
//! snapshots.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::StorageError;
use crate::record::{
    ActionKind, AssignmentRecord, AuditRecord, CaseId, CaseRecord, CaseStatus, Grantee,
    NewAuditEntry, NewPrivilege, NewQuestion, NewUser, PrivilegeId, PrivilegeRecord,
    QuestionCategory, QuestionId, QuestionRecord, SessionRecord, SessionStatus, UserId,
    UserRecord,
};
use crate::traits::GateStorage;

#[derive(Debug, Default, Clone)]
struct Tables {
    users: BTreeMap<UserId, UserRecord>,
    cases: BTreeMap<CaseId, CaseRecord>,
    assignments: BTreeMap<CaseId, AssignmentRecord>,
    questions: BTreeMap<QuestionId, QuestionRecord>,
    sessions: HashMap<String, SessionRecord>,
    slots: HashMap<String, Vec<QuestionId>>,
    privileges: BTreeMap<PrivilegeId, PrivilegeRecord>,
    last_user_id: u64,
    last_case_id: u64,
    last_question_id: u64,
    last_privilege_id: u64,
}

impl Tables {
    fn user(&self, user_id: UserId) -> Result<&UserRecord, StorageError> {
        self.users
            .get(&user_id)
            .ok_or_else(|| StorageError::not_found("user", user_id))
    }

    fn user_mut(&mut self, user_id: UserId) -> Result<&mut UserRecord, StorageError> {
        self.users
            .get_mut(&user_id)
            .ok_or_else(|| StorageError::not_found("user", user_id))
    }

    fn case(&self, case_id: CaseId) -> Result<&CaseRecord, StorageError> {
        self.cases
            .get(&case_id)
            .ok_or_else(|| StorageError::not_found("case", case_id))
    }

    fn session(&self, session_id: &str) -> Result<&SessionRecord, StorageError> {
        self.sessions
            .get(session_id)
            .ok_or_else(|| StorageError::not_found("session", session_id))
    }
}

/// A `GateStorage` that keeps everything in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    tables: Arc<Mutex<Tables>>,
    audit: Arc<Mutex<Vec<AuditRecord>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

/// An open unit of work against [`MemoryStorage`].
pub struct MemorySnapshot {
    guard: OwnedMutexGuard<Tables>,
    staged: Tables,
}

#[async_trait]
impl GateStorage for MemoryStorage {
    type Snapshot = MemorySnapshot;

    async fn begin_snapshot(&self) -> Result<MemorySnapshot, StorageError> {
        let guard = self.tables.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(MemorySnapshot { guard, staged })
    }

    async fn commit_snapshot(&self, snapshot: MemorySnapshot) -> Result<(), StorageError> {
        let MemorySnapshot { mut guard, staged } = snapshot;
        *guard = staged;
        Ok(())
    }

    async fn abort_snapshot(&self, snapshot: MemorySnapshot) -> Result<(), StorageError> {
        drop(snapshot);
        Ok(())
    }

    async fn insert_user(
        &self,
        snapshot: &mut MemorySnapshot,
        user: NewUser,
    ) -> Result<UserRecord, StorageError> {
        let t = &mut snapshot.staged;
        if t.users.values().any(|u| u.email == user.email) {
            return Err(StorageError::Duplicate {
                kind: "user email",
                id: user.email,
            });
        }
        t.last_user_id += 1;
        let record = UserRecord {
            id: t.last_user_id,
            email: user.email,
            role: user.role,
            risk_score: user.risk_score,
            credential_digest: user.credential_digest,
            created_at: user.created_at,
        };
        t.users.insert(record.id, record.clone());
        Ok(record)
    }

    async fn adjust_risk_score(
        &self,
        snapshot: &mut MemorySnapshot,
        user_id: UserId,
        delta: i64,
    ) -> Result<i64, StorageError> {
        let user = snapshot.staged.user_mut(user_id)?;
        user.risk_score = user.risk_score.saturating_add(delta);
        Ok(user.risk_score)
    }

    async fn set_credential_digest(
        &self,
        snapshot: &mut MemorySnapshot,
        user_id: UserId,
        digest: &str,
    ) -> Result<(), StorageError> {
        snapshot.staged.user_mut(user_id)?.credential_digest = digest.to_string();
        Ok(())
    }

    async fn insert_case(
        &self,
        snapshot: &mut MemorySnapshot,
        owner_id: UserId,
        subject: &str,
        now: OffsetDateTime,
    ) -> Result<CaseRecord, StorageError> {
        let t = &mut snapshot.staged;
        t.last_case_id += 1;
        let record = CaseRecord {
            id: t.last_case_id,
            owner_id,
            subject: subject.to_string(),
            status: CaseStatus::Open,
            created_at: now,
            updated_at: now,
        };
        t.cases.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_case_for_update(
        &self,
        snapshot: &mut MemorySnapshot,
        case_id: CaseId,
    ) -> Result<CaseRecord, StorageError> {
        snapshot.staged.case(case_id).cloned()
    }

    async fn update_case_status(
        &self,
        snapshot: &mut MemorySnapshot,
        case_id: CaseId,
        expected: CaseStatus,
        new_status: CaseStatus,
        now: OffsetDateTime,
    ) -> Result<(), StorageError> {
        let case = snapshot
            .staged
            .cases
            .get_mut(&case_id)
            .ok_or_else(|| StorageError::not_found("case", case_id))?;
        if case.status != expected {
            return Err(StorageError::conflict("case", case_id));
        }
        case.status = new_status;
        case.updated_at = now;
        Ok(())
    }

    async fn insert_assignment(
        &self,
        snapshot: &mut MemorySnapshot,
        assignment: AssignmentRecord,
    ) -> Result<(), StorageError> {
        let t = &mut snapshot.staged;
        if t.assignments.contains_key(&assignment.case_id) {
            return Err(StorageError::AlreadyAssigned {
                case_id: assignment.case_id,
            });
        }
        t.assignments.insert(assignment.case_id, assignment);
        Ok(())
    }

    async fn get_assignment_for_update(
        &self,
        snapshot: &mut MemorySnapshot,
        case_id: CaseId,
    ) -> Result<Option<AssignmentRecord>, StorageError> {
        Ok(snapshot.staged.assignments.get(&case_id).cloned())
    }

    async fn count_active_cases_for_agent(
        &self,
        snapshot: &mut MemorySnapshot,
        agent_id: UserId,
    ) -> Result<u64, StorageError> {
        let t = &snapshot.staged;
        let count = t
            .assignments
            .values()
            .filter(|a| a.agent_id == agent_id)
            .filter(|a| {
                t.cases
                    .get(&a.case_id)
                    .is_some_and(|c| c.status == CaseStatus::InProgress)
            })
            .count();
        Ok(count as u64)
    }

    async fn insert_question(
        &self,
        snapshot: &mut MemorySnapshot,
        question: NewQuestion,
    ) -> Result<QuestionRecord, StorageError> {
        let t = &mut snapshot.staged;
        t.last_question_id += 1;
        let record = QuestionRecord {
            id: t.last_question_id,
            category: question.category,
            prompt: question.prompt,
            answer_digest: question.answer_digest,
        };
        t.questions.insert(record.id, record.clone());
        Ok(record)
    }

    async fn insert_session(
        &self,
        snapshot: &mut MemorySnapshot,
        session: SessionRecord,
        question_ids: &[QuestionId],
    ) -> Result<(), StorageError> {
        let t = &mut snapshot.staged;
        if t.sessions.contains_key(&session.id) {
            return Err(StorageError::Duplicate {
                kind: "session",
                id: session.id,
            });
        }
        for qid in question_ids {
            if !t.questions.contains_key(qid) {
                return Err(StorageError::not_found("question", qid));
            }
        }
        t.slots.insert(session.id.clone(), question_ids.to_vec());
        t.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    async fn get_session_for_update(
        &self,
        snapshot: &mut MemorySnapshot,
        session_id: &str,
    ) -> Result<SessionRecord, StorageError> {
        snapshot.staged.session(session_id).cloned()
    }

    async fn update_session_progress(
        &self,
        snapshot: &mut MemorySnapshot,
        session_id: &str,
        expected_attempts: u32,
        new_attempts: u32,
        new_status: SessionStatus,
    ) -> Result<(), StorageError> {
        let session = snapshot
            .staged
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StorageError::not_found("session", session_id))?;
        if session.attempt_count != expected_attempts || session.status != SessionStatus::Pending
        {
            return Err(StorageError::conflict("session", session_id));
        }
        session.attempt_count = new_attempts;
        session.status = new_status;
        Ok(())
    }

    async fn insert_privilege(
        &self,
        snapshot: &mut MemorySnapshot,
        privilege: NewPrivilege,
    ) -> Result<PrivilegeRecord, StorageError> {
        let t = &mut snapshot.staged;
        if t.privileges.values().any(|p| p.token == privilege.token) {
            return Err(StorageError::Duplicate {
                kind: "privilege token",
                id: String::from("<redacted>"),
            });
        }
        t.last_privilege_id += 1;
        let record = PrivilegeRecord {
            id: t.last_privilege_id,
            grantee: privilege.grantee,
            case_id: privilege.case_id,
            action: privilege.action,
            token: privilege.token,
            granted_at: privilege.granted_at,
            expires_at: privilege.expires_at,
            used: false,
        };
        t.privileges.insert(record.id, record.clone());
        Ok(record)
    }

    async fn find_redeemable_privilege(
        &self,
        snapshot: &mut MemorySnapshot,
        grantee: Grantee,
        case_id: CaseId,
        action: ActionKind,
        now: OffsetDateTime,
    ) -> Result<Option<PrivilegeRecord>, StorageError> {
        Ok(snapshot
            .staged
            .privileges
            .values()
            .rev()
            .find(|p| {
                p.grantee == grantee
                    && p.case_id == case_id
                    && p.action == action
                    && p.is_redeemable(now)
            })
            .cloned())
    }

    async fn find_privilege_by_token(
        &self,
        snapshot: &mut MemorySnapshot,
        token: &str,
    ) -> Result<Option<PrivilegeRecord>, StorageError> {
        Ok(snapshot
            .staged
            .privileges
            .values()
            .find(|p| p.token == token)
            .cloned())
    }

    async fn mark_privilege_used(
        &self,
        snapshot: &mut MemorySnapshot,
        privilege_id: PrivilegeId,
    ) -> Result<(), StorageError> {
        let privilege = snapshot
            .staged
            .privileges
            .get_mut(&privilege_id)
            .ok_or_else(|| StorageError::not_found("privilege", privilege_id))?;
        if privilege.used {
            return Err(StorageError::conflict("privilege", privilege_id));
        }
        privilege.used = true;
        Ok(())
    }

    async fn get_user(&self, user_id: UserId) -> Result<UserRecord, StorageError> {
        self.tables.lock().await.user(user_id).cloned()
    }

    async fn get_case(&self, case_id: CaseId) -> Result<CaseRecord, StorageError> {
        self.tables.lock().await.case(case_id).cloned()
    }

    async fn list_cases(
        &self,
        status_filter: Option<CaseStatus>,
    ) -> Result<Vec<CaseRecord>, StorageError> {
        let t = self.tables.lock().await;
        Ok(t.cases
            .values()
            .filter(|c| status_filter.map_or(true, |s| c.status == s))
            .cloned()
            .collect())
    }

    async fn get_assignment(
        &self,
        case_id: CaseId,
    ) -> Result<Option<AssignmentRecord>, StorageError> {
        Ok(self.tables.lock().await.assignments.get(&case_id).cloned())
    }

    async fn list_questions(
        &self,
        category: QuestionCategory,
    ) -> Result<Vec<QuestionRecord>, StorageError> {
        let t = self.tables.lock().await;
        Ok(t.questions
            .values()
            .filter(|q| q.category == category)
            .cloned()
            .collect())
    }

    async fn get_session(&self, session_id: &str) -> Result<SessionRecord, StorageError> {
        self.tables.lock().await.session(session_id).cloned()
    }

    async fn session_questions(
        &self,
        session_id: &str,
    ) -> Result<Vec<QuestionRecord>, StorageError> {
        let t = self.tables.lock().await;
        let Some(ids) = t.slots.get(session_id) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| t.questions.get(id).cloned())
            .collect())
    }

    async fn count_sessions_since(
        &self,
        owner_id: UserId,
        since: OffsetDateTime,
    ) -> Result<u64, StorageError> {
        let t = self.tables.lock().await;
        let count = t
            .sessions
            .values()
            .filter(|s| s.owner_id == owner_id && s.created_at > since)
            .count();
        Ok(count as u64)
    }

    async fn list_privileges_for_case(
        &self,
        case_id: CaseId,
    ) -> Result<Vec<PrivilegeRecord>, StorageError> {
        let t = self.tables.lock().await;
        Ok(t.privileges
            .values()
            .filter(|p| p.case_id == case_id)
            .cloned()
            .collect())
    }

    async fn append_audit(&self, entry: NewAuditEntry) -> Result<AuditRecord, StorageError> {
        let mut log = self.audit.lock().await;
        let record = AuditRecord {
            id: log.len() as u64 + 1,
            case_id: entry.case_id,
            actor_ref: entry.actor_ref,
            actor_role: entry.actor_role,
            action: entry.action,
            result: entry.result,
            context: entry.context,
            timestamp: entry.timestamp,
        };
        log.push(record.clone());
        Ok(record)
    }

    async fn list_audit(&self, case_id: Option<CaseId>) -> Result<Vec<AuditRecord>, StorageError> {
        let log = self.audit.lock().await;
        let mut rows: Vec<AuditRecord> = log
            .iter()
            .filter(|r| case_id.map_or(true, |id| r.case_id == id))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[tokio::test]
    async fn dropped_snapshot_discards_staged_writes() {
        let storage = MemoryStorage::new();
        {
            let mut snap = storage.begin_snapshot().await.unwrap();
            storage
                .insert_case(&mut snap, 1, "lost", datetime!(2026-01-01 0:00 UTC))
                .await
                .unwrap();
        }
        assert!(storage.list_cases(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_snapshot_waits_for_first_to_finish() {
        let storage = MemoryStorage::new();
        let mut first = storage.begin_snapshot().await.unwrap();
        storage
            .insert_case(&mut first, 1, "first", datetime!(2026-01-01 0:00 UTC))
            .await
            .unwrap();

        let s = storage.clone();
        let waiter = tokio::spawn(async move {
            let mut snap = s.begin_snapshot().await.unwrap();
            let case = s.get_case_for_update(&mut snap, 1).await.unwrap();
            s.abort_snapshot(snap).await.unwrap();
            case.subject
        });

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        storage.commit_snapshot(first).await.unwrap();
        assert_eq!(waiter.await.unwrap(), "first");
    }
}
