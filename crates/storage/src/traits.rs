use async_trait::async_trait;
use time::OffsetDateTime;

use crate::error::StorageError;
use crate::record::{
    ActionKind, AssignmentRecord, AuditRecord, CaseId, CaseRecord, CaseStatus, Grantee,
    NewAuditEntry, NewPrivilege, NewQuestion, NewUser, PrivilegeId, PrivilegeRecord,
    QuestionCategory, QuestionId, QuestionRecord, SessionRecord, SessionStatus, UserId,
    UserRecord,
};

/// The storage capability injected into every jitgate component.
///
/// A `GateStorage` implementation provides durable, transactional storage
/// for users, cases, assignments, challenge questions, verification
/// sessions, temporary privileges and the audit log.
///
/// ## Snapshot Semantics
///
/// All mutating operations take `&mut Self::Snapshot`, a type representing an
/// in-progress transaction (unit of work). The lifecycle is:
///
/// 1. `begin_snapshot()` — start a transaction, returns a `Snapshot`
/// 2. Call mutating / locking methods with `&mut snapshot`
/// 3. `commit_snapshot(snapshot)` — commit and consume the transaction
///    OR `abort_snapshot(snapshot)` — roll back and consume the transaction
///
/// If a `Snapshot` is dropped without committing, the underlying transaction
/// MUST be rolled back.
///
/// Snapshots must be serializable with respect to each other: a row read
/// through a `*_for_update` method cannot change underneath the holder.
/// Backends may achieve this by serializing snapshots outright, so callers
/// must not issue pool-level queries or audit appends while holding one.
///
/// ## Conditional updates
///
/// `update_case_status`, `update_session_progress` and `mark_privilege_used`
/// are compare-and-set writes (`UPDATE ... WHERE <expected>`). If zero rows
/// are affected they return `Err(StorageError::ConcurrentConflict { .. })`.
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync + 'static` to be shared through
/// axum application state and across async task boundaries.
#[async_trait]
pub trait GateStorage: Send + Sync + 'static {
    /// The snapshot (transaction) type used by this storage backend.
    type Snapshot: Send;

    // ── Snapshot lifecycle ────────────────────────────────────────────────────

    async fn begin_snapshot(&self) -> Result<Self::Snapshot, StorageError>;

    async fn commit_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    async fn abort_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    // ── Users (within snapshot) ───────────────────────────────────────────────

    /// Returns `Err(StorageError::Duplicate)` if the email is taken.
    async fn insert_user(
        &self,
        snapshot: &mut Self::Snapshot,
        user: NewUser,
    ) -> Result<UserRecord, StorageError>;

    /// Add `delta` to the user's risk score and return the new score.
    async fn adjust_risk_score(
        &self,
        snapshot: &mut Self::Snapshot,
        user_id: UserId,
        delta: i64,
    ) -> Result<i64, StorageError>;

    async fn set_credential_digest(
        &self,
        snapshot: &mut Self::Snapshot,
        user_id: UserId,
        digest: &str,
    ) -> Result<(), StorageError>;

    // ── Cases and assignments (within snapshot) ───────────────────────────────

    /// Insert a new case in status OPEN.
    async fn insert_case(
        &self,
        snapshot: &mut Self::Snapshot,
        owner_id: UserId,
        subject: &str,
        now: OffsetDateTime,
    ) -> Result<CaseRecord, StorageError>;

    /// Read a case, locking the row until the snapshot ends.
    ///
    /// Returns `Err(StorageError::NotFound)` if the case does not exist.
    async fn get_case_for_update(
        &self,
        snapshot: &mut Self::Snapshot,
        case_id: CaseId,
    ) -> Result<CaseRecord, StorageError>;

    /// Compare-and-set the case status: applies only while the stored status
    /// is still `expected`.
    async fn update_case_status(
        &self,
        snapshot: &mut Self::Snapshot,
        case_id: CaseId,
        expected: CaseStatus,
        new_status: CaseStatus,
        now: OffsetDateTime,
    ) -> Result<(), StorageError>;

    /// Returns `Err(StorageError::AlreadyAssigned)` if the case already has one.
    async fn insert_assignment(
        &self,
        snapshot: &mut Self::Snapshot,
        assignment: AssignmentRecord,
    ) -> Result<(), StorageError>;

    async fn get_assignment_for_update(
        &self,
        snapshot: &mut Self::Snapshot,
        case_id: CaseId,
    ) -> Result<Option<AssignmentRecord>, StorageError>;

    /// Number of cases assigned to `agent_id` whose status is IN_PROGRESS.
    async fn count_active_cases_for_agent(
        &self,
        snapshot: &mut Self::Snapshot,
        agent_id: UserId,
    ) -> Result<u64, StorageError>;

    // ── Questions and sessions (within snapshot) ──────────────────────────────

    async fn insert_question(
        &self,
        snapshot: &mut Self::Snapshot,
        question: NewQuestion,
    ) -> Result<QuestionRecord, StorageError>;

    /// Insert a session together with its bound question slots, in order.
    async fn insert_session(
        &self,
        snapshot: &mut Self::Snapshot,
        session: SessionRecord,
        question_ids: &[QuestionId],
    ) -> Result<(), StorageError>;

    async fn get_session_for_update(
        &self,
        snapshot: &mut Self::Snapshot,
        session_id: &str,
    ) -> Result<SessionRecord, StorageError>;

    /// Compare-and-set the attempt counter and status together: applies only
    /// while the stored attempt counter equals `expected_attempts` and the
    /// stored status is PENDING.
    async fn update_session_progress(
        &self,
        snapshot: &mut Self::Snapshot,
        session_id: &str,
        expected_attempts: u32,
        new_attempts: u32,
        new_status: SessionStatus,
    ) -> Result<(), StorageError>;

    // ── Privileges (within snapshot) ──────────────────────────────────────────

    async fn insert_privilege(
        &self,
        snapshot: &mut Self::Snapshot,
        privilege: NewPrivilege,
    ) -> Result<PrivilegeRecord, StorageError>;

    /// Find the most recently granted privilege matching grantee, case and
    /// action that is unused and unexpired at `now`, locking it.
    async fn find_redeemable_privilege(
        &self,
        snapshot: &mut Self::Snapshot,
        grantee: Grantee,
        case_id: CaseId,
        action: ActionKind,
        now: OffsetDateTime,
    ) -> Result<Option<PrivilegeRecord>, StorageError>;

    /// Find a privilege by its redemption token, regardless of state.
    async fn find_privilege_by_token(
        &self,
        snapshot: &mut Self::Snapshot,
        token: &str,
    ) -> Result<Option<PrivilegeRecord>, StorageError>;

    /// Flip `used` false→true. `ConcurrentConflict` if it was already used.
    async fn mark_privilege_used(
        &self,
        snapshot: &mut Self::Snapshot,
        privilege_id: PrivilegeId,
    ) -> Result<(), StorageError>;

    // ── Query operations (outside snapshot) ───────────────────────────────────

    async fn get_user(&self, user_id: UserId) -> Result<UserRecord, StorageError>;

    async fn get_case(&self, case_id: CaseId) -> Result<CaseRecord, StorageError>;

    /// List cases ordered by id, optionally filtered by status.
    async fn list_cases(
        &self,
        status_filter: Option<CaseStatus>,
    ) -> Result<Vec<CaseRecord>, StorageError>;

    async fn get_assignment(
        &self,
        case_id: CaseId,
    ) -> Result<Option<AssignmentRecord>, StorageError>;

    /// All questions of one category, ordered by id.
    async fn list_questions(
        &self,
        category: QuestionCategory,
    ) -> Result<Vec<QuestionRecord>, StorageError>;

    async fn get_session(&self, session_id: &str) -> Result<SessionRecord, StorageError>;

    /// The questions bound to a session, in slot order.
    async fn session_questions(
        &self,
        session_id: &str,
    ) -> Result<Vec<QuestionRecord>, StorageError>;

    /// Number of sessions created for `owner_id` strictly after `since`.
    async fn count_sessions_since(
        &self,
        owner_id: UserId,
        since: OffsetDateTime,
    ) -> Result<u64, StorageError>;

    async fn list_privileges_for_case(
        &self,
        case_id: CaseId,
    ) -> Result<Vec<PrivilegeRecord>, StorageError>;

    // ── Audit log (append-only, outside snapshot) ─────────────────────────────

    /// Append one audit row in its own durable write.
    async fn append_audit(&self, entry: NewAuditEntry) -> Result<AuditRecord, StorageError>;

    /// Audit rows ordered by timestamp then id, optionally for one case.
    async fn list_audit(&self, case_id: Option<CaseId>) -> Result<Vec<AuditRecord>, StorageError>;
}
