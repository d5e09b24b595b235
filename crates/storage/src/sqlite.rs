//! Relational backend on `SQLite`.
//!
//! One connection serves both snapshots and pool-level queries. Every
//! snapshot is a `BEGIN IMMEDIATE` transaction, which takes the database
//! write lock up front, so two processes sharing the file serialize their
//! claims, redemptions and session transitions in the database itself.
//! Conditional updates check the affected-row count on top of that.
//!
//! Statements that can wait on the file lock (`BEGIN IMMEDIATE`, `COMMIT`
//! and pool-level queries) run on tokio's blocking pool. Statements inside
//! an open snapshot already hold the write lock and run inline.
//!
//! Timestamps are stored as unix nanoseconds (`INTEGER`), enums as their
//! uppercase wire strings.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::StorageError;
use crate::record::{
    ActionKind, AssignmentRecord, AuditRecord, CaseId, CaseRecord, CaseStatus, Grantee,
    NewAuditEntry, NewPrivilege, NewQuestion, NewUser, PrivilegeId, PrivilegeRecord,
    QuestionCategory, QuestionId, QuestionRecord, SessionRecord, SessionStatus, UnknownVariant,
    UserId, UserRecord,
};
use crate::traits::GateStorage;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    email             TEXT NOT NULL UNIQUE,
    role              TEXT NOT NULL,
    risk_score        INTEGER NOT NULL DEFAULT 0,
    credential_digest TEXT NOT NULL,
    created_at        INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS cases (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id   INTEGER NOT NULL,
    subject    TEXT NOT NULL,
    status     TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cases_status ON cases(status);
CREATE TABLE IF NOT EXISTS case_assignments (
    case_id     INTEGER PRIMARY KEY,
    agent_id    INTEGER NOT NULL,
    assigned_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_assignments_agent ON case_assignments(agent_id);
CREATE TABLE IF NOT EXISTS challenge_questions (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    category      TEXT NOT NULL,
    prompt        TEXT NOT NULL,
    answer_digest TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS verification_sessions (
    id            TEXT PRIMARY KEY,
    case_id       INTEGER NOT NULL,
    owner_id      INTEGER NOT NULL,
    status        TEXT NOT NULL,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    expires_at    INTEGER NOT NULL,
    created_at    INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_owner_created
    ON verification_sessions(owner_id, created_at);
CREATE TABLE IF NOT EXISTS verification_slots (
    session_id  TEXT NOT NULL,
    question_id INTEGER NOT NULL,
    position    INTEGER NOT NULL,
    PRIMARY KEY (session_id, question_id)
);
CREATE TABLE IF NOT EXISTS temporary_privileges (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_id   INTEGER,
    case_id    INTEGER NOT NULL,
    action     TEXT NOT NULL,
    token      TEXT NOT NULL UNIQUE,
    granted_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    used       INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_privileges_lookup
    ON temporary_privileges(agent_id, case_id, action);
CREATE TABLE IF NOT EXISTS audit_logs (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    case_id    INTEGER NOT NULL,
    actor_ref  TEXT NOT NULL,
    actor_role TEXT NOT NULL,
    action     TEXT NOT NULL,
    result     TEXT NOT NULL,
    context    TEXT NOT NULL,
    timestamp  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_case ON audit_logs(case_id, timestamp);
CREATE TRIGGER IF NOT EXISTS audit_logs_no_update BEFORE UPDATE ON audit_logs
BEGIN
    SELECT RAISE(ABORT, 'audit_logs is append-only');
END;
CREATE TRIGGER IF NOT EXISTS audit_logs_no_delete BEFORE DELETE ON audit_logs
BEGIN
    SELECT RAISE(ABORT, 'audit_logs is append-only');
END;
";

const USER_COLUMNS: &str = "id, email, role, risk_score, credential_digest, created_at";
const CASE_COLUMNS: &str = "id, owner_id, subject, status, created_at, updated_at";
const SESSION_COLUMNS: &str =
    "id, case_id, owner_id, status, attempt_count, expires_at, created_at";
const QUESTION_COLUMNS: &str = "id, category, prompt, answer_digest";
const PRIVILEGE_COLUMNS: &str =
    "id, agent_id, case_id, action, token, granted_at, expires_at, used";
const AUDIT_COLUMNS: &str = "id, case_id, actor_ref, actor_role, action, result, context, timestamp";

/// A `GateStorage` backed by a single `SQLite` connection.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open (or create) a database file and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// A private in-memory database, mainly for tests.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Run pool-level work on the blocking thread pool; a busy database
    /// file then stalls that thread, not a runtime worker.
    async fn blocking<T, F>(&self, work: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = self.conn.clone().lock_owned().await;
        tokio::task::spawn_blocking(move || work(&*conn))
            .await
            .map_err(join_error)?
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

/// An open `BEGIN IMMEDIATE` transaction. Rolled back on drop unless committed.
pub struct SqliteSnapshot {
    conn: OwnedMutexGuard<Connection>,
    finished: bool,
}

impl Drop for SqliteSnapshot {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }
}

fn join_error(e: tokio::task::JoinError) -> StorageError {
    StorageError::Backend(format!("sqlite task failed: {e}"))
}

// ── Column helpers ───────────────────────────────────────────────────────────

fn nanos(t: OffsetDateTime) -> i64 {
    t.unix_timestamp_nanos() as i64
}

fn id_param(id: u64) -> i64 {
    id as i64
}

fn opt_id_param(id: Option<u64>) -> Option<i64> {
    id.map(id_param)
}

fn id_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(idx)?;
    Ok(value as u64)
}

fn opt_id_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<u64>> {
    let value: Option<i64> = row.get(idx)?;
    Ok(value.map(|v| v as u64))
}

fn time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<OffsetDateTime> {
    let value: i64 = row.get(idx)?;
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(value))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(e)))
}

fn enum_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = UnknownVariant>,
{
    let text: String = row.get(idx)?;
    text.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        id: id_col(row, 0)?,
        email: row.get(1)?,
        role: enum_col(row, 2)?,
        risk_score: row.get(3)?,
        credential_digest: row.get(4)?,
        created_at: time_col(row, 5)?,
    })
}

fn case_from_row(row: &Row<'_>) -> rusqlite::Result<CaseRecord> {
    Ok(CaseRecord {
        id: id_col(row, 0)?,
        owner_id: id_col(row, 1)?,
        subject: row.get(2)?,
        status: enum_col(row, 3)?,
        created_at: time_col(row, 4)?,
        updated_at: time_col(row, 5)?,
    })
}

fn assignment_from_row(row: &Row<'_>) -> rusqlite::Result<AssignmentRecord> {
    Ok(AssignmentRecord {
        case_id: id_col(row, 0)?,
        agent_id: id_col(row, 1)?,
        assigned_at: time_col(row, 2)?,
    })
}

fn question_from_row(row: &Row<'_>) -> rusqlite::Result<QuestionRecord> {
    Ok(QuestionRecord {
        id: id_col(row, 0)?,
        category: enum_col(row, 1)?,
        prompt: row.get(2)?,
        answer_digest: row.get(3)?,
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    Ok(SessionRecord {
        id: row.get(0)?,
        case_id: id_col(row, 1)?,
        owner_id: id_col(row, 2)?,
        status: enum_col(row, 3)?,
        attempt_count: row.get(4)?,
        expires_at: time_col(row, 5)?,
        created_at: time_col(row, 6)?,
    })
}

fn privilege_from_row(row: &Row<'_>) -> rusqlite::Result<PrivilegeRecord> {
    Ok(PrivilegeRecord {
        id: id_col(row, 0)?,
        grantee: Grantee::from_agent_column(opt_id_col(row, 1)?),
        case_id: id_col(row, 2)?,
        action: enum_col(row, 3)?,
        token: row.get(4)?,
        granted_at: time_col(row, 5)?,
        expires_at: time_col(row, 6)?,
        used: row.get(7)?,
    })
}

fn audit_from_row(row: &Row<'_>) -> rusqlite::Result<AuditRecord> {
    Ok(AuditRecord {
        id: id_col(row, 0)?,
        case_id: id_col(row, 1)?,
        actor_ref: row.get(2)?,
        actor_role: enum_col(row, 3)?,
        action: enum_col(row, 4)?,
        result: enum_col(row, 5)?,
        context: row.get(6)?,
        timestamp: time_col(row, 7)?,
    })
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

// ── Shared statements (used inside and outside snapshots) ────────────────────

fn select_user(conn: &Connection, user_id: UserId) -> Result<UserRecord, StorageError> {
    conn.query_row(
        &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
        params![id_param(user_id)],
        user_from_row,
    )
    .optional()?
    .ok_or_else(|| StorageError::not_found("user", user_id))
}

fn select_case(conn: &Connection, case_id: CaseId) -> Result<CaseRecord, StorageError> {
    conn.query_row(
        &format!("SELECT {CASE_COLUMNS} FROM cases WHERE id = ?1"),
        params![id_param(case_id)],
        case_from_row,
    )
    .optional()?
    .ok_or_else(|| StorageError::not_found("case", case_id))
}

fn select_assignment(
    conn: &Connection,
    case_id: CaseId,
) -> Result<Option<AssignmentRecord>, StorageError> {
    Ok(conn
        .query_row(
            "SELECT case_id, agent_id, assigned_at FROM case_assignments WHERE case_id = ?1",
            params![id_param(case_id)],
            assignment_from_row,
        )
        .optional()?)
}

fn select_session(conn: &Connection, session_id: &str) -> Result<SessionRecord, StorageError> {
    conn.query_row(
        &format!("SELECT {SESSION_COLUMNS} FROM verification_sessions WHERE id = ?1"),
        params![session_id],
        session_from_row,
    )
    .optional()?
    .ok_or_else(|| StorageError::not_found("session", session_id))
}

fn row_exists(conn: &Connection, sql: &str, key: rusqlite::types::Value) -> Result<bool, StorageError> {
    Ok(conn
        .query_row(sql, params![key], |_| Ok(()))
        .optional()?
        .is_some())
}

#[async_trait]
impl GateStorage for SqliteStorage {
    type Snapshot = SqliteSnapshot;

    async fn begin_snapshot(&self) -> Result<SqliteSnapshot, StorageError> {
        let conn = self.conn.clone().lock_owned().await;
        // Waiting for another process's write lock happens off the runtime.
        tokio::task::spawn_blocking(move || -> Result<SqliteSnapshot, StorageError> {
            conn.execute_batch("BEGIN IMMEDIATE")?;
            Ok(SqliteSnapshot {
                conn,
                finished: false,
            })
        })
        .await
        .map_err(join_error)?
    }

    async fn commit_snapshot(&self, mut snapshot: SqliteSnapshot) -> Result<(), StorageError> {
        tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
            snapshot.conn.execute_batch("COMMIT")?;
            snapshot.finished = true;
            Ok(())
        })
        .await
        .map_err(join_error)?
    }

    async fn abort_snapshot(&self, mut snapshot: SqliteSnapshot) -> Result<(), StorageError> {
        snapshot.finished = true;
        snapshot.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    async fn insert_user(
        &self,
        snapshot: &mut SqliteSnapshot,
        user: NewUser,
    ) -> Result<UserRecord, StorageError> {
        let conn = &snapshot.conn;
        match conn.execute(
            "INSERT INTO users (email, role, risk_score, credential_digest, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                user.email,
                user.role.as_str(),
                user.risk_score,
                user.credential_digest,
                nanos(user.created_at)
            ],
        ) {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => {
                return Err(StorageError::Duplicate {
                    kind: "user email",
                    id: user.email,
                })
            }
            Err(e) => return Err(e.into()),
        }
        Ok(UserRecord {
            id: conn.last_insert_rowid() as u64,
            email: user.email,
            role: user.role,
            risk_score: user.risk_score,
            credential_digest: user.credential_digest,
            created_at: user.created_at,
        })
    }

    async fn adjust_risk_score(
        &self,
        snapshot: &mut SqliteSnapshot,
        user_id: UserId,
        delta: i64,
    ) -> Result<i64, StorageError> {
        let conn = &snapshot.conn;
        let updated = conn.execute(
            "UPDATE users SET risk_score = risk_score + ?1 WHERE id = ?2",
            params![delta, id_param(user_id)],
        )?;
        if updated == 0 {
            return Err(StorageError::not_found("user", user_id));
        }
        Ok(select_user(conn, user_id)?.risk_score)
    }

    async fn set_credential_digest(
        &self,
        snapshot: &mut SqliteSnapshot,
        user_id: UserId,
        digest: &str,
    ) -> Result<(), StorageError> {
        let updated = snapshot.conn.execute(
            "UPDATE users SET credential_digest = ?1 WHERE id = ?2",
            params![digest, id_param(user_id)],
        )?;
        if updated == 0 {
            return Err(StorageError::not_found("user", user_id));
        }
        Ok(())
    }

    async fn insert_case(
        &self,
        snapshot: &mut SqliteSnapshot,
        owner_id: UserId,
        subject: &str,
        now: OffsetDateTime,
    ) -> Result<CaseRecord, StorageError> {
        let conn = &snapshot.conn;
        conn.execute(
            "INSERT INTO cases (owner_id, subject, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![
                id_param(owner_id),
                subject,
                CaseStatus::Open.as_str(),
                nanos(now)
            ],
        )?;
        Ok(CaseRecord {
            id: conn.last_insert_rowid() as u64,
            owner_id,
            subject: subject.to_string(),
            status: CaseStatus::Open,
            created_at: now,
            updated_at: now,
        })
    }

    async fn get_case_for_update(
        &self,
        snapshot: &mut SqliteSnapshot,
        case_id: CaseId,
    ) -> Result<CaseRecord, StorageError> {
        select_case(&snapshot.conn, case_id)
    }

    async fn update_case_status(
        &self,
        snapshot: &mut SqliteSnapshot,
        case_id: CaseId,
        expected: CaseStatus,
        new_status: CaseStatus,
        now: OffsetDateTime,
    ) -> Result<(), StorageError> {
        let conn = &snapshot.conn;
        let updated = conn.execute(
            "UPDATE cases SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
            params![
                new_status.as_str(),
                nanos(now),
                id_param(case_id),
                expected.as_str()
            ],
        )?;
        if updated == 0 {
            select_case(conn, case_id)?;
            return Err(StorageError::conflict("case", case_id));
        }
        Ok(())
    }

    async fn insert_assignment(
        &self,
        snapshot: &mut SqliteSnapshot,
        assignment: AssignmentRecord,
    ) -> Result<(), StorageError> {
        match snapshot.conn.execute(
            "INSERT INTO case_assignments (case_id, agent_id, assigned_at) VALUES (?1, ?2, ?3)",
            params![
                id_param(assignment.case_id),
                id_param(assignment.agent_id),
                nanos(assignment.assigned_at)
            ],
        ) {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => Err(StorageError::AlreadyAssigned {
                case_id: assignment.case_id,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_assignment_for_update(
        &self,
        snapshot: &mut SqliteSnapshot,
        case_id: CaseId,
    ) -> Result<Option<AssignmentRecord>, StorageError> {
        select_assignment(&snapshot.conn, case_id)
    }

    async fn count_active_cases_for_agent(
        &self,
        snapshot: &mut SqliteSnapshot,
        agent_id: UserId,
    ) -> Result<u64, StorageError> {
        let count: i64 = snapshot.conn.query_row(
            "SELECT COUNT(*) FROM case_assignments a
             JOIN cases c ON c.id = a.case_id
             WHERE a.agent_id = ?1 AND c.status = ?2",
            params![id_param(agent_id), CaseStatus::InProgress.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    async fn insert_question(
        &self,
        snapshot: &mut SqliteSnapshot,
        question: NewQuestion,
    ) -> Result<QuestionRecord, StorageError> {
        let conn = &snapshot.conn;
        conn.execute(
            "INSERT INTO challenge_questions (category, prompt, answer_digest) VALUES (?1, ?2, ?3)",
            params![
                question.category.as_str(),
                question.prompt,
                question.answer_digest
            ],
        )?;
        Ok(QuestionRecord {
            id: conn.last_insert_rowid() as u64,
            category: question.category,
            prompt: question.prompt,
            answer_digest: question.answer_digest,
        })
    }

    async fn insert_session(
        &self,
        snapshot: &mut SqliteSnapshot,
        session: SessionRecord,
        question_ids: &[QuestionId],
    ) -> Result<(), StorageError> {
        let conn = &snapshot.conn;
        for qid in question_ids {
            let exists = row_exists(
                conn,
                "SELECT 1 FROM challenge_questions WHERE id = ?1",
                rusqlite::types::Value::Integer(id_param(*qid)),
            )?;
            if !exists {
                return Err(StorageError::not_found("question", qid));
            }
        }
        match conn.execute(
            "INSERT INTO verification_sessions
                 (id, case_id, owner_id, status, attempt_count, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                session.id,
                id_param(session.case_id),
                id_param(session.owner_id),
                session.status.as_str(),
                session.attempt_count,
                nanos(session.expires_at),
                nanos(session.created_at)
            ],
        ) {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => {
                return Err(StorageError::Duplicate {
                    kind: "session",
                    id: session.id,
                })
            }
            Err(e) => return Err(e.into()),
        }
        for (position, qid) in question_ids.iter().enumerate() {
            conn.execute(
                "INSERT INTO verification_slots (session_id, question_id, position)
                 VALUES (?1, ?2, ?3)",
                params![session.id, id_param(*qid), position as i64],
            )?;
        }
        Ok(())
    }

    async fn get_session_for_update(
        &self,
        snapshot: &mut SqliteSnapshot,
        session_id: &str,
    ) -> Result<SessionRecord, StorageError> {
        select_session(&snapshot.conn, session_id)
    }

    async fn update_session_progress(
        &self,
        snapshot: &mut SqliteSnapshot,
        session_id: &str,
        expected_attempts: u32,
        new_attempts: u32,
        new_status: SessionStatus,
    ) -> Result<(), StorageError> {
        let conn = &snapshot.conn;
        let updated = conn.execute(
            "UPDATE verification_sessions SET attempt_count = ?1, status = ?2
             WHERE id = ?3 AND attempt_count = ?4 AND status = ?5",
            params![
                new_attempts,
                new_status.as_str(),
                session_id,
                expected_attempts,
                SessionStatus::Pending.as_str()
            ],
        )?;
        if updated == 0 {
            select_session(conn, session_id)?;
            return Err(StorageError::conflict("session", session_id));
        }
        Ok(())
    }

    async fn insert_privilege(
        &self,
        snapshot: &mut SqliteSnapshot,
        privilege: NewPrivilege,
    ) -> Result<PrivilegeRecord, StorageError> {
        let conn = &snapshot.conn;
        match conn.execute(
            "INSERT INTO temporary_privileges
                 (agent_id, case_id, action, token, granted_at, expires_at, used)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
            params![
                opt_id_param(privilege.grantee.agent_column()),
                id_param(privilege.case_id),
                privilege.action.as_str(),
                privilege.token,
                nanos(privilege.granted_at),
                nanos(privilege.expires_at)
            ],
        ) {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => {
                return Err(StorageError::Duplicate {
                    kind: "privilege token",
                    id: String::from("<redacted>"),
                })
            }
            Err(e) => return Err(e.into()),
        }
        Ok(PrivilegeRecord {
            id: conn.last_insert_rowid() as u64,
            grantee: privilege.grantee,
            case_id: privilege.case_id,
            action: privilege.action,
            token: privilege.token,
            granted_at: privilege.granted_at,
            expires_at: privilege.expires_at,
            used: false,
        })
    }

    async fn find_redeemable_privilege(
        &self,
        snapshot: &mut SqliteSnapshot,
        grantee: Grantee,
        case_id: CaseId,
        action: ActionKind,
        now: OffsetDateTime,
    ) -> Result<Option<PrivilegeRecord>, StorageError> {
        Ok(snapshot
            .conn
            .query_row(
                &format!(
                    "SELECT {PRIVILEGE_COLUMNS} FROM temporary_privileges
                     WHERE agent_id IS ?1 AND case_id = ?2 AND action = ?3
                       AND used = 0 AND expires_at > ?4
                     ORDER BY id DESC LIMIT 1"
                ),
                params![
                    opt_id_param(grantee.agent_column()),
                    id_param(case_id),
                    action.as_str(),
                    nanos(now)
                ],
                privilege_from_row,
            )
            .optional()?)
    }

    async fn find_privilege_by_token(
        &self,
        snapshot: &mut SqliteSnapshot,
        token: &str,
    ) -> Result<Option<PrivilegeRecord>, StorageError> {
        Ok(snapshot
            .conn
            .query_row(
                &format!("SELECT {PRIVILEGE_COLUMNS} FROM temporary_privileges WHERE token = ?1"),
                params![token],
                privilege_from_row,
            )
            .optional()?)
    }

    async fn mark_privilege_used(
        &self,
        snapshot: &mut SqliteSnapshot,
        privilege_id: PrivilegeId,
    ) -> Result<(), StorageError> {
        let conn = &snapshot.conn;
        let updated = conn.execute(
            "UPDATE temporary_privileges SET used = 1 WHERE id = ?1 AND used = 0",
            params![id_param(privilege_id)],
        )?;
        if updated == 0 {
            let exists = row_exists(
                conn,
                "SELECT 1 FROM temporary_privileges WHERE id = ?1",
                rusqlite::types::Value::Integer(id_param(privilege_id)),
            )?;
            if !exists {
                return Err(StorageError::not_found("privilege", privilege_id));
            }
            return Err(StorageError::conflict("privilege", privilege_id));
        }
        Ok(())
    }

    async fn get_user(&self, user_id: UserId) -> Result<UserRecord, StorageError> {
        self.blocking(move |conn| select_user(conn, user_id)).await
    }

    async fn get_case(&self, case_id: CaseId) -> Result<CaseRecord, StorageError> {
        self.blocking(move |conn| select_case(conn, case_id)).await
    }

    async fn list_cases(
        &self,
        status_filter: Option<CaseStatus>,
    ) -> Result<Vec<CaseRecord>, StorageError> {
        self.blocking(move |conn| {
            let rows = match status_filter {
                Some(status) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {CASE_COLUMNS} FROM cases WHERE status = ?1 ORDER BY id"
                    ))?;
                    let rows = stmt
                        .query_map(params![status.as_str()], case_from_row)?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                }
                None => {
                    let mut stmt =
                        conn.prepare(&format!("SELECT {CASE_COLUMNS} FROM cases ORDER BY id"))?;
                    let rows = stmt
                        .query_map([], case_from_row)?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                }
            };
            Ok(rows)
        })
        .await
    }

    async fn get_assignment(
        &self,
        case_id: CaseId,
    ) -> Result<Option<AssignmentRecord>, StorageError> {
        self.blocking(move |conn| select_assignment(conn, case_id)).await
    }

    async fn list_questions(
        &self,
        category: QuestionCategory,
    ) -> Result<Vec<QuestionRecord>, StorageError> {
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {QUESTION_COLUMNS} FROM challenge_questions WHERE category = ?1 ORDER BY id"
            ))?;
            let rows = stmt
                .query_map(params![category.as_str()], question_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn get_session(&self, session_id: &str) -> Result<SessionRecord, StorageError> {
        let session_id = session_id.to_string();
        self.blocking(move |conn| select_session(conn, &session_id)).await
    }

    async fn session_questions(
        &self,
        session_id: &str,
    ) -> Result<Vec<QuestionRecord>, StorageError> {
        let session_id = session_id.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT q.id, q.category, q.prompt, q.answer_digest
                 FROM verification_slots s
                 JOIN challenge_questions q ON q.id = s.question_id
                 WHERE s.session_id = ?1
                 ORDER BY s.position",
            )?;
            let rows = stmt
                .query_map(params![session_id], question_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn count_sessions_since(
        &self,
        owner_id: UserId,
        since: OffsetDateTime,
    ) -> Result<u64, StorageError> {
        self.blocking(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM verification_sessions WHERE owner_id = ?1 AND created_at > ?2",
                params![id_param(owner_id), nanos(since)],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
        .await
    }

    async fn list_privileges_for_case(
        &self,
        case_id: CaseId,
    ) -> Result<Vec<PrivilegeRecord>, StorageError> {
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PRIVILEGE_COLUMNS} FROM temporary_privileges WHERE case_id = ?1 ORDER BY id"
            ))?;
            let rows = stmt
                .query_map(params![id_param(case_id)], privilege_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn append_audit(&self, entry: NewAuditEntry) -> Result<AuditRecord, StorageError> {
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO audit_logs
                     (case_id, actor_ref, actor_role, action, result, context, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id_param(entry.case_id),
                    entry.actor_ref,
                    entry.actor_role.as_str(),
                    entry.action.as_str(),
                    entry.result.as_str(),
                    entry.context,
                    nanos(entry.timestamp)
                ],
            )?;
            Ok(AuditRecord {
                id: conn.last_insert_rowid() as u64,
                case_id: entry.case_id,
                actor_ref: entry.actor_ref,
                actor_role: entry.actor_role,
                action: entry.action,
                result: entry.result,
                context: entry.context,
                timestamp: entry.timestamp,
            })
        })
        .await
    }

    async fn list_audit(&self, case_id: Option<CaseId>) -> Result<Vec<AuditRecord>, StorageError> {
        self.blocking(move |conn| {
            let rows = match case_id {
                Some(id) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {AUDIT_COLUMNS} FROM audit_logs WHERE case_id = ?1
                         ORDER BY timestamp, id"
                    ))?;
                    let rows = stmt
                        .query_map(params![id_param(id)], audit_from_row)?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {AUDIT_COLUMNS} FROM audit_logs ORDER BY timestamp, id"
                    ))?;
                    let rows = stmt
                        .query_map([], audit_from_row)?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                }
            };
            Ok(rows)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{AuditAction, AuditResult, Role};
    use time::macros::datetime;

    #[tokio::test]
    async fn audit_rows_cannot_be_rewritten() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage
            .append_audit(NewAuditEntry {
                case_id: 1,
                actor_ref: "USER-1".to_string(),
                actor_role: Role::User,
                action: AuditAction::OpenCase,
                result: AuditResult::Success,
                context: String::new(),
                timestamp: datetime!(2026-01-01 0:00 UTC),
            })
            .await
            .unwrap();

        let conn = storage.conn.lock().await;
        assert!(conn
            .execute("UPDATE audit_logs SET result = 'DENIED'", [])
            .is_err());
        assert!(conn.execute("DELETE FROM audit_logs", []).is_err());
    }

    #[tokio::test]
    async fn waiting_for_the_file_lock_leaves_the_runtime_free() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gate.db");
        let holder = SqliteStorage::open(&path).unwrap();
        let waiter = SqliteStorage::open(&path).unwrap();

        let held = holder.begin_snapshot().await.unwrap();
        let waited =
            tokio::time::timeout(Duration::from_millis(200), waiter.begin_snapshot()).await;
        assert!(waited.is_err(), "lock wait ran on the runtime thread");
        drop(held);

        let snap = waiter.begin_snapshot().await.unwrap();
        waiter.abort_snapshot(snap).await.unwrap();
    }

    #[tokio::test]
    async fn reopening_a_file_keeps_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gate.db");
        {
            let storage = SqliteStorage::open(&path).unwrap();
            let mut snap = storage.begin_snapshot().await.unwrap();
            storage
                .insert_case(&mut snap, 3, "persisted", datetime!(2026-01-01 0:00 UTC))
                .await
                .unwrap();
            storage.commit_snapshot(snap).await.unwrap();
        }
        let storage = SqliteStorage::open(&path).unwrap();
        let case = storage.get_case(1).await.unwrap();
        assert_eq!(case.subject, "persisted");
        assert_eq!(case.status, CaseStatus::Open);
    }
}
