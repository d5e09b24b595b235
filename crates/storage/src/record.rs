use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub type UserId = u64;
pub type CaseId = u64;
pub type QuestionId = u64;
pub type PrivilegeId = u64;

/// Error returned when parsing a stored enum column that holds an unknown value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Implements `as_str`, `Display` and `FromStr` for a closed enum whose
/// stored/wire representation is a fixed uppercase string.
macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// Who is acting. Supplied by the identity service for every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "USER")]
    User,
    /// Customer-service agent.
    #[serde(rename = "CS")]
    Agent,
    #[serde(rename = "AUDITOR")]
    Auditor,
}

string_enum!(Role, "role", {
    User => "USER",
    Agent => "CS",
    Auditor => "AUDITOR",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaseStatus {
    Open,
    InProgress,
    Closed,
    Locked,
}

string_enum!(CaseStatus, "case status", {
    Open => "OPEN",
    InProgress => "IN_PROGRESS",
    Closed => "CLOSED",
    Locked => "LOCKED",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Pending,
    Passed,
    Failed,
    /// Never written by the engine; derived at read time once `expires_at` has passed.
    Expired,
}

string_enum!(SessionStatus, "session status", {
    Pending => "PENDING",
    Passed => "PASSED",
    Failed => "FAILED",
    Expired => "EXPIRED",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuestionCategory {
    Static,
    History,
    Usage,
}

impl QuestionCategory {
    /// Every category a session must cover, in presentation order.
    pub const ALL: [QuestionCategory; 3] = [
        QuestionCategory::Static,
        QuestionCategory::History,
        QuestionCategory::Usage,
    ];
}

string_enum!(QuestionCategory, "question category", {
    Static => "STATIC",
    History => "HISTORY",
    Usage => "USAGE",
});

/// The sensitive action a temporary privilege authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    SendResetLink,
    ResetPassword,
}

string_enum!(ActionKind, "action kind", {
    SendResetLink => "SEND_RESET_LINK",
    ResetPassword => "RESET_PASSWORD",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditResult {
    Success,
    Denied,
    Failed,
    Passed,
}

string_enum!(AuditResult, "audit result", {
    Success => "SUCCESS",
    Denied => "DENIED",
    Failed => "FAILED",
    Passed => "PASSED",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    OpenCase,
    ClaimCase,
    CloseCase,
    StartVerification,
    GetChallenge,
    VerificationAttempt,
    VerificationSuccess,
    SendResetLink,
    ResetPassword,
    CompleteReset,
}

string_enum!(AuditAction, "audit action", {
    OpenCase => "OPEN_CASE",
    ClaimCase => "CLAIM_CASE",
    CloseCase => "CLOSE_CASE",
    StartVerification => "START_VERIFICATION",
    GetChallenge => "GET_CHALLENGE",
    VerificationAttempt => "VERIFICATION_ATTEMPT",
    VerificationSuccess => "VERIFICATION_SUCCESS",
    SendResetLink => "SEND_RESET_LINK",
    ResetPassword => "RESET_PASSWORD",
    CompleteReset => "COMPLETE_RESET",
});

impl From<ActionKind> for AuditAction {
    fn from(kind: ActionKind) -> Self {
        match kind {
            ActionKind::SendResetLink => AuditAction::SendResetLink,
            ActionKind::ResetPassword => AuditAction::ResetPassword,
        }
    }
}

// ── Rows ─────────────────────────────────────────────────────────────────────

/// An account known to the identity service. Only the fields the engine
/// consumes (role, risk score, credential digest) are modelled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub email: String,
    pub role: Role,
    pub risk_score: i64,
    #[serde(skip_serializing, default)]
    pub credential_digest: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub role: Role,
    pub risk_score: i64,
    pub credential_digest: String,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseRecord {
    pub id: CaseId,
    pub owner_id: UserId,
    pub subject: String,
    pub status: CaseStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Exclusivity witness for a claimed case. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentRecord {
    pub case_id: CaseId,
    pub agent_id: UserId,
    #[serde(with = "time::serde::rfc3339")]
    pub assigned_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionRecord {
    pub id: QuestionId,
    pub category: QuestionCategory,
    pub prompt: String,
    /// Salted answer digest. Never serialized.
    #[serde(skip_serializing, default)]
    pub answer_digest: String,
}

#[derive(Debug, Clone)]
pub struct NewQuestion {
    pub category: QuestionCategory,
    pub prompt: String,
    pub answer_digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Opaque unguessable token; doubles as the verification URL path segment.
    pub id: String,
    pub case_id: CaseId,
    pub owner_id: UserId,
    /// Stored status. Use [`SessionRecord::effective_status`] for decisions.
    pub status: SessionStatus,
    pub attempt_count: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl SessionRecord {
    /// Status as observed at `now`: a PENDING session past its expiry reads
    /// as EXPIRED without any write.
    pub fn effective_status(&self, now: OffsetDateTime) -> SessionStatus {
        match self.status {
            SessionStatus::Pending if now > self.expires_at => SessionStatus::Expired,
            other => other,
        }
    }

    /// Whether a challenge may still be fetched or answered at `now`.
    pub fn is_answerable(&self, now: OffsetDateTime) -> bool {
        self.effective_status(now) == SessionStatus::Pending
    }
}

/// Who may redeem a privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "agent_id", rename_all = "snake_case")]
pub enum Grantee {
    /// Bound to one support agent.
    Agent(UserId),
    /// Bound to the case owner, redeemable only through its token.
    Owner,
}

impl Grantee {
    /// Column value for relational backends. Owner-bound grants have no
    /// agent, so no agent id can ever match them.
    pub fn agent_column(&self) -> Option<UserId> {
        match self {
            Grantee::Agent(id) => Some(*id),
            Grantee::Owner => None,
        }
    }

    pub fn from_agent_column(value: Option<UserId>) -> Self {
        match value {
            Some(id) => Grantee::Agent(id),
            None => Grantee::Owner,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivilegeRecord {
    pub id: PrivilegeId,
    pub grantee: Grantee,
    pub case_id: CaseId,
    pub action: ActionKind,
    #[serde(skip_serializing, default)]
    pub token: String,
    #[serde(with = "time::serde::rfc3339")]
    pub granted_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub used: bool,
}

impl PrivilegeRecord {
    pub fn is_redeemable(&self, now: OffsetDateTime) -> bool {
        !self.used && self.expires_at > now
    }
}

#[derive(Debug, Clone)]
pub struct NewPrivilege {
    pub grantee: Grantee,
    pub case_id: CaseId,
    pub action: ActionKind,
    pub token: String,
    pub granted_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

/// An immutable audit row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: u64,
    pub case_id: CaseId,
    /// `USER-<id>` / `AUDITOR-<id>` for non-agents, an HMAC pseudonym for agents.
    pub actor_ref: String,
    pub actor_role: Role,
    pub action: AuditAction,
    pub result: AuditResult,
    pub context: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub case_id: CaseId,
    pub actor_ref: String,
    pub actor_role: Role,
    pub action: AuditAction,
    pub result: AuditResult,
    pub context: String,
    pub timestamp: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn role_uses_cs_on_the_wire() {
        assert_eq!(Role::Agent.as_str(), "CS");
        assert_eq!("CS".parse::<Role>().unwrap(), Role::Agent);
        assert_eq!(serde_json::to_string(&Role::Agent).unwrap(), "\"CS\"");
        assert!("ADMIN".parse::<Role>().is_err());
    }

    #[test]
    fn pending_session_reads_expired_after_deadline() {
        let session = SessionRecord {
            id: "s".to_string(),
            case_id: 1,
            owner_id: 2,
            status: SessionStatus::Pending,
            attempt_count: 0,
            expires_at: datetime!(2026-01-01 00:15 UTC),
            created_at: datetime!(2026-01-01 00:00 UTC),
        };
        assert!(session.is_answerable(datetime!(2026-01-01 00:15 UTC)));
        assert_eq!(
            session.effective_status(datetime!(2026-01-01 00:15:01 UTC)),
            SessionStatus::Expired
        );
    }

    #[test]
    fn terminal_session_keeps_its_status_after_expiry() {
        let session = SessionRecord {
            id: "s".to_string(),
            case_id: 1,
            owner_id: 2,
            status: SessionStatus::Failed,
            attempt_count: 3,
            expires_at: datetime!(2026-01-01 00:15 UTC),
            created_at: datetime!(2026-01-01 00:00 UTC),
        };
        assert_eq!(
            session.effective_status(datetime!(2026-01-02 00:00 UTC)),
            SessionStatus::Failed
        );
    }

    #[test]
    fn owner_grantee_maps_to_zero_sentinel() {
        assert_eq!(Grantee::Owner.agent_column(), None);
        assert_eq!(Grantee::from_agent_column(None), Grantee::Owner);
        assert_eq!(Grantee::from_agent_column(Some(0)), Grantee::Agent(0));
        assert_eq!(Grantee::from_agent_column(Some(7)), Grantee::Agent(7));
    }

    #[test]
    fn question_digest_is_never_serialized() {
        let q = QuestionRecord {
            id: 1,
            category: QuestionCategory::Static,
            prompt: "Last four digits of your ID?".to_string(),
            answer_digest: "sha256$c2FsdA$abcd".to_string(),
        };
        let json = serde_json::to_string(&q).unwrap();
        assert!(!json.contains("sha256"));
        assert!(!json.contains("answer_digest"));
    }
}
