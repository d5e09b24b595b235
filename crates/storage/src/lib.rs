pub mod conformance;
mod error;
mod memory;
mod record;
mod sqlite;
mod traits;

pub use error::StorageError;
pub use memory::{MemorySnapshot, MemoryStorage};
pub use record::{
    ActionKind, AssignmentRecord, AuditAction, AuditRecord, AuditResult, CaseId, CaseRecord,
    CaseStatus, Grantee, NewAuditEntry, NewPrivilege, NewQuestion, NewUser, PrivilegeId,
    PrivilegeRecord, QuestionCategory, QuestionId, QuestionRecord, Role, SessionRecord,
    SessionStatus, UnknownVariant, UserId, UserRecord,
};
pub use sqlite::{SqliteSnapshot, SqliteStorage};
pub use traits::GateStorage;
