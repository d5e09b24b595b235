use std::fmt;

use jitgate_storage::StorageError;

/// Which business rule refused the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyReason {
    /// The agent already holds an IN_PROGRESS case.
    ActiveLimit,
    /// The case owner's risk score is at or above the threshold.
    HighRisk,
    /// Too many verification sessions for the owner in the trailing day.
    RateLimited,
}

impl PolicyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyReason::ActiveLimit => "active-limit",
            PolicyReason::HighRisk => "high-risk",
            PolicyReason::RateLimited => "rate-limited",
        }
    }
}

impl fmt::Display for PolicyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    AlreadyClaimed,
    AlreadyClosed,
}

impl ConflictReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictReason::AlreadyClaimed => "already-claimed",
            ConflictReason::AlreadyClosed => "already-closed",
        }
    }
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every outcome an engine operation can refuse with.
///
/// Messages are deliberately generic. The specific cause of an
/// `InvalidSession` or `AccessDenied` only ever reaches the audit log.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("denied: {0}")]
    PolicyViolation(PolicyReason),

    /// Lost a race or the row already moved on; the caller may retry
    /// against fresh data.
    #[error("conflict: {0}")]
    Conflict(ConflictReason),

    #[error("invalid or expired verification session")]
    InvalidSession,

    #[error("access denied")]
    AccessDenied,

    /// The actor's role or relationship to the case does not allow this.
    #[error("not authorized for this case")]
    Unauthorized,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Data or configuration inconsistency, not attacker behaviour.
    #[error("system error: {0}")]
    System(String),
}

impl From<StorageError> for GateError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound { kind, .. } => GateError::NotFound(kind),
            other => GateError::System(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_message_names_only_the_category() {
        let err = GateError::PolicyViolation(PolicyReason::HighRisk);
        assert_eq!(err.to_string(), "denied: high-risk");
    }

    #[test]
    fn storage_not_found_keeps_its_kind() {
        let err: GateError = StorageError::NotFound {
            kind: "case",
            id: "9".to_string(),
        }
        .into();
        assert!(matches!(err, GateError::NotFound("case")));
    }

    #[test]
    fn backend_faults_become_system_errors() {
        let err: GateError = StorageError::Backend("disk full".to_string()).into();
        assert!(matches!(err, GateError::System(msg) if msg.contains("disk full")));
    }
}
