/// All errors that can be returned by a GateStorage implementation.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// No row of the given kind exists with the given key.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A conditional update matched zero rows: the row was changed by
    /// another transaction after it was read (status, attempt counter or
    /// used flag no longer holds the expected value).
    #[error("concurrent conflict on {kind} {id}")]
    ConcurrentConflict { kind: &'static str, id: String },

    /// The case already carries an assignment row.
    #[error("case {case_id} is already assigned")]
    AlreadyAssigned { case_id: u64 },

    /// A unique key (email, session id, token) is already taken.
    #[error("duplicate {kind}: {id}")]
    Duplicate { kind: &'static str, id: String },

    /// A backend-specific storage error (DB connection, serialization, etc.).
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        StorageError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub(crate) fn conflict(kind: &'static str, id: impl ToString) -> Self {
        StorageError::ConcurrentConflict {
            kind,
            id: id.to_string(),
        }
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Backend(e.to_string())
    }
}
