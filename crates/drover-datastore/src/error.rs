//! Datastore error types.

/// Unified error type for datastore implementations and the locker.
#[derive(Debug, thiserror::Error)]
pub enum DatastoreError {
    /// The referenced row does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A mutator observed a state that makes the requested transition
    /// illegal. Handlers treat this as "someone else got there first".
    #[error("conflict: {0}")]
    Conflict(String),

    /// A lock could not be acquired within the wait budget.
    #[error("lock on `{key}` is held elsewhere")]
    LockHeld { key: String },

    /// SQLite-level failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A stored row could not be (de)serialized.
    #[error("corrupt row: {0}")]
    Corrupt(#[from] serde_json::Error),

    /// A blocking task failed to join (mutex poisoned, panicked, ...).
    #[error("storage task failed: {0}")]
    TaskJoin(String),

    /// Catch-all for unexpected internal errors.
    #[error("internal datastore error: {0}")]
    Internal(String),
}

impl From<tokio::task::JoinError> for DatastoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        DatastoreError::TaskJoin(err.to_string())
    }
}

/// Convenience alias used throughout the datastore crate.
pub type Result<T> = std::result::Result<T, DatastoreError>;
