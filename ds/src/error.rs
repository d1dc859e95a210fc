//! Store error types

use thiserror::Error;

use crate::records::TaskStatus;

/// Errors that can occur during store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("approval {0} already resolved")]
    AlreadyResolved(String),

    #[error("bad input: {0}")]
    BadInput(String),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// True when the error is a stale-state conflict rather than a hard failure.
    ///
    /// Racing writers treat these as a no-op: the other side already won.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_) | StoreError::InvalidTransition { .. })
    }
}
