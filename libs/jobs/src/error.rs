//! Repository error type.

use thiserror::Error;

/// Errors returned by job and organization repositories.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// Store unreachable or timed out. Worth retrying.
    #[error("repository unavailable: {0}")]
    Unavailable(String),

    /// The requested transition is not allowed from the current state, or
    /// the caller no longer holds the execution's claim.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The referenced job does not exist in the organization.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RepositoryError {
    /// Returns true if the same call may succeed when retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, RepositoryError::Unavailable(_))
    }
}
