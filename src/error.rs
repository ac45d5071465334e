//! Error types for the synchronization core.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the sync core and its remote collaborators.
///
/// The type is `Clone` so a single in-flight profile lookup can hand the same
/// failure to every caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Network or remote failure; recoverable by retry or refetch
    #[error("Transport error: {0}")]
    Transport(String),

    /// Edit or delete attempted by someone other than the author
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Target id or user does not exist (or no longer exists)
    #[error("Not found: {0}")]
    NotFound(String),

    /// The change feed dropped
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// A local send is still waiting for its confirmation
    #[error("A message is already being sent")]
    SendInFlight,

    /// Message body was empty after trimming
    #[error("Message body is empty")]
    EmptyBody,

    /// No provisional message carries this local id
    #[error("Unknown local id: {0}")]
    UnknownLocalId(String),

    /// The conversation view has been shut down
    #[error("Conversation view is closed")]
    ViewClosed,
}

/// Fieldless projection of [`SyncError`], handed to `fail_optimistic` and
/// carried by failed provisional messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Transport,
    Unauthorized,
    NotFound,
    ConnectionLost,
    Rejected,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Transport(_) => ErrorKind::Transport,
            SyncError::Unauthorized(_) => ErrorKind::Unauthorized,
            SyncError::NotFound(_) => ErrorKind::NotFound,
            SyncError::ConnectionLost(_) => ErrorKind::ConnectionLost,
            SyncError::SendInFlight
            | SyncError::EmptyBody
            | SyncError::UnknownLocalId(_)
            | SyncError::ViewClosed => ErrorKind::Rejected,
        }
    }

    /// Whether retrying (or refetching) can make the operation succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Transport(_) | SyncError::ConnectionLost(_)
        )
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => SyncError::NotFound("row not found".to_string()),
            other => SyncError::Transport(other.to_string()),
        }
    }
}

/// Result type alias using SyncError.
pub type SyncResult<T> = Result<T, SyncError>;
