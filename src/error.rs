//! Session-level errors surfaced to callers of the session controller.

use thiserror::Error;

use crate::stream::StreamError;
use crate::submission::SubmissionError;

/// Errors from [`SessionController`](crate::session::SessionController) operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("a session is already running ({session_id})")]
    AlreadyRunning { session_id: String },

    #[error("no session is running")]
    NotRunning,

    #[error("job submission failed: {0}")]
    Submission(#[from] SubmissionError),

    #[error("cannot build stream URL for session '{session_id}': {reason}")]
    InvalidStreamUrl { session_id: String, reason: String },

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("stream reconnect attempts exhausted for session '{session_id}'")]
    RetryExhausted { session_id: String },

    #[error("session '{session_id}' was closed before completing")]
    Closed { session_id: String },
}

impl SessionError {
    /// Whether this error came from caller misuse rather than the remote side
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            SessionError::AlreadyRunning { .. } | SessionError::NotRunning
        )
    }
}
