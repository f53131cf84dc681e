//! Error types shared across the runtime, plus the wire-level error codes the
//! worker WebSocket channel reports to clients.

use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("pty unavailable: {0}")]
    PtyUnavailable(String),
    #[error("failed to spawn pty child: {0}")]
    PtySpawn(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("job queue unavailable")]
    JobQueueUnavailable,
    #[error("git: {0}")]
    Git(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("not found: {0}")]
    NotFound(String),
}

/// Machine-readable codes surfaced on the worker WebSocket before closing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    WorkerNotFound,
    PathNotFound,
    ActivationFailed,
    HistoryLoadFailed,
    JobQueueUnavailable,
    PtyUnavailable,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::WorkerNotFound => "WORKER_NOT_FOUND",
            ErrorCode::PathNotFound => "PATH_NOT_FOUND",
            ErrorCode::ActivationFailed => "ACTIVATION_FAILED",
            ErrorCode::HistoryLoadFailed => "HISTORY_LOAD_FAILED",
            ErrorCode::JobQueueUnavailable => "JOB_QUEUE_UNAVAILABLE",
            ErrorCode::PtyUnavailable => "PTY_UNAVAILABLE",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
