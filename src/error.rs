//! Error taxonomy for the upload pipeline and the remote service boundary.
//!
//! Domain layers return these typed errors; the binary and server startup
//! code wrap them in `anyhow` with context. The HTTP layer maps them into
//! the JSON error envelope (see [`crate::server`]).

use thiserror::Error;

/// Failure talking to the remote file-search service.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The service answered with a non-success HTTP status.
    #[error("remote API error {status}: {message}")]
    Status { status: u16, message: String },

    /// Connection, TLS, or client-side timeout failure.
    #[error("remote transport error: {0}")]
    Transport(String),

    /// The service answered 2xx but the body was not what we expected.
    #[error("invalid remote response: {0}")]
    Decode(String),

    /// Reading a staged file before sending it failed.
    #[error("failed to read staged file: {0}")]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::Status { status: 404, .. })
    }

    /// Whether a retry of the same idempotent request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Status { status, .. } => *status == 429 || *status >= 500,
            RemoteError::Transport(_) => true,
            RemoteError::Decode(_) | RemoteError::Io(_) => false,
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            RemoteError::Decode(err.to_string())
        } else {
            RemoteError::Transport(err.to_string())
        }
    }
}

/// Failure writing the durable state document.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("state write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("state serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Terminal outcome of waiting on a remote long-running operation.
#[derive(Debug, Error)]
pub enum WaitError {
    #[error("Operation timeout after {elapsed_secs}s ({polls} status checks)")]
    Timeout { elapsed_secs: u64, polls: u32 },

    #[error("Operation failed: {0}")]
    Failed(String),
}

/// Everything that can go wrong ingesting a batch or one file of it.
///
/// Only [`UploadError::Validation`] aborts a whole batch; the other variants
/// are captured into the failing file's result.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("{0}")]
    Validation(String),

    #[error("failed to stage file: {0}")]
    Staging(#[source] std::io::Error),

    #[error("remote upload failed: {0}")]
    RemoteCall(#[from] RemoteError),

    #[error(transparent)]
    Operation(#[from] WaitError),

    #[error("file uploaded but ledger write failed: {0}")]
    Persistence(#[from] PersistenceError),
}

/// Failure serving a chat request.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}
