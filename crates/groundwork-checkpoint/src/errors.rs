//! Checkpoint persistence error types.

/// Errors produced while persisting checkpoints to the coordination
/// service.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Transport-level HTTP failure (connect, timeout, body read).
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The service rejected a request. Hash-mismatch rejections of delta
    /// checkpoints surface here.
    #[error("service returned {status}: {message}")]
    Api {
        status: u16,
        message: String,
    },

    /// Snapshot serialization failure.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Compressing a request body failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The token source could not produce a bearer token.
    #[error("token source error: {0}")]
    Token(#[source] anyhow::Error),

    /// Reading live resource state failed (poisoned lock).
    #[error("snapshot state error: {0}")]
    State(#[source] anyhow::Error),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, CheckpointError>;
