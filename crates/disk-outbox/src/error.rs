//! Outbox error types.

use std::path::PathBuf;
use thiserror::Error;

/// Outbox error type.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Filesystem error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Queue file could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] envelope_wire::DecodeError),

    /// Envelope could not be encoded
    #[error("Wire error: {0}")]
    Wire(#[from] envelope_wire::WireError),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Marker name would escape the directory or collide with queue files
    #[error("Invalid marker name: {0:?}")]
    InvalidMarkerName(String),

    /// Queue directory unusable
    #[error("Invalid queue directory {}: {reason}", path.display())]
    InvalidDirectory { path: PathBuf, reason: String },

    /// Another delivery owns the queue file
    #[error("Queue file already claimed: {0}")]
    AlreadyClaimed(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias using OutboxError.
pub type OutboxResult<T> = Result<T, OutboxError>;
