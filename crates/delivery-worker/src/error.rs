//! Error types for the delivery worker.

use thiserror::Error;

/// Delivery worker error type.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Outbox could not be opened or written
    #[error("Outbox error: {0}")]
    Outbox(#[from] disk_outbox::OutboxError),

    /// The worker was shut down
    #[error("Delivery worker is shut down")]
    ShutDown,

    /// `start` was called twice
    #[error("Delivery worker already started")]
    AlreadyStarted,

    /// An operation needs the worker to be running
    #[error("Delivery worker not started")]
    NotStarted,

    /// No Tokio runtime to run on
    #[error("Runtime error: {0}")]
    Runtime(#[from] tokio::runtime::TryCurrentError),

    /// A blocking job panicked or was cancelled
    #[error("Join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Result type for delivery worker operations.
pub type WorkerResult<T> = Result<T, WorkerError>;
