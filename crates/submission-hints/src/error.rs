//! Error types for submission handles.

use thiserror::Error;

/// Submission handle error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HintError {
    /// Reset attempted while a waiter is still parked on the handle
    #[error("Handle has {waiters} waiter(s) parked; reset is only legal between uses")]
    HandleBusy { waiters: usize },

    /// Signal issued for an earlier use of a reset handle
    #[error("Signal for generation {signal} ignored; handle is at generation {current}")]
    StaleSignal { signal: u64, current: u64 },
}

/// Result type for submission handle operations.
pub type HintResult<T> = Result<T, HintError>;
