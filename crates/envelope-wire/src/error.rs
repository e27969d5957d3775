//! Error types for the envelope codec.

use thiserror::Error;

/// Reasons a byte buffer could not be decoded into an envelope.
///
/// Decode errors are permanent: the same bytes will never decode later, so
/// callers holding a queued file should drop it rather than retry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The buffer contained no bytes at all.
    #[error("Envelope input is empty")]
    EmptyInput,

    /// The header line was not terminated by a line break.
    #[error("Envelope header is not terminated by a line break")]
    MissingHeaderDelimiter,

    /// The header line was not a valid JSON header record.
    #[error("Malformed envelope header: {0}")]
    MalformedHeader(String),

    /// The header lacks a field the caller required.
    #[error("Envelope header is missing required field `{0}`")]
    MissingRequiredField(&'static str),

    /// An item header was absent, unterminated, or invalid.
    #[error("Malformed header for item {index}: {reason}")]
    MalformedItemHeader {
        /// Zero-based item position.
        index: usize,
        /// What was wrong with it.
        reason: String,
    },

    /// An item declared more payload bytes than the buffer holds.
    #[error(
        "Item {index} declares {declared} payload bytes but only {available} are available ({missing} missing)"
    )]
    TruncatedPayload {
        /// Zero-based item position.
        index: usize,
        /// Length from the item header.
        declared: u64,
        /// Bytes left in the buffer after the item header.
        available: u64,
        /// `declared - available`.
        missing: u64,
    },
}

/// Envelope wire error type.
#[derive(Error, Debug)]
pub enum WireError {
    /// Decoding failed
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// JSON serialization error while encoding a header
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An item header length disagrees with its payload
    #[error("Item length mismatch: header declares {declared} bytes, payload has {actual}")]
    LengthMismatch {
        /// Length from the supplied header.
        declared: u64,
        /// Actual payload length.
        actual: u64,
    },
}

/// Result type for envelope wire operations.
pub type WireResult<T> = Result<T, WireError>;
