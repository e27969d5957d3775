//! Crash-safe on-disk outbox for diagnostic envelopes.
//!
//! Envelopes are written to disk before any network attempt and replayed
//! later, so a crash or hang never loses what was already produced.
//!
//! # Core Invariants
//!
//! 1. **All or Nothing**: Queue files are written to a hidden temp name,
//!    fsynced, then renamed. A crash mid-write leaves nothing a scan can see.
//! 2. **Creation Order**: File names are monotonic ULIDs; replay visits the
//!    oldest file first.
//! 3. **Bounded Backlog**: Past `max_entries`, the oldest files are evicted.
//!    Evictions are logged, never reported as errors.
//! 4. **One Scan at a Time**: Concurrent replay requests coalesce into the
//!    running scan.
//!
//! # Layout
//!
//! ```text
//! <cache_dir>/
//!     01J9Z3K4Q8F6T2V5X7B9C1D3E5.envelope
//!     01J9Z3K4Q8F6T2V5X7B9C1D3E6.envelope
//!     session.json
//!     previous_session.json
//!     last_crash
//! ```

pub mod config;
pub mod context;
pub mod error;
mod fs_atomic;
pub mod marker;
pub mod queue;
pub mod replay;
pub mod session;
mod session_init;

pub use config::OutboxConfig;
pub use context::QueueContext;
pub use error::{OutboxError, OutboxResult};
pub use fs_atomic::StagedFile;
pub use marker::MarkerStore;
pub use queue::{DiskQueue, PendingEntries, QueueEntry, StagedEnvelope, ENVELOPE_SUFFIX};
pub use replay::{
    is_envelope_blocked, FileClaim, NoRateLimits, RateLimitGate, ReplayEngine, ReplaySummary, Submitter,
};
pub use session::{SessionFiles, CURRENT_SESSION_FILE, LAST_CRASH_MARKER, PREVIOUS_SESSION_FILE};
