//! Flush synchronization for in-flight submissions.
//!
//! A producer hands an envelope to an executor and gets back a
//! [`SubmissionHandle`]. The executor signals the handle exactly once when the
//! submission finishes; the producer may block (or `.await`) on it with a
//! bounded timeout.
//!
//! # Core Invariants
//!
//! 1. **Single Resolution**: The first signal of a generation wins; later
//!    signals are ignored without error.
//! 2. **Bounded Waits**: Every wait takes a timeout. A timed-out wait leaves
//!    the handle valid.
//! 3. **Generation-Checked Reset**: `reset` bumps the generation, so a signal
//!    issued for an earlier use can never resolve a later one.
//! 4. **Closed Capabilities**: Retry, reset, and flush signaling are traits
//!    implemented by the handle, reached through `&dyn` references.

pub mod capability;
pub mod error;
pub mod handle;
pub mod hint;
pub mod outcome;
pub mod pool;

pub use capability::{DiskFlushNotification, FlushAwaitable, Resettable, Retryable};
pub use error::{HintError, HintResult};
pub use handle::{SignalToken, SubmissionHandle};
pub use hint::RetryHint;
pub use outcome::{HandleResult, Outcome, SubmissionOutcome};
pub use pool::{HandlePool, DEFAULT_POOL_CAPACITY};
