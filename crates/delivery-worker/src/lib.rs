//! Delivery worker: the live path from producer to disk to transport.
//!
//! Every submission is written to the outbox before the transport sees it,
//! so a crash mid-send leaves the envelope for the next replay.
//!
//! # Core Invariants
//!
//! 1. **Disk First**: `mark_flushed` fires only after the queue file is
//!    committed; delivery is attempted afterwards.
//! 2. **Never Blocks the Producer**: `submit_async` returns at once. A full
//!    job queue degrades to a synchronous disk write, not a wait.
//! 3. **Nothing Hangs at Shutdown**: delayed replays are aborted and every
//!    unresolved handle is resolved as `Cancelled`.
//!
//! # Architecture
//!
//! ```text
//! producer ──submit_async──▶ mpsc ──▶ worker task ──spawn_blocking──▶ disk ──▶ Submitter
//!                                        ▲
//!    on_connectivity_restored ───────────┤ (replay job)
//!    on_flush_requested ─────────────────┤
//!    schedule_replay(delay) ─────────────┘
//! ```

pub mod config;
pub mod error;
pub mod worker;

#[cfg(test)]
mod tests;

pub use config::{WorkerConfig, DEFAULT_QUEUE_CAPACITY, DEFAULT_SHUTDOWN_TIMEOUT};
pub use error::{WorkerError, WorkerResult};
pub use worker::DeliveryWorker;
