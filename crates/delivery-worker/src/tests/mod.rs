//! Integration tests for the delivery worker.
//!
//! - `harness.rs`  - Mock transport and a worker over a temp outbox
//! - `submit.rs`   - Live submissions: disk first, disposition, flush waits
//! - `replay.rs`   - Triggers, delayed replay, startup replay
//! - `shutdown.rs` - Cancellation of handles and delayed replays
