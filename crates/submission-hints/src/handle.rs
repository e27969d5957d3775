//! Reusable completion handle.
//!
//! State lives behind a `parking_lot` mutex. Blocking waiters park on a
//! condvar and async waiters on a `tokio::sync::Notify`; every transition
//! wakes both.

use crate::capability::{DiskFlushNotification, FlushAwaitable, Resettable, Retryable};
use crate::error::{HintError, HintResult};
use crate::outcome::{HandleResult, Outcome, SubmissionOutcome};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Completed(SubmissionOutcome),
    Cancelled,
}

impl From<Resolution> for Outcome {
    fn from(resolution: Resolution) -> Self {
        match resolution {
            Resolution::Completed(outcome) => Outcome::Completed(outcome),
            Resolution::Cancelled => Outcome::Cancelled,
        }
    }
}

#[derive(Debug, Default)]
struct HandleState {
    generation: u64,
    resolution: Option<Resolution>,
    retry_requested: bool,
    flushed: bool,
    waiters: usize,
}

/// Identifies one use of a handle. Signals carrying an older token are
/// rejected after a reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalToken {
    generation: u64,
}

impl SignalToken {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// One-shot completion signal with a bounded wait, reusable through
/// [`Resettable::reset`].
#[derive(Debug)]
pub struct SubmissionHandle {
    id: u64,
    state: Mutex<HandleState>,
    cond: Condvar,
    notify: Notify,
}

impl Default for SubmissionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl SubmissionHandle {
    pub fn new() -> Self {
        Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(HandleState::default()),
            cond: Condvar::new(),
            notify: Notify::new(),
        }
    }

    /// Process-unique identifier, stable across resets.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Token for the current use. Hand it to whoever will signal.
    pub fn token(&self) -> SignalToken {
        SignalToken {
            generation: self.state.lock().generation,
        }
    }

    /// Resolve the current use. Returns `false` if it was already resolved.
    pub fn signal(&self, outcome: SubmissionOutcome) -> bool {
        let mut state = self.state.lock();
        self.resolve(&mut state, Resolution::Completed(outcome))
    }

    /// Resolve the use identified by `token`.
    ///
    /// A token from before the last reset yields [`HintError::StaleSignal`]
    /// and leaves the handle untouched.
    pub fn signal_for(&self, token: SignalToken, outcome: SubmissionOutcome) -> HintResult<bool> {
        let mut state = self.state.lock();
        if token.generation != state.generation {
            debug!(
                handle_id = self.id,
                signal = token.generation,
                current = state.generation,
                "Ignoring stale signal"
            );
            return Err(HintError::StaleSignal {
                signal: token.generation,
                current: state.generation,
            });
        }
        Ok(self.resolve(&mut state, Resolution::Completed(outcome)))
    }

    /// Resolve as cancelled. Returns `false` if already resolved.
    pub fn cancel(&self) -> bool {
        let mut state = self.state.lock();
        self.resolve(&mut state, Resolution::Cancelled)
    }

    fn resolve(&self, state: &mut MutexGuard<'_, HandleState>, resolution: Resolution) -> bool {
        if let Some(existing) = state.resolution {
            trace!(
                handle_id = self.id,
                existing = ?existing,
                ignored = ?resolution,
                "Handle already resolved"
            );
            return false;
        }
        state.resolution = Some(resolution);
        self.wake_all();
        true
    }

    fn wake_all(&self) {
        self.cond.notify_all();
        self.notify.notify_waiters();
    }

    /// Current outcome without blocking, if resolved.
    pub fn peek(&self) -> Option<Outcome> {
        self.state.lock().resolution.map(Outcome::from)
    }

    pub fn is_resolved(&self) -> bool {
        self.state.lock().resolution.is_some()
    }

    pub fn result(&self) -> HandleResult {
        match self.state.lock().resolution {
            None => HandleResult::Pending,
            Some(Resolution::Completed(SubmissionOutcome::Success)) => HandleResult::Success,
            Some(_) => HandleResult::Failure,
        }
    }

    /// Number of waiters currently parked.
    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters
    }

    /// Block until resolved or until `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Outcome {
        let mut state = self.state.lock();
        if let Some(resolution) = state.resolution {
            return resolution.into();
        }
        let deadline = Instant::now().checked_add(timeout);
        state.waiters += 1;
        let outcome = loop {
            if let Some(resolution) = state.resolution {
                break resolution.into();
            }
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out() {
                        break state
                            .resolution
                            .map(Outcome::from)
                            .unwrap_or(Outcome::TimedOut);
                    }
                }
                None => self.cond.wait(&mut state),
            }
        };
        state.waiters -= 1;
        outcome
    }

    /// Async counterpart of [`wait`](Self::wait).
    pub async fn wait_async(&self, timeout: Duration) -> Outcome {
        if let Some(outcome) = self.peek() {
            return outcome;
        }
        let _guard = WaiterGuard::register(self);
        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(outcome) = self.peek() {
                return outcome;
            }

            tokio::select! {
                _ = &mut notified => continue,
                _ = &mut sleep => {
                    return self.peek().unwrap_or(Outcome::TimedOut);
                }
            }
        }
    }

    fn wait_flush_inner(&self, timeout: Duration) -> bool {
        let reached = |state: &HandleState| {
            state.flushed || matches!(state.resolution, Some(Resolution::Completed(_)))
        };

        let mut state = self.state.lock();
        if reached(&state) {
            return true;
        }
        if state.resolution.is_some() {
            return false;
        }
        let deadline = Instant::now().checked_add(timeout);
        state.waiters += 1;
        let flushed = loop {
            if reached(&state) {
                break true;
            }
            if state.resolution.is_some() {
                break false;
            }
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out() {
                        break reached(&state);
                    }
                }
                None => self.cond.wait(&mut state),
            }
        };
        state.waiters -= 1;
        flushed
    }
}

/// Counts an async waiter for as long as its future is alive.
struct WaiterGuard<'a> {
    handle: &'a SubmissionHandle,
}

impl<'a> WaiterGuard<'a> {
    fn register(handle: &'a SubmissionHandle) -> Self {
        handle.state.lock().waiters += 1;
        Self { handle }
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.handle.state.lock();
        state.waiters = state.waiters.saturating_sub(1);
    }
}

impl Retryable for SubmissionHandle {
    fn mark_retry(&self) {
        self.state.lock().retry_requested = true;
    }

    fn is_retry(&self) -> bool {
        self.state.lock().retry_requested
    }
}

impl Resettable for SubmissionHandle {
    fn reset(&self) -> HintResult<()> {
        let mut state = self.state.lock();
        if state.waiters > 0 {
            warn!(
                handle_id = self.id,
                waiters = state.waiters,
                "Refusing to reset handle with parked waiters"
            );
            return Err(HintError::HandleBusy {
                waiters: state.waiters,
            });
        }
        state.generation += 1;
        state.resolution = None;
        state.retry_requested = false;
        state.flushed = false;
        trace!(handle_id = self.id, generation = state.generation, "Handle reset");
        Ok(())
    }
}

impl DiskFlushNotification for SubmissionHandle {
    fn mark_flushed(&self) {
        let mut state = self.state.lock();
        if !state.flushed {
            state.flushed = true;
            drop(state);
            self.wake_all();
        }
    }

    fn is_flushed(&self) -> bool {
        self.state.lock().flushed
    }
}

impl FlushAwaitable for SubmissionHandle {
    fn wait_flush(&self, timeout: Duration) -> bool {
        self.wait_flush_inner(timeout)
    }
}
