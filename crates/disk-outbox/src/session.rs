//! Current/previous session files and the crash marker.

use crate::error::OutboxResult;
use crate::marker::MarkerStore;
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Session being recorded by this process.
pub const CURRENT_SESSION_FILE: &str = "session.json";

/// Session of the previous run, moved aside when a new session begins.
pub const PREVIOUS_SESSION_FILE: &str = "previous_session.json";

/// Written when the process is about to die on an uncaught crash.
pub const LAST_CRASH_MARKER: &str = "last_crash";

#[derive(Debug, Default)]
struct SessionState {
    crashed_last_run: Option<bool>,
    previous_flushed: bool,
}

/// Session bookkeeping on top of a [`MarkerStore`].
#[derive(Debug)]
pub struct SessionFiles {
    markers: MarkerStore,
    state: Mutex<SessionState>,
    flushed: Condvar,
}

impl SessionFiles {
    pub fn new(markers: MarkerStore) -> Self {
        Self {
            markers,
            state: Mutex::new(SessionState::default()),
            flushed: Condvar::new(),
        }
    }

    /// Start a new session.
    ///
    /// Moves the current session file aside as the previous one, writes
    /// `payload` as the current session, and consumes the crash marker.
    /// Waiters on [`wait_previous_session_flush`](Self::wait_previous_session_flush)
    /// are released even if a step fails.
    pub fn begin_session(&self, payload: &[u8]) -> OutboxResult<()> {
        let result = self.rotate_and_write(payload);
        self.release_previous_session();
        result
    }

    fn rotate_and_write(&self, payload: &[u8]) -> OutboxResult<()> {
        if self
            .markers
            .rename(CURRENT_SESSION_FILE, PREVIOUS_SESSION_FILE)?
        {
            debug!("Moved unfinished session aside");
        }
        self.markers.write_bytes(CURRENT_SESSION_FILE, payload)?;

        let crashed = self.markers.remove(LAST_CRASH_MARKER)?;
        if crashed {
            info!("Previous run ended in a crash");
        }
        self.state.lock().crashed_last_run = Some(crashed);
        Ok(())
    }

    fn release_previous_session(&self) {
        let mut state = self.state.lock();
        state.previous_flushed = true;
        self.flushed.notify_all();
    }

    /// Replace the current session payload (e.g. after a session update).
    pub fn update_session(&self, payload: &[u8]) -> OutboxResult<()> {
        self.markers.write_bytes(CURRENT_SESSION_FILE, payload)
    }

    /// Delete the current session file. Returns `false` if there was none.
    pub fn end_session(&self) -> OutboxResult<bool> {
        self.markers.remove(CURRENT_SESSION_FILE)
    }

    pub fn current_session(&self) -> OutboxResult<Option<Vec<u8>>> {
        self.markers.read_bytes(CURRENT_SESSION_FILE)
    }

    /// Read and delete the previous session file.
    pub fn take_previous_session(&self) -> OutboxResult<Option<Vec<u8>>> {
        let previous = self.markers.read_bytes(PREVIOUS_SESSION_FILE)?;
        if previous.is_some() {
            self.markers.remove(PREVIOUS_SESSION_FILE)?;
        }
        Ok(previous)
    }

    /// Remember that this run is crashing. Called from the crash handler.
    pub fn record_crash(&self) -> OutboxResult<()> {
        self.record_crash_at(Utc::now())
    }

    pub fn record_crash_at(&self, at: DateTime<Utc>) -> OutboxResult<()> {
        self.markers.write_timestamp(LAST_CRASH_MARKER, at)
    }

    /// Whether the previous run crashed. `None` until a session began.
    pub fn crashed_last_run(&self) -> Option<bool> {
        self.state.lock().crashed_last_run
    }

    /// Block until the previous session was moved aside, at most `timeout`.
    pub fn wait_previous_session_flush(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        while !state.previous_flushed {
            match deadline {
                Some(deadline) => {
                    if self.flushed.wait_until(&mut state, deadline).timed_out() {
                        return state.previous_flushed;
                    }
                }
                None => self.flushed.wait(&mut state),
            }
        }
        true
    }
}
