//! Bounded pool of reusable handles.

use crate::capability::Resettable;
use crate::handle::SubmissionHandle;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace};

/// Default number of idle handles kept for reuse.
pub const DEFAULT_POOL_CAPACITY: usize = 16;

/// Hands out handles and takes them back once nobody else holds them.
///
/// A handle is recycled only when the pool holds the last reference and the
/// reset succeeds. Otherwise it is dropped and a fresh one is made next time.
#[derive(Debug)]
pub struct HandlePool {
    idle: Mutex<Vec<Arc<SubmissionHandle>>>,
    capacity: usize,
}

impl Default for HandlePool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}

impl HandlePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Take a pending handle.
    pub fn take(&self) -> Arc<SubmissionHandle> {
        match self.idle.lock().pop() {
            Some(handle) => {
                trace!(handle_id = handle.id(), "Reusing pooled handle");
                handle
            }
            None => Arc::new(SubmissionHandle::new()),
        }
    }

    /// Return a handle. Returns `true` if it was kept for reuse.
    pub fn release(&self, handle: Arc<SubmissionHandle>) -> bool {
        if Arc::strong_count(&handle) != 1 {
            debug!(
                handle_id = handle.id(),
                refs = Arc::strong_count(&handle),
                "Handle still shared, not recycling"
            );
            return false;
        }
        if let Err(e) = handle.reset() {
            debug!(handle_id = handle.id(), error = %e, "Handle not reset, not recycling");
            return false;
        }

        let mut idle = self.idle.lock();
        if idle.len() >= self.capacity {
            return false;
        }
        idle.push(handle);
        true
    }
}
