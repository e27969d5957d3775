//! Capabilities a submission context can expose to the transport.

use crate::error::HintResult;
use std::time::Duration;

/// The transport can ask for the queued copy to be kept for a later pass.
pub trait Retryable {
    fn mark_retry(&self);
    fn is_retry(&self) -> bool;
}

/// The context can be returned to its initial state between uses.
pub trait Resettable {
    /// Fails if a waiter is still parked.
    fn reset(&self) -> HintResult<()>;
}

/// A producer can wait until the envelope reached disk or the network.
pub trait FlushAwaitable {
    /// Returns `false` on timeout or cancellation.
    fn wait_flush(&self, timeout: Duration) -> bool;
}

/// The executor reports that the envelope is durably on disk.
pub trait DiskFlushNotification {
    fn mark_flushed(&self);
    fn is_flushed(&self) -> bool;
}
