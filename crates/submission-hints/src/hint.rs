//! Context passed to the transport with each submission.

use crate::capability::{DiskFlushNotification, Retryable};
use crate::handle::SubmissionHandle;
use std::sync::Arc;

/// Binds a handle to the queued file it is delivering, if any.
///
/// The transport only sees capabilities through this type. It never
/// resolves the handle itself.
#[derive(Debug, Clone)]
pub struct RetryHint {
    handle: Arc<SubmissionHandle>,
    file_name: Option<String>,
}

impl RetryHint {
    pub fn new(handle: Arc<SubmissionHandle>) -> Self {
        Self {
            handle,
            file_name: None,
        }
    }

    pub fn for_file(handle: Arc<SubmissionHandle>, file_name: impl Into<String>) -> Self {
        Self {
            handle,
            file_name: Some(file_name.into()),
        }
    }

    /// Queue file being replayed.
    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    pub fn retryable(&self) -> &dyn Retryable {
        self.handle.as_ref()
    }

    pub fn flush_notification(&self) -> &dyn DiskFlushNotification {
        self.handle.as_ref()
    }

    /// Ask the caller to keep the queued copy for a later pass.
    pub fn mark_retry(&self) {
        self.retryable().mark_retry();
    }

    pub fn is_retry(&self) -> bool {
        self.retryable().is_retry()
    }

    /// Report that the envelope is durably on disk.
    pub fn mark_flushed(&self) {
        self.flush_notification().mark_flushed();
    }
}
