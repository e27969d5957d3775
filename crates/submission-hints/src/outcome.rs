//! Submission outcomes.

use std::fmt;

/// Result reported by the transport for one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubmissionOutcome {
    /// Delivered; the queued copy can be deleted.
    Success,
    /// Transient failure (network unreachable, 5xx). Retry on a later pass.
    RetryableFailure,
    /// The category is blocked outright. No network I/O was attempted.
    PermanentFailure,
    /// The server or local limiter is throttling this category.
    RateLimited,
}

impl SubmissionOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, SubmissionOutcome::Success)
    }

    /// Whether the transport attempted delivery and failed.
    pub fn is_attempted_failure(self) -> bool {
        matches!(self, SubmissionOutcome::RetryableFailure)
    }

    /// Whether delivery was never attempted.
    pub fn is_skipped(self) -> bool {
        matches!(
            self,
            SubmissionOutcome::PermanentFailure | SubmissionOutcome::RateLimited
        )
    }
}

impl fmt::Display for SubmissionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubmissionOutcome::Success => "success",
            SubmissionOutcome::RetryableFailure => "retryable_failure",
            SubmissionOutcome::PermanentFailure => "permanent_failure",
            SubmissionOutcome::RateLimited => "rate_limited",
        };
        f.write_str(s)
    }
}

/// What a waiter observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The executor signaled a result.
    Completed(SubmissionOutcome),
    /// The timeout elapsed first. The handle is still live.
    TimedOut,
    /// The handle was resolved by shutdown.
    Cancelled,
}

impl Outcome {
    pub fn is_success(self) -> bool {
        matches!(self, Outcome::Completed(SubmissionOutcome::Success))
    }
}

/// Coarse view of a handle's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleResult {
    Pending,
    Success,
    Failure,
}
