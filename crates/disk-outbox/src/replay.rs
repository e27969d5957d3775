//! Replays queued envelopes through the transport.
//!
//! One pass visits every committed file oldest first and decides its fate:
//!
//! | Situation | Disposition |
//! |---|---|
//! | File does not decode | deleted, never retried |
//! | Every item category rate limited | kept, submit not called |
//! | `Success` | deleted |
//! | `Success` but the transport called `mark_retry()` | kept |
//! | `RetryableFailure` | kept, scan continues with later files |
//! | `PermanentFailure` / `RateLimited` | kept |
//!
//! Nothing on a per-file basis aborts the pass. A file claimed by a live
//! delivery is left alone until that delivery finishes.

use crate::queue::{DiskQueue, QueueEntry};
use envelope_wire::{DataCategory, Envelope, IdPolicy};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use submission_hints::{HandlePool, RetryHint, SubmissionOutcome};
use tracing::{debug, error, info, warn};

/// Delivers one envelope. Supplied by the transport layer.
pub trait Submitter: Send + Sync {
    fn submit(&self, envelope: Envelope, hint: &RetryHint) -> SubmissionOutcome;
}

impl<F> Submitter for F
where
    F: Fn(Envelope, &RetryHint) -> SubmissionOutcome + Send + Sync,
{
    fn submit(&self, envelope: Envelope, hint: &RetryHint) -> SubmissionOutcome {
        self(envelope, hint)
    }
}

/// Answers whether a category is currently rate limited.
pub trait RateLimitGate: Send + Sync {
    fn is_blocked(&self, category: DataCategory) -> bool;
}

/// Gate that never blocks.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRateLimits;

impl RateLimitGate for NoRateLimits {
    fn is_blocked(&self, _category: DataCategory) -> bool {
        false
    }
}

/// Whether the gate blocks every item of `envelope`.
pub fn is_envelope_blocked(gate: &dyn RateLimitGate, envelope: &Envelope) -> bool {
    if gate.is_blocked(DataCategory::All) {
        return true;
    }
    !envelope.is_empty()
        && envelope
            .items()
            .iter()
            .all(|item| gate.is_blocked(item.category()))
}

/// Counts from one or more replay passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Files visited.
    pub processed: usize,
    /// Delivered and deleted.
    pub delivered: usize,
    /// Submitted, kept for a later pass.
    pub retried: usize,
    /// Kept without a network attempt (rate limited or blocked).
    pub skipped: usize,
    /// Undecodable, deleted.
    pub dropped: usize,
    /// Removed by someone else between listing and reading.
    pub vanished: usize,
    /// Kept because they could not be read.
    pub retained: usize,
    /// Left alone because another delivery owns them.
    pub in_flight: usize,
    /// Passes run by this call.
    pub passes: usize,
    /// Another scan was running; this request was folded into it.
    pub coalesced: bool,
}

impl ReplaySummary {
    /// Summary for a request absorbed by a scan already in flight.
    pub fn coalesced() -> Self {
        Self {
            coalesced: true,
            ..Self::default()
        }
    }

    fn absorb(&mut self, pass: ReplaySummary) {
        self.processed += pass.processed;
        self.delivered += pass.delivered;
        self.retried += pass.retried;
        self.skipped += pass.skipped;
        self.dropped += pass.dropped;
        self.vanished += pass.vanished;
        self.retained += pass.retained;
        self.in_flight += pass.in_flight;
        self.passes += pass.passes;
    }
}

/// Exclusive right to deliver one queue file. Released on drop.
#[derive(Debug)]
pub struct FileClaim<'a> {
    claimed: &'a Mutex<HashSet<String>>,
    name: String,
}

impl FileClaim<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for FileClaim<'_> {
    fn drop(&mut self) {
        self.claimed.lock().remove(&self.name);
    }
}

/// Serializes scans of one queue directory and applies dispositions.
pub struct ReplayEngine {
    pool: Arc<HandlePool>,
    gate: Arc<dyn RateLimitGate>,
    scan: Mutex<()>,
    rerun: AtomicBool,
    claimed: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for ReplayEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayEngine")
            .field("pool", &self.pool)
            .field("scanning", &self.scan.is_locked())
            .field("claimed", &self.claimed.lock().len())
            .finish()
    }
}

impl ReplayEngine {
    pub fn new(pool: Arc<HandlePool>, gate: Arc<dyn RateLimitGate>) -> Self {
        Self {
            pool,
            gate,
            scan: Mutex::new(()),
            rerun: AtomicBool::new(false),
            claimed: Mutex::new(HashSet::new()),
        }
    }

    pub fn pool(&self) -> &Arc<HandlePool> {
        &self.pool
    }

    pub fn gate(&self) -> &dyn RateLimitGate {
        self.gate.as_ref()
    }

    pub fn is_scanning(&self) -> bool {
        self.scan.is_locked()
    }

    /// Claim `name` for delivery. `None` if someone else holds it.
    pub fn try_claim(&self, name: &str) -> Option<FileClaim<'_>> {
        if !self.claimed.lock().insert(name.to_string()) {
            return None;
        }
        Some(FileClaim {
            claimed: &self.claimed,
            name: name.to_string(),
        })
    }

    pub fn is_claimed(&self, name: &str) -> bool {
        self.claimed.lock().contains(name)
    }

    /// Replay every file in `queue`.
    ///
    /// If a scan is already running, the request is coalesced: the running
    /// scan makes one more pass and this call returns
    /// [`ReplaySummary::coalesced`] at once. That extra pass submits through
    /// the running scan's `submitter`; the coalesced caller's `submitter` is
    /// not used.
    pub fn process_directory(&self, queue: &DiskQueue, submitter: &dyn Submitter) -> ReplaySummary {
        let mut summary = ReplaySummary::default();
        loop {
            // Announce before trying the lock, so a scan finishing right now
            // either sees the request or releases the lock to us.
            self.rerun.store(true, Ordering::SeqCst);
            let Some(guard) = self.scan.try_lock() else {
                if summary.passes == 0 {
                    debug!(dir = %queue.dir().display(), "Scan in progress, coalescing request");
                    return ReplaySummary::coalesced();
                }
                break;
            };
            self.rerun.store(false, Ordering::SeqCst);
            summary.absorb(self.scan_once(queue, submitter));
            drop(guard);

            if !self.rerun.load(Ordering::SeqCst) {
                break;
            }
        }

        info!(
            dir = %queue.dir().display(),
            processed = summary.processed,
            delivered = summary.delivered,
            retried = summary.retried,
            skipped = summary.skipped,
            dropped = summary.dropped,
            in_flight = summary.in_flight,
            passes = summary.passes,
            "Replay finished"
        );
        summary
    }

    fn scan_once(&self, queue: &DiskQueue, submitter: &dyn Submitter) -> ReplaySummary {
        let mut summary = ReplaySummary {
            passes: 1,
            ..ReplaySummary::default()
        };

        let pending = match queue.list_pending() {
            Ok(pending) => pending,
            Err(e) => {
                error!(dir = %queue.dir().display(), error = %e, "Failed to list queue");
                return summary;
            }
        };

        for entry in pending {
            summary.processed += 1;
            self.replay_entry(queue, &entry, submitter, &mut summary);
        }
        summary
    }

    fn replay_entry(
        &self,
        queue: &DiskQueue,
        entry: &QueueEntry,
        submitter: &dyn Submitter,
        summary: &mut ReplaySummary,
    ) {
        let Some(_claim) = self.try_claim(entry.name()) else {
            debug!(file = %entry.name(), "Queue file is being delivered, leaving it");
            summary.in_flight += 1;
            return;
        };

        let bytes = match entry.read() {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(file = %entry.name(), "Queue file vanished before replay");
                summary.vanished += 1;
                return;
            }
            Err(e) => {
                warn!(file = %entry.name(), error = %e, "Failed to read queue file, keeping it");
                summary.retained += 1;
                return;
            }
        };

        let envelope = match envelope_wire::decode_with(&bytes, IdPolicy::Infer) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(file = %entry.name(), error = %e, "Dropping undecodable queue file");
                if let Err(remove_err) = queue.remove(entry) {
                    warn!(file = %entry.name(), error = %remove_err, "Failed to delete undecodable file");
                }
                summary.dropped += 1;
                return;
            }
        };

        if is_envelope_blocked(self.gate.as_ref(), &envelope) {
            debug!(file = %entry.name(), "Rate limited, skipping without submit");
            summary.skipped += 1;
            return;
        }

        let handle = self.pool.take();
        let hint = RetryHint::for_file(Arc::clone(&handle), entry.name());
        let outcome = submitter.submit(envelope, &hint);
        let retry_requested = hint.is_retry();
        handle.signal(outcome);
        drop(hint);
        self.pool.release(handle);

        match outcome {
            SubmissionOutcome::Success if !retry_requested => match queue.remove(entry) {
                Ok(_) => {
                    debug!(file = %entry.name(), "Delivered queued envelope");
                    summary.delivered += 1;
                }
                Err(e) => {
                    // Keeping it risks a duplicate, which the server dedups by id
                    warn!(file = %entry.name(), error = %e, "Delivered but failed to delete");
                    summary.retained += 1;
                }
            },
            SubmissionOutcome::Success | SubmissionOutcome::RetryableFailure => {
                debug!(file = %entry.name(), outcome = %outcome, "Keeping envelope for retry");
                summary.retried += 1;
            }
            SubmissionOutcome::PermanentFailure | SubmissionOutcome::RateLimited => {
                debug!(file = %entry.name(), outcome = %outcome, "Submission skipped, keeping envelope");
                summary.skipped += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envelope_wire::EnvelopeItem;
    use std::collections::HashSet;
    use std::fs;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;
    use uuid::Uuid;

    struct BlockedCategories(HashSet<DataCategory>);

    impl RateLimitGate for BlockedCategories {
        fn is_blocked(&self, category: DataCategory) -> bool {
            self.0.contains(&category)
        }
    }

    fn engine() -> ReplayEngine {
        ReplayEngine::new(Arc::new(HandlePool::new(4)), Arc::new(NoRateLimits))
    }

    fn event(payload: &str) -> Envelope {
        Envelope::from_item(Uuid::new_v4(), EnvelopeItem::event(payload.as_bytes().to_vec()))
    }

    fn payload_of(envelope: &Envelope) -> String {
        String::from_utf8(envelope.items()[0].payload().to_vec()).unwrap()
    }

    #[test]
    fn test_success_deletes_files() {
        let dir = tempdir().unwrap();
        let queue = DiskQueue::open(dir.path(), 10).unwrap();
        queue.enqueue(&event("1")).unwrap();
        queue.enqueue(&event("2")).unwrap();

        let submit = |_: Envelope, _: &RetryHint| SubmissionOutcome::Success;
        let summary = engine().process_directory(&queue, &submit);

        assert_eq!(summary.processed, 2);
        assert_eq!(summary.delivered, 2);
        assert_eq!(summary.passes, 1);
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_retryable_failure_keeps_file_and_continues() {
        let dir = tempdir().unwrap();
        let queue = DiskQueue::open(dir.path(), 10).unwrap();
        queue.enqueue(&event("fail")).unwrap();
        queue.enqueue(&event("ok")).unwrap();

        let submit = |envelope: Envelope, _: &RetryHint| {
            if payload_of(&envelope) == "fail" {
                SubmissionOutcome::RetryableFailure
            } else {
                SubmissionOutcome::Success
            }
        };
        let summary = engine().process_directory(&queue, &submit);

        assert_eq!(summary.retried, 1);
        assert_eq!(summary.delivered, 1);
        let left: Vec<_> = queue.list_pending().unwrap().collect();
        assert_eq!(left.len(), 1);
        let remaining = envelope_wire::decode(&left[0].read().unwrap()).unwrap();
        assert_eq!(payload_of(&remaining), "fail");
    }

    #[test]
    fn test_mark_retry_overrides_success() {
        let dir = tempdir().unwrap();
        let queue = DiskQueue::open(dir.path(), 10).unwrap();
        queue.enqueue(&event("{}")).unwrap();

        let submit = |_: Envelope, hint: &RetryHint| {
            hint.mark_retry();
            SubmissionOutcome::Success
        };
        let summary = engine().process_directory(&queue, &submit);

        assert_eq!(summary.retried, 1);
        assert_eq!(queue.len().unwrap(), 1);
    }

    #[test]
    fn test_hint_is_bound_to_file() {
        let dir = tempdir().unwrap();
        let queue = DiskQueue::open(dir.path(), 10).unwrap();
        let entry = queue.enqueue(&event("{}")).unwrap();

        let seen = Mutex::new(Vec::new());
        let submit = |_: Envelope, hint: &RetryHint| {
            seen.lock().push(hint.file_name().map(str::to_string));
            SubmissionOutcome::Success
        };
        engine().process_directory(&queue, &submit);

        assert_eq!(seen.into_inner(), vec![Some(entry.name().to_string())]);
    }

    #[test]
    fn test_permanent_failure_and_rate_limited_keep_files() {
        let dir = tempdir().unwrap();
        let queue = DiskQueue::open(dir.path(), 10).unwrap();
        queue.enqueue(&event("p")).unwrap();
        queue.enqueue(&event("r")).unwrap();

        let submit = |envelope: Envelope, _: &RetryHint| {
            if payload_of(&envelope) == "p" {
                SubmissionOutcome::PermanentFailure
            } else {
                SubmissionOutcome::RateLimited
            }
        };
        let summary = engine().process_directory(&queue, &submit);

        assert_eq!(summary.skipped, 2);
        assert_eq!(queue.len().unwrap(), 2);
    }

    #[test]
    fn test_corrupt_file_is_deleted_without_submit() {
        let dir = tempdir().unwrap();
        let queue = DiskQueue::open(dir.path(), 10).unwrap();
        queue.enqueue(&event("good")).unwrap();
        fs::write(dir.path().join("00000000000000000000000000.envelope"), b"garbage").unwrap();

        let calls = AtomicUsize::new(0);
        let submit = |_: Envelope, _: &RetryHint| {
            calls.fetch_add(1, Ordering::SeqCst);
            SubmissionOutcome::Success
        };
        let summary = engine().process_directory(&queue, &submit);

        assert_eq!(summary.dropped, 1);
        assert_eq!(summary.delivered, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_event_without_id_is_dropped() {
        let dir = tempdir().unwrap();
        let queue = DiskQueue::open(dir.path(), 10).unwrap();
        fs::write(
            dir.path().join("00000000000000000000000000.envelope"),
            b"{}\n{\"type\":\"event\",\"length\":2}\n{}\n",
        )
        .unwrap();

        let submit = |_: Envelope, _: &RetryHint| SubmissionOutcome::Success;
        let summary = engine().process_directory(&queue, &submit);

        assert_eq!(summary.dropped, 1);
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_rate_limited_category_is_not_submitted() {
        let dir = tempdir().unwrap();
        let queue = DiskQueue::open(dir.path(), 10).unwrap();
        queue.enqueue(&event("blocked")).unwrap();
        queue
            .enqueue(&Envelope::from_item(
                Uuid::new_v4(),
                EnvelopeItem::session(b"{}".to_vec()),
            ))
            .unwrap();

        let gate = BlockedCategories([DataCategory::Error].into_iter().collect());
        let engine = ReplayEngine::new(Arc::new(HandlePool::new(4)), Arc::new(gate));

        let calls = AtomicUsize::new(0);
        let submit = |envelope: Envelope, _: &RetryHint| {
            calls.fetch_add(1, Ordering::SeqCst);
            assert!(envelope.contains_item_type("session"));
            SubmissionOutcome::Success
        };
        let summary = engine.process_directory(&queue, &submit);

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.delivered, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.len().unwrap(), 1);
    }

    #[test]
    fn test_partially_blocked_envelope_is_submitted() {
        let gate = BlockedCategories([DataCategory::Attachment].into_iter().collect());
        let envelope = event("{}").with_item(EnvelopeItem::attachment("a.txt", b"x".to_vec()));
        assert!(!is_envelope_blocked(&gate, &envelope));

        let all = BlockedCategories([DataCategory::All].into_iter().collect());
        assert!(is_envelope_blocked(&all, &envelope));
    }

    #[test]
    fn test_handles_are_recycled() {
        let dir = tempdir().unwrap();
        let queue = DiskQueue::open(dir.path(), 10).unwrap();
        for i in 0..3 {
            queue.enqueue(&event(&i.to_string())).unwrap();
        }

        let engine = engine();
        let submit = |_: Envelope, _: &RetryHint| SubmissionOutcome::RetryableFailure;
        engine.process_directory(&queue, &submit);

        assert_eq!(engine.pool().idle_count(), 1);
    }

    #[test]
    fn test_claimed_file_is_left_alone() {
        let dir = tempdir().unwrap();
        let queue = DiskQueue::open(dir.path(), 10).unwrap();
        let entry = queue.enqueue(&event("{}")).unwrap();

        let engine = engine();
        let calls = AtomicUsize::new(0);
        let submit = |_: Envelope, _: &RetryHint| {
            calls.fetch_add(1, Ordering::SeqCst);
            SubmissionOutcome::Success
        };

        let claim = engine.try_claim(entry.name()).unwrap();
        assert!(engine.try_claim(entry.name()).is_none());
        let summary = engine.process_directory(&queue, &submit);
        assert_eq!(summary.in_flight, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(queue.len().unwrap(), 1);

        drop(claim);
        assert!(!engine.is_claimed(entry.name()));
        let summary = engine.process_directory(&queue, &submit);
        assert_eq!(summary.delivered, 1);
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_concurrent_request_is_coalesced() {
        let dir = tempdir().unwrap();
        let queue = DiskQueue::open(dir.path(), 10).unwrap();
        queue.enqueue(&event("{}")).unwrap();

        let engine = engine();
        let passes = AtomicUsize::new(0);
        let nested = Mutex::new(None);
        let submit = |_: Envelope, _: &RetryHint| {
            if passes.fetch_add(1, Ordering::SeqCst) == 0 {
                let inner = |_: Envelope, _: &RetryHint| SubmissionOutcome::Success;
                *nested.lock() = Some(engine.process_directory(&queue, &inner));
            }
            SubmissionOutcome::RetryableFailure
        };
        let summary = engine.process_directory(&queue, &submit);

        assert_eq!(nested.into_inner(), Some(ReplaySummary::coalesced()));
        assert_eq!(summary.passes, 2);
        assert_eq!(passes.load(Ordering::SeqCst), 2);
        assert!(!engine.is_scanning());
    }
}
