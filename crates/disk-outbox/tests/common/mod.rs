#![allow(dead_code)]

use disk_outbox::{DiskQueue, OutboxConfig, QueueContext};
use envelope_wire::{Envelope, EnvelopeItem};
use parking_lot::Mutex;
use std::path::Path;
use submission_hints::{RetryHint, SubmissionOutcome};
use tempfile::TempDir;
use uuid::Uuid;

/// Open a queue in a fresh temp dir and return (TempDir, queue).
pub fn open_queue(max_entries: usize) -> (TempDir, DiskQueue) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let queue = DiskQueue::open(dir.path(), max_entries).expect("failed to open queue");
    (dir, queue)
}

/// Open a full context in a fresh temp dir.
pub fn open_context(max_entries: usize) -> (TempDir, QueueContext) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let mut config = OutboxConfig::with_cache_dir(dir.path());
    config.max_entries = max_entries;
    let context = QueueContext::open(config).expect("failed to open context");
    (dir, context)
}

/// An envelope with one JSON `event` item.
pub fn event_envelope(payload: &str) -> Envelope {
    Envelope::from_item(Uuid::new_v4(), EnvelopeItem::event(payload.as_bytes().to_vec()))
}

/// Payload of the first item as text.
pub fn first_payload(envelope: &Envelope) -> String {
    String::from_utf8(envelope.items()[0].payload().to_vec()).expect("payload is not UTF-8")
}

/// Names of files currently in `dir`, sorted.
pub fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .expect("failed to read dir")
        .map(|e| e.expect("bad dir entry").file_name().into_string().expect("non UTF-8 name"))
        .collect();
    names.sort();
    names
}

/// Submitter that records every envelope and answers with a fixed outcome.
pub struct RecordingSubmitter {
    outcome: SubmissionOutcome,
    seen: Mutex<Vec<Envelope>>,
}

impl RecordingSubmitter {
    pub fn new(outcome: SubmissionOutcome) -> Self {
        Self {
            outcome,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn seen(&self) -> Vec<Envelope> {
        self.seen.lock().clone()
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().len()
    }
}

impl disk_outbox::Submitter for RecordingSubmitter {
    fn submit(&self, envelope: Envelope, _hint: &RetryHint) -> SubmissionOutcome {
        self.seen.lock().push(envelope);
        self.outcome
    }
}
