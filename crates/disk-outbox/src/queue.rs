//! Directory of envelope files awaiting delivery.
//!
//! Every envelope is one `<ULID>.envelope` file. ULIDs come from a monotonic
//! generator, so lexicographic file order is creation order. Files only ever
//! appear through an atomic rename, which means anything `list_pending`
//! returns was completely written.

use crate::error::{OutboxError, OutboxResult};
use crate::fs_atomic::{self, StagedFile};
use crate::session_init::{self, InitTransfer};
use envelope_wire::{Envelope, IdPolicy};
use parking_lot::Mutex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use ulid::{Generator, Ulid};

/// Suffix of committed queue files.
pub const ENVELOPE_SUFFIX: &str = ".envelope";

/// A committed queue file.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct QueueEntry {
    name: String,
    path: PathBuf,
}

impl QueueEntry {
    fn new(dir: &Path, name: String) -> Self {
        let path = dir.join(&name);
        Self { name, path }
    }

    /// File name, e.g. `01J9Z3...envelope`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the raw envelope bytes.
    pub fn read(&self) -> io::Result<Vec<u8>> {
        fs::read(&self.path)
    }
}

/// Snapshot of the queue at listing time, oldest first.
///
/// Files enqueued after the listing are not included. Files removed after
/// the listing are still yielded; reading them reports `NotFound`.
#[derive(Debug)]
pub struct PendingEntries {
    inner: std::vec::IntoIter<QueueEntry>,
}

impl Iterator for PendingEntries {
    type Item = QueueEntry;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for PendingEntries {}

/// An envelope written and fsynced under a temp name, not yet visible.
///
/// Dropping it without [`DiskQueue::commit`] discards the write.
#[derive(Debug)]
pub struct StagedEnvelope {
    name: String,
    file: StagedFile,
}

impl StagedEnvelope {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Leave the temp file on disk exactly as a crash before the rename
    /// would. Returns the temp path.
    pub fn abandon(self) -> Option<PathBuf> {
        self.file.abandon()
    }
}

/// Append-only envelope queue with oldest-first eviction.
pub struct DiskQueue {
    dir: PathBuf,
    max_entries: usize,
    ids: Mutex<Generator>,
}

impl std::fmt::Debug for DiskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskQueue")
            .field("dir", &self.dir)
            .field("max_entries", &self.max_entries)
            .finish()
    }
}

impl DiskQueue {
    /// Open (creating if needed) the queue directory.
    ///
    /// Temp files orphaned by a crash mid-write are removed.
    pub fn open(dir: impl Into<PathBuf>, max_entries: usize) -> OutboxResult<Self> {
        let dir = dir.into();
        if max_entries == 0 {
            return Err(OutboxError::Config(
                "max_entries must be at least 1".to_string(),
            ));
        }
        if dir.exists() && !dir.is_dir() {
            return Err(OutboxError::InvalidDirectory {
                path: dir,
                reason: "not a directory".to_string(),
            });
        }
        fs::create_dir_all(&dir)?;

        let orphans = fs_atomic::remove_orphans(&dir)?;
        if orphans > 0 {
            info!(dir = %dir.display(), count = orphans, "Removed orphaned temp files");
        }

        debug!(dir = %dir.display(), max_entries, "Opened disk queue");
        Ok(Self {
            dir,
            max_entries,
            ids: Mutex::new(Generator::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Durably write `envelope`, then evict beyond `max_entries`.
    ///
    /// Eviction problems are logged, never returned: the envelope itself is
    /// already on disk at that point.
    pub fn enqueue(&self, envelope: &Envelope) -> OutboxResult<QueueEntry> {
        let staged = self.stage(envelope)?;
        self.commit(staged)
    }

    /// Encode and write `envelope` to a hidden temp file and fsync it.
    ///
    /// Envelopes replay would refuse to decode (an event, transaction or
    /// session without `event_id`) are rejected before anything is written.
    pub fn stage(&self, envelope: &Envelope) -> OutboxResult<StagedEnvelope> {
        envelope_wire::check_id_policy(envelope, IdPolicy::Infer)?;
        let bytes = envelope_wire::encode(envelope)?;
        let id = self
            .ids
            .lock()
            .generate()
            .map_err(|e| io::Error::other(e.to_string()))?;

        let name = format!("{id}{ENVELOPE_SUFFIX}");
        let temp_path = self
            .dir
            .join(format!(".{name}{}", fs_atomic::TEMP_SUFFIX));
        let file = fs_atomic::stage(temp_path, self.dir.join(&name), &bytes)?;
        Ok(StagedEnvelope { name, file })
    }

    /// Rename a staged envelope into place and enforce the capacity.
    pub fn commit(&self, staged: StagedEnvelope) -> OutboxResult<QueueEntry> {
        let StagedEnvelope { name, file } = staged;
        file.commit()?;
        debug!(file = %name, "Enqueued envelope");

        if let Err(e) = self.enforce_capacity(self.max_entries) {
            warn!(error = %e, "Failed to enforce queue capacity");
        }
        Ok(QueueEntry::new(&self.dir, name))
    }

    /// Committed queue files, oldest first.
    pub fn list_pending(&self) -> OutboxResult<PendingEntries> {
        let mut entries = Vec::new();
        for dir_entry in fs::read_dir(&self.dir)? {
            let dir_entry = dir_entry?;
            let Ok(name) = dir_entry.file_name().into_string() else {
                continue;
            };
            if !is_queue_file_name(&name) {
                continue;
            }
            entries.push(QueueEntry::new(&self.dir, name));
        }
        entries.sort();
        Ok(PendingEntries {
            inner: entries.into_iter(),
        })
    }

    /// Number of committed queue files.
    pub fn len(&self) -> OutboxResult<usize> {
        Ok(self.list_pending()?.len())
    }

    pub fn is_empty(&self) -> OutboxResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Delete a queue file. Returns `false` if it was already gone.
    pub fn remove(&self, entry: &QueueEntry) -> OutboxResult<bool> {
        match fs::remove_file(entry.path()) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the oldest files until at most `max_entries` remain.
    ///
    /// Returns how many were evicted. Each eviction is logged. An evicted
    /// session start hands its `init` flag to the next update of the same
    /// session still queued.
    pub fn enforce_capacity(&self, max_entries: usize) -> OutboxResult<usize> {
        let pending: Vec<QueueEntry> = self.list_pending()?.collect();
        let excess = pending.len().saturating_sub(max_entries);
        if excess == 0 {
            return Ok(0);
        }

        let (doomed, survivors) = pending.split_at(excess);
        let mut evicted = 0;
        for entry in doomed {
            self.carry_session_init(entry, survivors);
            match self.remove(entry) {
                Ok(true) => {
                    warn!(file = %entry.name(), max_entries, "Queue full, evicted oldest envelope");
                    evicted += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(file = %entry.name(), error = %e, "Failed to evict envelope");
                }
            }
        }
        Ok(evicted)
    }

    fn carry_session_init(&self, evicted: &QueueEntry, survivors: &[QueueEntry]) {
        let Some(sid) = read_envelope(evicted)
            .as_ref()
            .and_then(session_init::initial_session_id)
        else {
            return;
        };

        for entry in survivors {
            let Some(envelope) = read_envelope(entry) else {
                continue;
            };
            match session_init::transfer_init(&envelope, &sid) {
                InitTransfer::Unrelated => continue,
                InitTransfer::AlreadyInit => {
                    error!(file = %entry.name(), sid = %sid, "Session has the init flag twice");
                    return;
                }
                InitTransfer::Moved(rewritten) => {
                    if let Err(e) = self.rewrite(entry, &rewritten) {
                        warn!(file = %entry.name(), error = %e, "Failed to move session init flag");
                        return;
                    }
                    debug!(from = %evicted.name(), to = %entry.name(), sid = %sid, "Moved session init flag");
                    return;
                }
            }
        }
    }

    /// Replace a committed file in place, keeping its name and position.
    fn rewrite(&self, entry: &QueueEntry, envelope: &Envelope) -> OutboxResult<()> {
        let bytes = envelope_wire::encode(envelope)?;
        let temp_path = self.dir.join(format!(
            ".{}.{}{}",
            entry.name(),
            Ulid::new(),
            fs_atomic::TEMP_SUFFIX
        ));
        fs_atomic::write_atomic(temp_path, entry.path().to_path_buf(), &bytes)?;
        Ok(())
    }
}

fn read_envelope(entry: &QueueEntry) -> Option<Envelope> {
    let bytes = entry.read().ok()?;
    envelope_wire::decode(&bytes).ok()
}

/// Committed queue files: `<name>.envelope`, never hidden.
fn is_queue_file_name(name: &str) -> bool {
    !name.starts_with('.') && name.len() > ENVELOPE_SUFFIX.len() && name.ends_with(ENVELOPE_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use envelope_wire::EnvelopeItem;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn envelope(payload: &str) -> Envelope {
        Envelope::from_item(Uuid::new_v4(), EnvelopeItem::event(payload.as_bytes().to_vec()))
    }

    #[test]
    fn test_enqueue_writes_decodable_file() {
        let dir = tempdir().unwrap();
        let queue = DiskQueue::open(dir.path(), 10).unwrap();
        let original = envelope("{\"n\":1}");

        let entry = queue.enqueue(&original).unwrap();
        assert!(entry.name().ends_with(ENVELOPE_SUFFIX));

        let decoded = envelope_wire::decode(&entry.read().unwrap()).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(queue.len().unwrap(), 1);
    }

    #[test]
    fn test_list_pending_is_creation_order() {
        let dir = tempdir().unwrap();
        let queue = DiskQueue::open(dir.path(), 100).unwrap();

        let names: Vec<String> = (0..20)
            .map(|i| queue.enqueue(&envelope(&i.to_string())).unwrap().name().to_string())
            .collect();
        let listed: Vec<String> = queue
            .list_pending()
            .unwrap()
            .map(|e| e.name().to_string())
            .collect();
        assert_eq!(listed, names);
    }

    #[test]
    fn test_list_pending_is_a_snapshot() {
        let dir = tempdir().unwrap();
        let queue = DiskQueue::open(dir.path(), 10).unwrap();
        queue.enqueue(&envelope("a")).unwrap();

        let pending = queue.list_pending().unwrap();
        queue.enqueue(&envelope("b")).unwrap();
        assert_eq!(pending.count(), 1);
    }

    #[test]
    fn test_staged_envelope_is_invisible() {
        let dir = tempdir().unwrap();
        let queue = DiskQueue::open(dir.path(), 10).unwrap();

        let staged = queue.stage(&envelope("{}")).unwrap();
        assert_eq!(queue.len().unwrap(), 0);

        let entry = queue.commit(staged).unwrap();
        let listed: Vec<_> = queue.list_pending().unwrap().collect();
        assert_eq!(listed, vec![entry]);
    }

    #[test]
    fn test_ignores_foreign_files() {
        let dir = tempdir().unwrap();
        let queue = DiskQueue::open(dir.path(), 10).unwrap();
        fs::write(dir.path().join("session.json"), b"{}").unwrap();
        fs::write(dir.path().join(".envelope"), b"").unwrap();
        fs::write(dir.path().join("last_crash"), b"x").unwrap();

        assert_eq!(queue.len().unwrap(), 0);
    }

    #[test]
    fn test_remove_reports_missing() {
        let dir = tempdir().unwrap();
        let queue = DiskQueue::open(dir.path(), 10).unwrap();
        let entry = queue.enqueue(&envelope("{}")).unwrap();

        assert!(queue.remove(&entry).unwrap());
        assert!(!queue.remove(&entry).unwrap());
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_enqueue_evicts_oldest() {
        let dir = tempdir().unwrap();
        let queue = DiskQueue::open(dir.path(), 3).unwrap();

        let names: Vec<String> = (0..5)
            .map(|i| queue.enqueue(&envelope(&i.to_string())).unwrap().name().to_string())
            .collect();
        let listed: Vec<String> = queue
            .list_pending()
            .unwrap()
            .map(|e| e.name().to_string())
            .collect();
        assert_eq!(listed, names[2..].to_vec());
    }

    #[test]
    fn test_enforce_capacity_with_lower_limit() {
        let dir = tempdir().unwrap();
        let queue = DiskQueue::open(dir.path(), 10).unwrap();
        for i in 0..6 {
            queue.enqueue(&envelope(&i.to_string())).unwrap();
        }

        assert_eq!(queue.enforce_capacity(4).unwrap(), 2);
        assert_eq!(queue.enforce_capacity(4).unwrap(), 0);
        assert_eq!(queue.len().unwrap(), 4);
    }

    #[test]
    fn test_stage_rejects_event_without_id() {
        let dir = tempdir().unwrap();
        let queue = DiskQueue::open(dir.path(), 10).unwrap();
        let anonymous = Envelope::new(
            envelope_wire::EnvelopeHeader::default(),
            vec![EnvelopeItem::event(b"{}".to_vec())],
        );

        assert!(matches!(
            queue.enqueue(&anonymous),
            Err(OutboxError::Decode(envelope_wire::DecodeError::MissingRequiredField("event_id")))
        ));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);

        let report = Envelope::new(
            envelope_wire::EnvelopeHeader::default(),
            vec![EnvelopeItem::new("client_report", b"{}".to_vec())],
        );
        assert!(queue.enqueue(&report).is_ok());
    }

    fn session(payload: &str) -> Envelope {
        Envelope::from_item(Uuid::new_v4(), EnvelopeItem::session(payload.as_bytes().to_vec()))
    }

    fn session_json(entry: &QueueEntry) -> serde_json::Value {
        let envelope = envelope_wire::decode(&entry.read().unwrap()).unwrap();
        serde_json::from_slice(envelope.items()[0].payload()).unwrap()
    }

    #[test]
    fn test_eviction_moves_session_init_flag() {
        let dir = tempdir().unwrap();
        let queue = DiskQueue::open(dir.path(), 2).unwrap();
        queue
            .enqueue(&session(r#"{"sid":"s1","status":"ok","init":true,"seq":1}"#))
            .unwrap();
        let other = queue
            .enqueue(&session(r#"{"sid":"s2","status":"ok","seq":1}"#))
            .unwrap();
        let update = queue
            .enqueue(&session(r#"{"sid":"s1","status":"ok","seq":2}"#))
            .unwrap();

        let listed: Vec<_> = queue.list_pending().unwrap().collect();
        assert_eq!(listed, vec![other.clone(), update.clone()]);

        let moved = session_json(&update);
        assert_eq!(moved["init"], serde_json::Value::Bool(true));
        assert_eq!(moved["seq"], serde_json::Value::from(2));
        assert!(session_json(&other).get("init").is_none());
    }

    #[test]
    fn test_eviction_without_session_start_rewrites_nothing() {
        let dir = tempdir().unwrap();
        let queue = DiskQueue::open(dir.path(), 1).unwrap();
        queue
            .enqueue(&session(r#"{"sid":"s1","status":"ok","seq":1}"#))
            .unwrap();
        let update = queue
            .enqueue(&session(r#"{"sid":"s1","status":"ok","seq":2}"#))
            .unwrap();

        assert!(session_json(&update).get("init").is_none());
    }

    #[test]
    fn test_open_rejects_file_path() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        fs::write(&file, b"").unwrap();

        assert!(matches!(
            DiskQueue::open(&file, 10),
            Err(OutboxError::InvalidDirectory { .. })
        ));
    }

    #[test]
    fn test_debug_shows_location() {
        let dir = tempdir().unwrap();
        let queue = DiskQueue::open(dir.path(), 7).unwrap();
        let debug = format!("{queue:?}");
        assert!(debug.contains("max_entries: 7"));
        assert!(!debug.contains("ids"));
    }

    #[test]
    fn test_open_rejects_zero_capacity() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            DiskQueue::open(dir.path(), 0),
            Err(OutboxError::Config(_))
        ));
    }

    #[test]
    fn test_concurrent_enqueue() {
        let dir = tempdir().unwrap();
        let queue = std::sync::Arc::new(DiskQueue::open(dir.path(), 1000).unwrap());

        let threads: Vec<_> = (0..4)
            .map(|t| {
                let queue = std::sync::Arc::clone(&queue);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        queue.enqueue(&envelope(&format!("{t}-{i}"))).unwrap();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(queue.len().unwrap(), 100);
    }
}
