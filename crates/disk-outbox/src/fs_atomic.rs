//! Temp-file + fsync + rename writes.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Suffix carried by every in-progress write.
pub(crate) const TEMP_SUFFIX: &str = ".tmp";

/// Bytes that are on disk and fsynced under a hidden temp name but not yet
/// visible under their final name.
///
/// Dropping without [`commit`](Self::commit) removes the temp file.
#[derive(Debug)]
pub struct StagedFile {
    temp_path: Option<PathBuf>,
    final_path: PathBuf,
}

impl StagedFile {
    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    /// Rename into place, then fsync the parent directory (best effort).
    pub fn commit(mut self) -> io::Result<PathBuf> {
        let Some(temp_path) = self.temp_path.take() else {
            return Ok(self.final_path.clone());
        };

        if let Err(err) = fs::rename(&temp_path, &self.final_path) {
            let _ = fs::remove_file(&temp_path);
            return Err(err);
        }
        sync_parent(&self.final_path);
        Ok(self.final_path.clone())
    }

    /// Leave the temp file behind exactly as a crash before rename would,
    /// returning its path.
    pub fn abandon(mut self) -> Option<PathBuf> {
        self.temp_path.take()
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if let Some(temp_path) = self.temp_path.take() {
            let _ = fs::remove_file(temp_path);
        }
    }
}

/// Write `bytes` to `temp_path` (which must not exist) and fsync it.
pub(crate) fn stage(temp_path: PathBuf, final_path: PathBuf, bytes: &[u8]) -> io::Result<StagedFile> {
    // Another writer's temp file is left alone
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&temp_path)?;

    let write_result = (|| -> io::Result<()> {
        file.write_all(bytes)?;
        file.sync_all()?;
        Ok(())
    })();

    if let Err(err) = write_result {
        let _ = fs::remove_file(&temp_path);
        return Err(err);
    }

    Ok(StagedFile {
        temp_path: Some(temp_path),
        final_path,
    })
}

/// Stage and commit in one step.
pub(crate) fn write_atomic(temp_path: PathBuf, final_path: PathBuf, bytes: &[u8]) -> io::Result<()> {
    stage(temp_path, final_path, bytes)?.commit().map(|_| ())
}

fn sync_parent(path: &Path) {
    if let Some(dir) = path.parent() {
        if let Ok(parent_dir) = fs::File::open(dir) {
            let _ = parent_dir.sync_all();
        }
    }
}

/// Whether `name` looks like one of our in-progress writes.
pub(crate) fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(TEMP_SUFFIX)
}

/// Remove temp files left by a crash mid-write. Returns how many were removed.
pub(crate) fn remove_orphans(dir: &Path) -> io::Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !is_temp_name(name) {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => {
                debug!(file = %name, "Removed orphaned temp file");
                removed += 1;
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(file = %name, error = %err, "Failed to remove orphaned temp file"),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_commit_makes_file_visible() {
        let dir = tempdir().unwrap();
        let temp = dir.path().join(".a.tmp");
        let target = dir.path().join("a");

        let staged = stage(temp.clone(), target.clone(), b"hello").unwrap();
        assert!(temp.exists());
        assert!(!target.exists());

        staged.commit().unwrap();
        assert!(!temp.exists());
        assert_eq!(fs::read(&target).unwrap(), b"hello");
    }

    #[test]
    fn test_drop_removes_temp() {
        let dir = tempdir().unwrap();
        let temp = dir.path().join(".a.tmp");
        drop(stage(temp.clone(), dir.path().join("a"), b"x").unwrap());
        assert!(!temp.exists());
    }

    #[test]
    fn test_abandon_leaves_orphan_for_cleanup() {
        let dir = tempdir().unwrap();
        let staged = stage(dir.path().join(".a.tmp"), dir.path().join("a"), b"x").unwrap();
        let orphan = staged.abandon().unwrap();
        assert!(orphan.exists());

        fs::write(dir.path().join("keep.envelope"), b"{}\n").unwrap();
        assert_eq!(remove_orphans(dir.path()).unwrap(), 1);
        assert!(!orphan.exists());
        assert!(dir.path().join("keep.envelope").exists());
    }

    #[test]
    fn test_stage_refuses_existing_temp() {
        let dir = tempdir().unwrap();
        let temp = dir.path().join(".a.tmp");
        fs::write(&temp, b"other writer").unwrap();

        let err = stage(temp.clone(), dir.path().join("a"), b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(fs::read(&temp).unwrap(), b"other writer");
    }

    #[test]
    fn test_write_atomic_replaces_existing() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("marker");
        fs::write(&target, b"old").unwrap();

        write_atomic(dir.path().join(".marker.1.tmp"), target.clone(), b"new").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"new");
    }
}
