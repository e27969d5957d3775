//! Small single-value files kept next to the queue.
//!
//! Markers make cross-restart decisions idempotent, e.g. "was the last
//! crash already reported". Every write goes through temp + rename so a
//! reader sees either the old value or the new one.

use crate::error::{OutboxError, OutboxResult};
use crate::fs_atomic;
use crate::queue::ENVELOPE_SUFFIX;
use chrono::{DateTime, Utc};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use ulid::Ulid;

/// Reads and writes named markers in one directory.
#[derive(Debug, Clone)]
pub struct MarkerStore {
    dir: PathBuf,
}

impl MarkerStore {
    /// Markers under `dir`. The directory must already exist.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the marker `name`.
    pub fn path(&self, name: &str) -> OutboxResult<PathBuf> {
        validate_name(name)?;
        Ok(self.dir.join(name))
    }

    /// Atomically replace the marker's value.
    pub fn write_bytes(&self, name: &str, value: &[u8]) -> OutboxResult<()> {
        let final_path = self.path(name)?;
        let temp_path = self
            .dir
            .join(format!(".{name}.{}{}", Ulid::new(), fs_atomic::TEMP_SUFFIX));
        fs_atomic::write_atomic(temp_path, final_path, value)?;
        debug!(marker = %name, "Wrote marker");
        Ok(())
    }

    pub fn read_bytes(&self, name: &str) -> OutboxResult<Option<Vec<u8>>> {
        match fs::read(self.path(name)?) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write(&self, name: &str, value: &str) -> OutboxResult<()> {
        self.write_bytes(name, value.as_bytes())
    }

    /// Read the marker as text, trimmed of surrounding whitespace.
    pub fn read(&self, name: &str) -> OutboxResult<Option<String>> {
        let Some(bytes) = self.read_bytes(name)? else {
            return Ok(None);
        };
        match String::from_utf8(bytes) {
            Ok(value) => Ok(Some(value.trim().to_string())),
            Err(_) => {
                warn!(marker = %name, "Marker is not valid UTF-8, ignoring");
                Ok(None)
            }
        }
    }

    /// Delete the marker. Returns `false` if it did not exist.
    pub fn remove(&self, name: &str) -> OutboxResult<bool> {
        match fs::remove_file(self.path(name)?) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn exists(&self, name: &str) -> OutboxResult<bool> {
        Ok(self.path(name)?.exists())
    }

    /// Atomically move marker `from` over marker `to`.
    ///
    /// Returns `false` if `from` did not exist, in which case `to` is left
    /// untouched.
    pub fn rename(&self, from: &str, to: &str) -> OutboxResult<bool> {
        let from_path = self.path(from)?;
        let to_path = self.path(to)?;
        match fs::rename(from_path, to_path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Store a timestamp as RFC 3339.
    pub fn write_timestamp(&self, name: &str, at: DateTime<Utc>) -> OutboxResult<()> {
        self.write(name, &at.to_rfc3339())
    }

    /// Read a timestamp marker. Unparseable values read as absent.
    pub fn read_timestamp(&self, name: &str) -> OutboxResult<Option<DateTime<Utc>>> {
        let Some(value) = self.read(name)? else {
            return Ok(None);
        };
        match DateTime::parse_from_rfc3339(&value) {
            Ok(at) => Ok(Some(at.with_timezone(&Utc))),
            Err(e) => {
                warn!(marker = %name, value = %value, error = %e, "Unparseable timestamp marker");
                Ok(None)
            }
        }
    }
}

/// Marker names are plain file names that cannot be mistaken for queue or
/// temp files.
fn validate_name(name: &str) -> OutboxResult<()> {
    let invalid = name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\', '\0'])
        || name.contains("..")
        || name.ends_with(ENVELOPE_SUFFIX)
        || name.ends_with(fs_atomic::TEMP_SUFFIX);
    if invalid {
        return Err(OutboxError::InvalidMarkerName(name.to_string()));
    }
    Ok(())
}
