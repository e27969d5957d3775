//! Configuration for the envelope outbox.

use crate::error::{OutboxError, OutboxResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default maximum number of queued envelope files.
pub const DEFAULT_MAX_ENTRIES: usize = 30;

/// Default bound on a producer's flush wait, in milliseconds.
pub const DEFAULT_FLUSH_TIMEOUT_MS: u64 = 15_000;

/// Default bound on waiting for the previous session to be flushed.
pub const DEFAULT_SESSION_FLUSH_TIMEOUT_MS: u64 = 15_000;

/// Default bound on the synchronous startup replay.
pub const DEFAULT_STARTUP_REPLAY_TIMEOUT_MS: u64 = 5_000;

/// Name of the queue directory under the platform cache dir.
const DEFAULT_DIR_NAME: &str = "envelope-outbox";

/// Outbox configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxConfig {
    /// Directory holding queued envelopes and marker files.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Maximum queued envelope files; the oldest are evicted beyond this.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// How long a producer waits for a submission to reach disk or network.
    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,
    /// How long session start waits for the previous session to be flushed.
    #[serde(default = "default_session_flush_timeout_ms")]
    pub session_flush_timeout_ms: u64,
    /// How long SDK init blocks on the high-priority startup replay.
    #[serde(default = "default_startup_replay_timeout_ms")]
    pub startup_replay_timeout_ms: u64,
    /// Idle submission handles kept for reuse.
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(DEFAULT_DIR_NAME)
}

fn default_max_entries() -> usize {
    DEFAULT_MAX_ENTRIES
}

fn default_flush_timeout_ms() -> u64 {
    DEFAULT_FLUSH_TIMEOUT_MS
}

fn default_session_flush_timeout_ms() -> u64 {
    DEFAULT_SESSION_FLUSH_TIMEOUT_MS
}

fn default_startup_replay_timeout_ms() -> u64 {
    DEFAULT_STARTUP_REPLAY_TIMEOUT_MS
}

fn default_pool_capacity() -> usize {
    submission_hints::DEFAULT_POOL_CAPACITY
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            max_entries: DEFAULT_MAX_ENTRIES,
            flush_timeout_ms: DEFAULT_FLUSH_TIMEOUT_MS,
            session_flush_timeout_ms: DEFAULT_SESSION_FLUSH_TIMEOUT_MS,
            startup_replay_timeout_ms: DEFAULT_STARTUP_REPLAY_TIMEOUT_MS,
            pool_capacity: default_pool_capacity(),
        }
    }
}

impl OutboxConfig {
    /// Create a config with default values, then override from environment.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Defaults rooted at `cache_dir`.
    pub fn with_cache_dir(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ..Self::default()
        }
    }

    /// Load configuration from a JSON file. Missing fields take defaults.
    pub fn load_from_file(path: &Path) -> OutboxResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: OutboxConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the queue cannot run with.
    pub fn validate(&self) -> OutboxResult<()> {
        if self.max_entries == 0 {
            return Err(OutboxError::Config(
                "max_entries must be at least 1".to_string(),
            ));
        }
        if self.cache_dir.as_os_str().is_empty() {
            return Err(OutboxError::Config("cache_dir is empty".to_string()));
        }
        Ok(())
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    pub fn session_flush_timeout(&self) -> Duration {
        Duration::from_millis(self.session_flush_timeout_ms)
    }

    pub fn startup_replay_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_replay_timeout_ms)
    }

    fn load_from_env(&mut self) {
        if let Ok(dir) = std::env::var("ENVELOPE_OUTBOX_DIR") {
            if !dir.is_empty() {
                self.cache_dir = PathBuf::from(dir);
            }
        }

        if let Some(max_entries) = std::env::var("ENVELOPE_OUTBOX_MAX_ENTRIES")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|n| *n > 0)
        {
            self.max_entries = max_entries;
        }

        if let Some(timeout_ms) = std::env::var("ENVELOPE_OUTBOX_FLUSH_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            self.flush_timeout_ms = timeout_ms;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = OutboxConfig::default();
        assert_eq!(config.max_entries, 30);
        assert_eq!(config.flush_timeout(), Duration::from_secs(15));
        assert_eq!(config.startup_replay_timeout(), Duration::from_secs(5));
        assert!(config.cache_dir.ends_with("envelope-outbox"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("outbox.json");
        std::fs::write(&path, r#"{"cache_dir":"/tmp/q","max_entries":100}"#).unwrap();

        let config = OutboxConfig::load_from_file(&path).unwrap();
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/q"));
        assert_eq!(config.max_entries, 100);
        assert_eq!(config.flush_timeout_ms, DEFAULT_FLUSH_TIMEOUT_MS);
    }

    #[test]
    fn test_load_from_file_rejects_zero_capacity() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("outbox.json");
        std::fs::write(&path, r#"{"max_entries":0}"#).unwrap();

        assert!(matches!(
            OutboxConfig::load_from_file(&path),
            Err(OutboxError::Config(_))
        ));
    }

    #[test]
    fn test_with_cache_dir() {
        let config = OutboxConfig::with_cache_dir("/var/tmp/outbox");
        assert_eq!(config.cache_dir, PathBuf::from("/var/tmp/outbox"));
        assert_eq!(config.max_entries, DEFAULT_MAX_ENTRIES);
    }
}
