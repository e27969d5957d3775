//! Configuration for the delivery worker.

use std::time::Duration;

/// Default capacity of the job channel.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default bound on waiting for the worker task at shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Delivery worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Jobs buffered before producers fall back to a synchronous disk write.
    pub queue_capacity: usize,
    /// How long `shutdown` waits for the job in progress.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl WorkerConfig {
    /// Create a config with default values, then override from environment.
    pub fn new() -> Self {
        let mut config = Self::default();

        if let Some(capacity) = std::env::var("ENVELOPE_WORKER_QUEUE_CAPACITY")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|n| *n > 0)
        {
            config.queue_capacity = capacity;
        }

        if let Some(secs) = std::env::var("ENVELOPE_WORKER_SHUTDOWN_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            config.shutdown_timeout = Duration::from_secs(secs);
        }

        config
    }
}
