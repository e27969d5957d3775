//! Everything the outbox needs, built once at SDK init.

use crate::config::OutboxConfig;
use crate::error::{OutboxError, OutboxResult};
use crate::marker::MarkerStore;
use crate::queue::{DiskQueue, QueueEntry};
use crate::replay::{
    FileClaim, NoRateLimits, RateLimitGate, ReplayEngine, ReplaySummary, Submitter,
};
use crate::session::SessionFiles;
use envelope_wire::Envelope;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use submission_hints::HandlePool;
use tracing::{info, warn};

/// Queue, markers, sessions and replay engine for one outbox directory.
///
/// There is no process-wide state: callers construct one context and share
/// it (usually behind an `Arc`).
#[derive(Debug)]
pub struct QueueContext {
    config: OutboxConfig,
    queue: Arc<DiskQueue>,
    markers: MarkerStore,
    sessions: SessionFiles,
    engine: Arc<ReplayEngine>,
}

impl QueueContext {
    /// Open the outbox described by `config` with no rate limiting.
    pub fn open(config: OutboxConfig) -> OutboxResult<Self> {
        Self::with_rate_limiter(config, Arc::new(NoRateLimits))
    }

    /// Open the outbox, consulting `gate` before every replayed submission.
    pub fn with_rate_limiter(
        config: OutboxConfig,
        gate: Arc<dyn RateLimitGate>,
    ) -> OutboxResult<Self> {
        config.validate()?;
        let queue = Arc::new(DiskQueue::open(&config.cache_dir, config.max_entries)?);
        let markers = MarkerStore::new(&config.cache_dir);
        let sessions = SessionFiles::new(markers.clone());
        let pool = Arc::new(HandlePool::new(config.pool_capacity));
        let engine = Arc::new(ReplayEngine::new(pool, gate));

        info!(
            dir = %config.cache_dir.display(),
            max_entries = config.max_entries,
            "Outbox ready"
        );

        Ok(Self {
            config,
            queue,
            markers,
            sessions,
            engine,
        })
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<DiskQueue> {
        &self.queue
    }

    pub fn markers(&self) -> &MarkerStore {
        &self.markers
    }

    pub fn sessions(&self) -> &SessionFiles {
        &self.sessions
    }

    pub fn engine(&self) -> &Arc<ReplayEngine> {
        &self.engine
    }

    pub fn pool(&self) -> &Arc<HandlePool> {
        self.engine.pool()
    }

    /// Durably queue `envelope`.
    pub fn enqueue(&self, envelope: &Envelope) -> OutboxResult<QueueEntry> {
        self.queue.enqueue(envelope)
    }

    /// Durably queue `envelope` for a live send.
    ///
    /// The file is claimed before it becomes visible, so no replay pass
    /// submits it until the returned claim is dropped.
    pub fn enqueue_claimed(&self, envelope: &Envelope) -> OutboxResult<(QueueEntry, FileClaim<'_>)> {
        let staged = self.queue.stage(envelope)?;
        let Some(claim) = self.engine.try_claim(staged.name()) else {
            return Err(OutboxError::AlreadyClaimed(staged.name().to_string()));
        };
        let entry = self.queue.commit(staged)?;
        Ok((entry, claim))
    }

    /// Run a replay pass on the calling thread.
    pub fn replay(&self, submitter: &dyn Submitter) -> ReplaySummary {
        self.engine.process_directory(&self.queue, submitter)
    }

    /// Replay on a helper thread, waiting at most `timeout` for it.
    ///
    /// Used at init when the previous run crashed. Returns `None` on
    /// timeout; the scan keeps running to completion in the background.
    pub fn replay_on_startup(
        &self,
        submitter: Arc<dyn Submitter>,
        timeout: Duration,
    ) -> Option<ReplaySummary> {
        let (tx, rx) = mpsc::channel();
        let queue = Arc::clone(&self.queue);
        let engine = Arc::clone(&self.engine);

        let spawned = thread::Builder::new()
            .name("outbox-startup-replay".to_string())
            .spawn(move || {
                let summary = engine.process_directory(&queue, submitter.as_ref());
                // The waiter may have given up already
                let _ = tx.send(summary);
            });
        if let Err(e) = spawned {
            warn!(error = %e, "Failed to spawn startup replay thread");
            return None;
        }

        match rx.recv_timeout(timeout) {
            Ok(summary) => Some(summary),
            Err(_) => {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Startup replay did not finish in time, continuing in background"
                );
                None
            }
        }
    }
}
