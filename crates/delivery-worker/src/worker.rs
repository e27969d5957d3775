//! Background executor for live submissions and replays.

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use disk_outbox::{is_envelope_blocked, OutboxConfig, QueueContext, ReplaySummary, Submitter};
use envelope_wire::Envelope;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use submission_hints::{DiskFlushNotification, Retryable, RetryHint, SubmissionHandle, SubmissionOutcome};
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

enum Job {
    Submit {
        envelope: Envelope,
        handle: Arc<SubmissionHandle>,
    },
    Replay,
}

/// State shared between the producer-facing API and the worker task.
struct Shared {
    context: Arc<QueueContext>,
    submitter: Arc<dyn Submitter>,
    /// Handles not yet resolved, keyed by handle id.
    in_flight: Mutex<HashMap<u64, Arc<SubmissionHandle>>>,
}

impl Shared {
    fn track(&self, handle: &Arc<SubmissionHandle>) {
        self.in_flight.lock().insert(handle.id(), Arc::clone(handle));
    }

    fn untrack(&self, handle: &SubmissionHandle) {
        self.in_flight.lock().remove(&handle.id());
    }

    fn finish(&self, handle: &SubmissionHandle, outcome: SubmissionOutcome) {
        self.untrack(handle);
        handle.signal(outcome);
    }

    fn finish_cancelled(&self, handle: &SubmissionHandle) {
        self.untrack(handle);
        handle.cancel();
    }

    /// Write to disk, then submit. Blocking.
    ///
    /// The queue file stays claimed until the disposition is applied, so a
    /// replay running meanwhile does not send it a second time.
    fn deliver(&self, envelope: Envelope, handle: &Arc<SubmissionHandle>) -> SubmissionOutcome {
        let queued = match self.context.enqueue_claimed(&envelope) {
            Ok(queued) => {
                handle.mark_flushed();
                Some(queued)
            }
            Err(e) => {
                warn!(error = %e, "Failed to persist envelope, submitting without a disk copy");
                None
            }
        };

        if is_envelope_blocked(self.context.engine().gate(), &envelope) {
            debug!("Envelope rate limited, leaving it queued");
            return SubmissionOutcome::RateLimited;
        }

        let hint = match &queued {
            Some((entry, _)) => RetryHint::for_file(Arc::clone(handle), entry.name()),
            None => RetryHint::new(Arc::clone(handle)),
        };
        let outcome = self.submitter.submit(envelope, &hint);

        if outcome.is_success() && !hint.is_retry() {
            if let Some((entry, _)) = &queued {
                if let Err(e) = self.context.queue().remove(entry) {
                    warn!(file = %entry.name(), error = %e, "Delivered but failed to delete");
                }
            }
        }
        outcome
    }

    /// Keep a copy on disk for the next replay. Returns whether it was written.
    fn persist(&self, envelope: &Envelope, handle: &SubmissionHandle) -> bool {
        match self.context.enqueue(envelope) {
            Ok(entry) => {
                debug!(file = %entry.name(), "Persisted envelope for later replay");
                handle.mark_flushed();
                true
            }
            Err(e) => {
                error!(error = %e, "Failed to persist envelope, dropping it");
                false
            }
        }
    }

    fn persist_for_retry(&self, envelope: Envelope, handle: &SubmissionHandle) {
        self.persist(&envelope, handle);
        handle.mark_retry();
        self.finish(handle, SubmissionOutcome::RetryableFailure);
    }

    fn persist_and_cancel(&self, envelope: Envelope, handle: &SubmissionHandle) {
        self.persist(&envelope, handle);
        self.finish_cancelled(handle);
    }

    fn replay(&self) -> ReplaySummary {
        self.context.replay(self.submitter.as_ref())
    }

    /// Resolve every remaining handle as cancelled.
    fn cancel_all(&self) -> usize {
        let handles: Vec<_> = self.in_flight.lock().drain().map(|(_, h)| h).collect();
        handles.iter().filter(|h| h.cancel()).count()
    }
}

/// Persists, submits and replays envelopes on a background task.
///
/// # Lifecycle
///
/// 1. Create with [`DeliveryWorker::new`] or [`DeliveryWorker::open`]
/// 2. Call [`start`](Self::start) from inside a Tokio runtime
/// 3. Hand envelopes to [`submit_async`](Self::submit_async)
/// 4. Call [`shutdown`](Self::shutdown) before exit
///
/// Jobs run one at a time; each blocking step runs on the blocking pool.
/// Receiver on loan to the worker task.
///
/// Goes back to its slot when the task ends, aborted or not, so shutdown can
/// still settle the jobs left in the channel.
struct LeasedReceiver {
    slot: Arc<Mutex<Option<mpsc::Receiver<Job>>>>,
    receiver: Option<mpsc::Receiver<Job>>,
}

impl Drop for LeasedReceiver {
    fn drop(&mut self) {
        if let Some(receiver) = self.receiver.take() {
            *self.slot.lock() = Some(receiver);
        }
    }
}

pub struct DeliveryWorker {
    config: WorkerConfig,
    shared: Arc<Shared>,
    sender: mpsc::Sender<Job>,
    receiver: Arc<Mutex<Option<mpsc::Receiver<Job>>>>,
    runtime: Mutex<Option<Handle>>,
    task: Mutex<Option<JoinHandle<()>>>,
    delayed: Mutex<Vec<JoinHandle<()>>>,
    stop: Arc<Notify>,
    shut_down: AtomicBool,
}

impl DeliveryWorker {
    pub fn new(
        config: WorkerConfig,
        context: Arc<QueueContext>,
        submitter: Arc<dyn Submitter>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            config,
            shared: Arc::new(Shared {
                context,
                submitter,
                in_flight: Mutex::new(HashMap::new()),
            }),
            sender,
            receiver: Arc::new(Mutex::new(Some(receiver))),
            runtime: Mutex::new(None),
            task: Mutex::new(None),
            delayed: Mutex::new(Vec::new()),
            stop: Arc::new(Notify::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Open the outbox described by `outbox` and build a worker on it.
    pub fn open(
        outbox: OutboxConfig,
        config: WorkerConfig,
        submitter: Arc<dyn Submitter>,
    ) -> WorkerResult<Self> {
        let context = Arc::new(QueueContext::open(outbox)?);
        Ok(Self::new(config, context, submitter))
    }

    pub fn context(&self) -> &Arc<QueueContext> {
        &self.shared.context
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Submissions handed out and not yet resolved.
    pub fn in_flight_count(&self) -> usize {
        self.shared.in_flight.lock().len()
    }

    /// Spawn the worker task on the current Tokio runtime.
    pub fn start(&self) -> WorkerResult<()> {
        if self.is_shut_down() {
            return Err(WorkerError::ShutDown);
        }
        let runtime = Handle::try_current()?;
        let mut task_slot = self.task.lock();
        if task_slot.is_some() {
            return Err(WorkerError::AlreadyStarted);
        }
        let receiver = self
            .receiver
            .lock()
            .take()
            .ok_or(WorkerError::AlreadyStarted)?;
        let mut lease = LeasedReceiver {
            slot: Arc::clone(&self.receiver),
            receiver: Some(receiver),
        };

        let shared = Arc::clone(&self.shared);
        let stop = Arc::clone(&self.stop);

        let task = runtime.spawn(async move {
            let Some(receiver) = lease.receiver.as_mut() else {
                return;
            };
            loop {
                tokio::select! {
                    biased;
                    _ = stop.notified() => break,
                    job = receiver.recv() => match job {
                        Some(job) => run_job(&shared, job).await,
                        None => break,
                    },
                }
            }
            let drained = drain(&shared, receiver);
            debug!(drained, "Delivery worker loop stopped");
        });

        *task_slot = Some(task);
        drop(task_slot);
        *self.runtime.lock() = Some(runtime);
        info!(
            dir = %self.shared.context.queue().dir().display(),
            queue_capacity = self.config.queue_capacity,
            "Delivery worker started"
        );
        Ok(())
    }

    /// Queue `envelope` for persistence and delivery.
    ///
    /// Never blocks. If the job queue is full the envelope is written to
    /// disk on the calling thread and the handle resolves to
    /// `RetryableFailure` with the retry flag set. After shutdown the handle
    /// resolves to `Cancelled`.
    pub fn submit_async(&self, envelope: Envelope) -> Arc<SubmissionHandle> {
        let handle = self.shared.context.pool().take();
        if self.is_shut_down() {
            debug!("Submission after shutdown, cancelling");
            handle.cancel();
            return handle;
        }

        self.shared.track(&handle);
        let job = Job::Submit {
            envelope,
            handle: Arc::clone(&handle),
        };
        if let Err(err) = self.sender.try_send(job) {
            let (job, full) = match err {
                TrySendError::Full(job) => (job, true),
                TrySendError::Closed(job) => (job, false),
            };
            if let Job::Submit { envelope, handle } = job {
                if full {
                    warn!("Job queue full, persisting envelope for replay");
                    self.shared.persist_for_retry(envelope, &handle);
                } else {
                    self.shared.persist_and_cancel(envelope, &handle);
                }
            }
        }
        handle
    }

    /// Ask for a replay pass. Returns `false` if the request was dropped.
    pub fn trigger_replay(&self) -> bool {
        if self.is_shut_down() {
            return false;
        }
        match self.sender.try_send(Job::Replay) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("Job queue full, replay request dropped");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Connectivity came back.
    pub fn on_connectivity_restored(&self) -> bool {
        debug!("Connectivity restored, triggering replay");
        self.trigger_replay()
    }

    /// The host asked for a flush.
    pub fn on_flush_requested(&self) -> bool {
        debug!("Flush requested, triggering replay");
        self.trigger_replay()
    }

    /// Request a replay after `delay`. Cancelled by shutdown.
    pub fn schedule_replay(&self, delay: Duration) -> WorkerResult<()> {
        if self.is_shut_down() {
            return Err(WorkerError::ShutDown);
        }
        let runtime = self
            .runtime
            .lock()
            .clone()
            .ok_or(WorkerError::NotStarted)?;

        let sender = self.sender.clone();
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.send(Job::Replay).await;
        });

        let mut delayed = self.delayed.lock();
        delayed.retain(|t| !t.is_finished());
        delayed.push(task);
        debug!(delay_ms = delay.as_millis() as u64, "Scheduled replay");
        Ok(())
    }

    /// Run a replay pass now on the blocking pool and wait for it.
    ///
    /// Files a live submission is still sending are left to that submission.
    pub async fn replay_now(&self) -> WorkerResult<ReplaySummary> {
        if self.is_shut_down() {
            return Err(WorkerError::ShutDown);
        }
        let shared = Arc::clone(&self.shared);
        let summary = tokio::task::spawn_blocking(move || shared.replay()).await?;
        Ok(summary)
    }

    /// High-priority replay for SDK init, bounded by `timeout`.
    pub fn replay_on_startup(&self, timeout: Duration) -> Option<ReplaySummary> {
        self.shared
            .context
            .replay_on_startup(Arc::clone(&self.shared.submitter), timeout)
    }

    /// Stop the worker.
    ///
    /// Cancels delayed replays, persists queued submissions and resolves
    /// them as cancelled, waits up to the configured timeout for the job in
    /// progress, then cancels every handle still pending. Never fails.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let delayed: Vec<_> = self.delayed.lock().drain(..).collect();
        for task in &delayed {
            task.abort();
        }

        self.stop.notify_one();
        let task = self.task.lock().take();
        if let Some(mut task) = task {
            let finished = tokio::time::timeout(self.config.shutdown_timeout, &mut task).await;
            match finished {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Delivery worker task failed"),
                Err(_) => {
                    warn!(
                        timeout_ms = self.config.shutdown_timeout.as_millis() as u64,
                        "Delivery worker did not stop in time, aborting"
                    );
                    task.abort();
                    // Wait for the task to drop so its receiver is handed back
                    let _ = task.await;
                }
            }
        }

        // Jobs never picked up, either because the worker never started or
        // because its task was aborted
        let receiver = self.receiver.lock().take();
        if let Some(mut receiver) = receiver {
            drain(&self.shared, &mut receiver);
        }

        let cancelled = self.shared.cancel_all();
        info!(
            cancelled,
            delayed = delayed.len(),
            "Delivery worker shut down"
        );
    }
}

impl Drop for DeliveryWorker {
    fn drop(&mut self) {
        for task in self.delayed.get_mut().drain(..) {
            task.abort();
        }
        self.stop.notify_one();
        self.shared.cancel_all();
    }
}

async fn run_job(shared: &Arc<Shared>, job: Job) {
    match job {
        Job::Submit { envelope, handle } => {
            let worker = Arc::clone(shared);
            let job_handle = Arc::clone(&handle);
            let result =
                tokio::task::spawn_blocking(move || worker.deliver(envelope, &job_handle)).await;
            match result {
                Ok(outcome) => {
                    debug!(handle_id = handle.id(), outcome = %outcome, "Submission finished");
                    shared.finish(&handle, outcome);
                }
                Err(e) => {
                    error!(handle_id = handle.id(), error = %e, "Submission job failed");
                    shared.finish_cancelled(&handle);
                }
            }
        }
        Job::Replay => {
            let worker = Arc::clone(shared);
            if let Err(e) = tokio::task::spawn_blocking(move || worker.replay()).await {
                error!(error = %e, "Replay job failed");
            }
        }
    }
}

/// Close the channel and settle whatever is still in it.
fn drain(shared: &Shared, receiver: &mut mpsc::Receiver<Job>) -> usize {
    receiver.close();
    let mut drained = 0;
    while let Ok(job) = receiver.try_recv() {
        if let Job::Submit { envelope, handle } = job {
            shared.persist_and_cancel(envelope, &handle);
            drained += 1;
        }
    }
    drained
}
