use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::retry::{RetryDecision, RetryPolicy};
use super::types::{AnalysisJob, DeadLetter, JobEnvelope, JobHandler, PoolStats, ShutdownReport};

const SHUTDOWN_REASON: &str = "worker pool shut down before the job could run";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Worker pool is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Jobs executing at once, across all sessions
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Default)]
struct Counters {
    submitted: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    retried: AtomicUsize,
    dead_lettered: AtomicUsize,
    active: AtomicUsize,
    pending: AtomicUsize,
}

struct Shared {
    handler: Arc<dyn JobHandler>,
    policy: RetryPolicy,
    permits: Arc<Semaphore>,
    queue: mpsc::UnboundedSender<JobEnvelope>,
    /// One lock per session so a session never runs twice at once
    session_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    dead_letters: Mutex<Vec<DeadLetter>>,
    counters: Counters,
    idle: Notify,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn session_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        guard(&self.session_locks)
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    /// Drop the session's lock once nobody holds or waits on it
    fn release_session(&self, session_id: &str) {
        let mut locks = guard(&self.session_locks);
        if locks
            .get(session_id)
            .is_some_and(|l| Arc::strong_count(l) == 1)
        {
            locks.remove(session_id);
        }
    }

    fn finish(&self) {
        if self.counters.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn dead_letter(&self, job: AnalysisJob, attempts: u32, reason: String) {
        error!(
            session_id = %job.session_id,
            iteration = ?job.iteration,
            attempts,
            reason = %reason,
            "job moved to dead-letter list"
        );
        guard(&self.dead_letters).push(DeadLetter {
            job,
            attempts,
            reason,
            failed_at: Utc::now(),
        });
        self.counters.dead_lettered.fetch_add(1, Ordering::SeqCst);
        self.finish();
    }

    fn stats(&self) -> PoolStats {
        let c = &self.counters;
        PoolStats {
            submitted: c.submitted.load(Ordering::SeqCst),
            completed: c.completed.load(Ordering::SeqCst),
            failed: c.failed.load(Ordering::SeqCst),
            retried: c.retried.load(Ordering::SeqCst),
            dead_lettered: c.dead_lettered.load(Ordering::SeqCst),
            active: c.active.load(Ordering::SeqCst),
            pending: c.pending.load(Ordering::SeqCst),
        }
    }
}

/// Bounded pool of analysis workers fed from an in-process queue.
///
/// At most `concurrency` jobs execute at once and jobs for the same session
/// run one after another. Failed jobs are re-queued with exponential backoff
/// until the retry policy gives up, then kept on a dead-letter list.
pub struct WorkerPool {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl WorkerPool {
    /// Start the dispatcher. Must be called inside a tokio runtime.
    pub fn start(handler: Arc<dyn JobHandler>, config: PoolConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let concurrency = config.concurrency.max(1);
        let shared = Arc::new(Shared {
            handler,
            policy: config.retry,
            permits: Arc::new(Semaphore::new(concurrency)),
            queue: tx,
            session_locks: Mutex::new(HashMap::new()),
            dead_letters: Mutex::new(Vec::new()),
            counters: Counters::default(),
            idle: Notify::new(),
        });
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        tracker.spawn(dispatch(rx, shared.clone(), cancel.clone(), tracker.clone()));
        info!(
            concurrency,
            max_retries = config.retry.max_retries,
            "worker pool started"
        );

        Self {
            shared,
            cancel,
            tracker,
        }
    }

    pub fn submit(&self, job: AnalysisJob) -> Result<(), PoolError> {
        if self.cancel.is_cancelled() {
            return Err(PoolError::ShuttingDown);
        }
        let counters = &self.shared.counters;
        counters.pending.fetch_add(1, Ordering::SeqCst);
        counters.submitted.fetch_add(1, Ordering::SeqCst);

        debug!(session_id = %job.session_id, iteration = ?job.iteration, "job queued");
        if self.shared.queue.send(JobEnvelope { job, attempt: 0 }).is_err() {
            counters.pending.fetch_sub(1, Ordering::SeqCst);
            counters.submitted.fetch_sub(1, Ordering::SeqCst);
            return Err(PoolError::ShuttingDown);
        }
        Ok(())
    }

    /// Resolves once every accepted job has completed or been dead-lettered
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.counters.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        guard(&self.shared.dead_letters).clone()
    }

    /// Stop taking jobs and wait up to `grace` for running ones.
    ///
    /// Jobs that have not started, and retries still backing off, are
    /// dead-lettered straight away. Running jobs are not interrupted; when
    /// the grace period runs out they are abandoned and `clean` is false.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        info!(
            grace_secs = grace.as_secs(),
            active = self.shared.counters.active.load(Ordering::SeqCst),
            "shutting down worker pool"
        );
        self.cancel.cancel();
        self.tracker.close();

        let clean = tokio::select! {
            _ = self.tracker.wait() => {
                info!("all workers finished");
                true
            }
            _ = tokio::time::sleep(grace) => {
                warn!(remaining = self.tracker.len(), "grace period elapsed with jobs still running");
                false
            }
        };

        ShutdownReport {
            clean,
            stats: self.stats(),
        }
    }
}

async fn dispatch(
    mut rx: mpsc::UnboundedReceiver<JobEnvelope>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(envelope) => {
                    tracker.spawn(execute(envelope, shared.clone(), cancel.clone()));
                }
                None => break,
            },
        }
    }

    rx.close();
    while let Ok(envelope) = rx.try_recv() {
        shared.dead_letter(envelope.job, envelope.attempt, SHUTDOWN_REASON.to_string());
    }
    debug!("dispatcher stopped");
}

async fn execute(envelope: JobEnvelope, shared: Arc<Shared>, cancel: CancellationToken) {
    let JobEnvelope { job, attempt } = envelope;
    let session_id = job.session_id.clone();

    let lock = shared.session_lock(&session_id);
    let slot = tokio::select! {
        _ = cancel.cancelled() => None,
        slot = async {
            let session = lock.clone().lock_owned().await;
            let permit = shared.permits.clone().acquire_owned().await;
            permit.ok().map(|p| (session, p))
        } => slot,
    };
    drop(lock);

    let Some((session, permit)) = slot else {
        shared.release_session(&session_id);
        shared.dead_letter(job, attempt, SHUTDOWN_REASON.to_string());
        return;
    };

    let counters = &shared.counters;
    counters.active.fetch_add(1, Ordering::SeqCst);
    info!(session_id = %job.session_id, iteration = ?job.iteration, attempt, "job started");
    let result = shared.handler.handle(&job).await;
    counters.active.fetch_sub(1, Ordering::SeqCst);

    drop(permit);
    drop(session);
    shared.release_session(&session_id);

    let err = match result {
        Ok(()) => {
            counters.completed.fetch_add(1, Ordering::SeqCst);
            info!(session_id = %job.session_id, attempt, "job completed");
            shared.finish();
            return;
        }
        Err(e) => e,
    };

    counters.failed.fetch_add(1, Ordering::SeqCst);
    let reason = format!("{err:#}");

    match shared.policy.decide(attempt) {
        RetryDecision::Retry { attempt: next, delay } => {
            warn!(
                session_id = %job.session_id,
                attempt,
                retry_in_ms = delay.as_millis() as u64,
                error = %reason,
                "job failed, scheduling retry"
            );
            counters.retried.fetch_add(1, Ordering::SeqCst);

            tokio::select! {
                _ = cancel.cancelled() => {
                    shared.dead_letter(job, attempt + 1, reason);
                }
                _ = tokio::time::sleep(delay) => {
                    if let Err(mpsc::error::SendError(envelope)) =
                        shared.queue.send(JobEnvelope { job, attempt: next })
                    {
                        shared.dead_letter(envelope.job, next, SHUTDOWN_REASON.to_string());
                    }
                }
            }
        }
        RetryDecision::DeadLetter => {
            shared.dead_letter(job, attempt + 1, reason);
        }
    }
}
