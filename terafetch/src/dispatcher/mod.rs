//! Bounded worker pool accepting and running transfer jobs.
//!
//! Submissions flow through a bounded queue into a fixed set of worker
//! tasks; a full queue is an explicit rejection, never a silent drop.
//! The dispatcher assigns job ids, registers the job as `Pending` before
//! queueing (so an id returned to a caller is immediately queryable), and
//! keeps a per-job cancellation token that the cancel path and process
//! shutdown both feed into.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::progress::{JobId, ProgressStore};
use crate::transfer::{TransferOrchestrator, TransferRequest};

/// Default number of concurrent jobs.
pub const DEFAULT_WORKER_COUNT: usize = 5;

/// Default queued submissions beyond the running jobs.
pub const DEFAULT_QUEUE_CAPACITY: usize = 20;

/// Default wall-clock ceiling per job (12 hours, sized for a terabyte on
/// a slow link).
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(12 * 60 * 60);

/// Worker pool configuration.
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Number of worker tasks (concurrent jobs).
    pub worker_count: usize,

    /// Queue capacity beyond the running jobs.
    pub queue_capacity: usize,

    /// Wall-clock ceiling for a single job.
    pub job_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            job_timeout: DEFAULT_JOB_TIMEOUT,
        }
    }
}

/// Submission failures. Both are reported to the caller; a job is never
/// dropped without an answer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// The queue is at capacity.
    #[error("download queue is full")]
    QueueFull,

    /// The dispatcher has shut down.
    #[error("dispatcher is shut down")]
    Shutdown,
}

/// Outcome of a cancellation request.
#[derive(Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was live and has been asked to stop.
    Requested,
    /// No such job is known (or it was evicted).
    NotFound,
    /// The job already reached a terminal status.
    AlreadyTerminal,
}

struct QueuedJob {
    id: JobId,
    request: TransferRequest,
    cancel: CancellationToken,
}

/// Accepts transfer requests and runs them on the worker pool.
pub struct JobDispatcher {
    progress: Arc<ProgressStore>,
    queue_tx: mpsc::Sender<QueuedJob>,
    cancellations: Arc<DashMap<JobId, CancellationToken>>,
    workers: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl JobDispatcher {
    /// Starts the worker pool.
    ///
    /// Workers stop when `shutdown` is cancelled; per-job tokens are
    /// children of it, so shutdown also aborts running jobs through the
    /// regular cancellation path.
    pub fn start(
        orchestrator: Arc<TransferOrchestrator>,
        progress: Arc<ProgressStore>,
        config: DispatcherConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel::<QueuedJob>(config.queue_capacity.max(1));
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        let cancellations: Arc<DashMap<JobId, CancellationToken>> = Arc::new(DashMap::new());

        let workers = (0..config.worker_count.max(1))
            .map(|worker| {
                let orchestrator = Arc::clone(&orchestrator);
                let progress = Arc::clone(&progress);
                let queue_rx = Arc::clone(&queue_rx);
                let cancellations = Arc::clone(&cancellations);
                let shutdown = shutdown.clone();
                let job_timeout = config.job_timeout;

                tokio::spawn(async move {
                    debug!(worker, "transfer worker started");
                    loop {
                        let job = tokio::select! {
                            job = async { queue_rx.lock().await.recv().await } => job,
                            _ = shutdown.cancelled() => None,
                        };
                        let Some(job) = job else { break };

                        run_job(&orchestrator, &progress, job_timeout, &job).await;
                        cancellations.remove(&job.id);
                    }
                    debug!(worker, "transfer worker stopped");
                })
            })
            .collect();

        info!(
            workers = config.worker_count.max(1),
            queue_capacity = config.queue_capacity.max(1),
            "job dispatcher started"
        );

        Self {
            progress,
            queue_tx,
            cancellations,
            workers,
            shutdown,
        }
    }

    /// Accepts a transfer request, returning its new job id.
    ///
    /// The job is visible as `Pending` in the progress store before this
    /// returns. A full queue rolls the registration back and reports
    /// [`DispatchError::QueueFull`].
    pub fn submit(&self, request: TransferRequest) -> Result<JobId, DispatchError> {
        let id = JobId::new();
        let cancel = self.shutdown.child_token();

        self.progress
            .register_pending(id.clone(), &request.source_key, &request.destination_name);
        self.cancellations.insert(id.clone(), cancel.clone());

        let queued = QueuedJob {
            id: id.clone(),
            request,
            cancel,
        };
        match self.queue_tx.try_send(queued) {
            Ok(()) => {
                info!(job_id = %id, "transfer queued");
                Ok(id)
            }
            Err(err) => {
                self.cancellations.remove(&id);
                self.progress.fail(&id, "rejected: download queue full");
                match err {
                    mpsc::error::TrySendError::Full(_) => {
                        warn!(job_id = %id, "download queue full, submission rejected");
                        Err(DispatchError::QueueFull)
                    }
                    mpsc::error::TrySendError::Closed(_) => Err(DispatchError::Shutdown),
                }
            }
        }
    }

    /// Requests cancellation of a live job.
    pub fn cancel(&self, id: &JobId) -> CancelOutcome {
        let Some(job) = self.progress.get(id) else {
            return CancelOutcome::NotFound;
        };
        if job.status.is_terminal() {
            return CancelOutcome::AlreadyTerminal;
        }

        match self.cancellations.get(id) {
            Some(token) => {
                token.cancel();
                info!(job_id = %id, "cancellation requested");
                CancelOutcome::Requested
            }
            // Live record with no token: the worker finished the handoff
            // race; treat it as terminal-bound.
            None => CancelOutcome::AlreadyTerminal,
        }
    }

    /// Stops accepting work and waits for the workers to exit.
    ///
    /// Running jobs are cancelled through their tokens and record
    /// themselves as failed before the workers finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        drop(self.queue_tx);
        for worker in self.workers {
            let _ = worker.await;
        }
        info!("job dispatcher stopped");
    }
}

/// Runs one job under the wall-clock ceiling.
///
/// On deadline the job is failed with a timeout message first, then its
/// token is cancelled; the orchestrator's cooperative abort then runs the
/// regular cleanup path (its own `fail` call no-ops against the sticky
/// terminal status).
async fn run_job(
    orchestrator: &TransferOrchestrator,
    progress: &ProgressStore,
    job_timeout: Duration,
    job: &QueuedJob,
) {
    let run = orchestrator.run(&job.id, &job.request, &job.cancel);
    tokio::pin!(run);

    tokio::select! {
        _ = &mut run => {}
        _ = tokio::time::sleep(job_timeout) => {
            warn!(job_id = %job.id, timeout_secs = job_timeout.as_secs(), "job exceeded wall-clock ceiling");
            progress.fail(
                &job.id,
                format!("timed out after {}s", job_timeout.as_secs()),
            );
            job.cancel.cancel();
            let _ = run.await;
        }
    }
}
