//! Concurrency-safe registry of transfer job state.
//!
//! The [`ProgressStore`] is the single piece of state shared between job
//! tasks and the status-query path. All mutation goes through its API;
//! nothing outside this module ever holds a mutable job record. Records
//! are created when a job is accepted, frozen at a terminal status, and
//! removed only by the time-based eviction sweep — completed and failed
//! jobs stay queryable until they age out.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Default retention for terminal job records (24 hours).
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Default interval between eviction sweeps (5 minutes).
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Opaque job identifier, assigned once at job creation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generates a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wraps an identifier received from a client (status queries, cancel).
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a transfer job.
///
/// Legal transitions: `Pending → Downloading → Validating → Completed`,
/// with `Downloading`/`Validating → Failed` on any unrecoverable error.
/// Nothing ever leaves `Completed` or `Failed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    /// Accepted, metadata not yet resolved.
    Pending,
    /// Chunks are being fetched.
    Downloading,
    /// All chunks written, integrity check in progress.
    Validating,
    /// Promoted to the final destination.
    Completed,
    /// Terminally failed; see `error_message`.
    Failed,
}

impl TransferStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One in-flight or completed transfer, as tracked by the store.
#[derive(Clone, Debug)]
pub struct TransferJob {
    /// Unique identifier, immutable.
    pub id: JobId,
    /// Source object key, immutable.
    pub source_key: String,
    /// Destination file name, immutable.
    pub destination_name: String,
    /// Total object size in bytes; 0 until metadata resolves.
    pub total_size: u64,
    /// Bytes written so far; monotonic while in progress, frozen at a
    /// terminal status.
    pub bytes_transferred: u64,
    /// Current lifecycle state.
    pub status: TransferStatus,
    /// When the job was accepted.
    pub started_at: DateTime<Utc>,
    /// Last mutation through the store API.
    pub last_updated_at: DateTime<Utc>,
    /// Set exactly once, when the job reaches a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Human-readable failure cause; set only on `Failed`.
    pub error_message: Option<String>,
}

impl TransferJob {
    fn new(
        id: JobId,
        source_key: String,
        destination_name: String,
        total_size: u64,
        status: TransferStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            source_key,
            destination_name,
            total_size,
            bytes_transferred: 0,
            status,
            started_at: now,
            last_updated_at: now,
            completed_at: None,
            error_message: None,
        }
    }

    /// Fraction of the transfer completed, as a percentage.
    ///
    /// 0 while the total size is unknown.
    pub fn progress_percent(&self) -> f64 {
        if self.total_size == 0 {
            0.0
        } else {
            self.bytes_transferred as f64 / self.total_size as f64 * 100.0
        }
    }

    /// Mean transfer rate in bytes per second since the job started.
    ///
    /// 0 before a full second has elapsed.
    pub fn bytes_per_second(&self) -> u64 {
        let elapsed = (self.last_updated_at - self.started_at).num_seconds();
        if elapsed > 0 {
            self.bytes_transferred / elapsed as u64
        } else {
            0
        }
    }

    /// Builds the wire-format snapshot, including derived fields.
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            download_id: self.id.clone(),
            source_key: self.source_key.clone(),
            destination_name: self.destination_name.clone(),
            total_size: self.total_size,
            bytes_transferred: self.bytes_transferred,
            status: self.status,
            started_at: self.started_at,
            last_updated_at: self.last_updated_at,
            completed_at: self.completed_at,
            error_message: self.error_message.clone(),
            progress_percent: self.progress_percent(),
            bytes_per_second: self.bytes_per_second(),
        }
    }
}

/// Point-in-time view of a job, serialized for the status endpoints.
///
/// `progress_percent` and `bytes_per_second` are computed at snapshot
/// time, never stored.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub download_id: JobId,
    pub source_key: String,
    pub destination_name: String,
    pub total_size: u64,
    pub bytes_transferred: u64,
    pub status: TransferStatus,
    pub started_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub progress_percent: f64,
    pub bytes_per_second: u64,
}

/// Registry of all known transfer jobs.
///
/// Backed by a sharded concurrent map; every method takes `&self` and is
/// safe to call from any task, including concurrently with the sweeper.
/// Mutations of a single record happen under that record's shard lock, so
/// a sweep can never observe (or evict) a half-applied update.
#[derive(Default)]
pub struct ProgressStore {
    jobs: DashMap<JobId, TransferJob>,
}

impl ProgressStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an accepted job before its metadata is resolved.
    ///
    /// The record is immediately queryable with status `Pending` and an
    /// unknown (zero) total size.
    pub fn register_pending(&self, id: JobId, source_key: &str, destination_name: &str) {
        let job = TransferJob::new(
            id.clone(),
            source_key.to_string(),
            destination_name.to_string(),
            0,
            TransferStatus::Pending,
        );
        self.jobs.insert(id, job);
    }

    /// Registers a job whose metadata has resolved, moving it to
    /// `Downloading` with the final total size.
    ///
    /// Overwrites any prior record with the same id; ids are unique per
    /// job, so this only replaces the `Pending` placeholder.
    pub fn register(&self, id: JobId, source_key: &str, destination_name: &str, total_size: u64) {
        // Keep the original start time if the pending placeholder exists,
        // so rate calculations cover the whole job.
        let started_at = self.jobs.get(&id).map(|j| j.started_at);

        let mut job = TransferJob::new(
            id.clone(),
            source_key.to_string(),
            destination_name.to_string(),
            total_size,
            TransferStatus::Downloading,
        );
        if let Some(started_at) = started_at {
            job.started_at = started_at;
        }

        debug!(job_id = %id, total_size, "registered transfer");
        self.jobs.insert(id, job);
    }

    /// Sets the absolute byte count for a job.
    ///
    /// Monotonic: a value lower than the current count is ignored, so
    /// out-of-order reports can never make progress regress. No-op for
    /// unknown ids and terminal jobs.
    pub fn update_bytes(&self, id: &JobId, bytes_transferred: u64) {
        if let Some(mut job) = self.jobs.get_mut(id) {
            if job.status.is_terminal() {
                return;
            }
            job.bytes_transferred = job.bytes_transferred.max(bytes_transferred);
            job.last_updated_at = Utc::now();
        }
    }

    /// Adds the length of a completed segment to the byte count.
    ///
    /// This is the update path for concurrent range completions: each
    /// segment is added exactly once under the record lock, so the total
    /// is always increasing regardless of completion order.
    pub fn add_bytes(&self, id: &JobId, delta: u64) {
        if let Some(mut job) = self.jobs.get_mut(id) {
            if job.status.is_terminal() {
                return;
            }
            job.bytes_transferred = job.bytes_transferred.saturating_add(delta);
            job.last_updated_at = Utc::now();
        }
    }

    /// Moves a job to an intermediate status such as `Validating`.
    ///
    /// Refuses to overwrite a terminal status. No-op for unknown ids.
    pub fn update_status(&self, id: &JobId, status: TransferStatus) {
        if let Some(mut job) = self.jobs.get_mut(id) {
            if job.status.is_terminal() {
                return;
            }
            job.status = status;
            job.last_updated_at = Utc::now();
        }
    }

    /// Marks a job `Completed` and stamps `completed_at`.
    pub fn complete(&self, id: &JobId) {
        if let Some(mut job) = self.jobs.get_mut(id) {
            if job.status.is_terminal() {
                return;
            }
            let now = Utc::now();
            job.status = TransferStatus::Completed;
            job.last_updated_at = now;
            job.completed_at = Some(now);
        }
    }

    /// Marks a job `Failed` with a cause and stamps `completed_at`.
    pub fn fail(&self, id: &JobId, message: impl Into<String>) {
        if let Some(mut job) = self.jobs.get_mut(id) {
            if job.status.is_terminal() {
                return;
            }
            let now = Utc::now();
            job.status = TransferStatus::Failed;
            job.error_message = Some(message.into());
            job.last_updated_at = now;
            job.completed_at = Some(now);
        }
    }

    /// Returns a snapshot of one job, or `None` if unknown or evicted.
    pub fn get(&self, id: &JobId) -> Option<TransferJob> {
        self.jobs.get(id).map(|j| j.clone())
    }

    /// Returns a point-in-time copy of every known job.
    ///
    /// Callers never observe a returned record mutate afterwards.
    pub fn list_all(&self) -> HashMap<JobId, TransferJob> {
        self.jobs
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Removes terminal records whose `completed_at` is older than
    /// `retention`. In-flight jobs (no `completed_at`) are never evicted.
    ///
    /// Returns the number of records removed.
    pub fn sweep(&self, retention: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let before = self.jobs.len();

        self.jobs
            .retain(|_, job| !matches!(job.completed_at, Some(done) if done < cutoff));

        let removed = before - self.jobs.len();
        if removed > 0 {
            info!(removed, "evicted stale transfer records");
        }
        removed
    }

    /// Spawns the periodic eviction sweeper.
    ///
    /// Runs `sweep(retention)` every `interval` until `shutdown` is
    /// cancelled, independent of job activity.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        retention: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The immediate first tick would sweep an empty store.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        store.sweep(retention);
                    }
                    _ = shutdown.cancelled() => {
                        debug!("progress sweeper stopping");
                        break;
                    }
                }
            }
        })
    }

    #[cfg(test)]
    pub(crate) fn insert_raw(&self, job: TransferJob) {
        self.jobs.insert(job.id.clone(), job);
    }
}
