//! End-to-end orchestration of a single transfer job.
//!
//! The orchestrator drives one job through its whole lifecycle: resolve
//! source metadata, create the staging file, fetch the chunk plan,
//! validate, then atomically promote the staging file to its final path.
//! Every failure path funnels through one cleanup routine that deletes
//! the staging file (best effort) and records the terminal status in the
//! progress store — the destination path is only ever touched by the
//! final atomic rename.

mod error;

pub use error::TransferError;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::chunk::{plan_chunks, ChunkRange};
use crate::fetcher::{ChunkFetcher, RetryPolicy, DEFAULT_BUFFER_SIZE};
use crate::progress::{JobId, ProgressStore, TransferStatus};
use crate::provider::ObjectStore;

/// Default chunk size (100 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 100 * 1024 * 1024;

/// Default number of ranges fetched concurrently within one job.
pub const DEFAULT_PARALLEL_RANGES: usize = 4;

/// Default progress log cadence (1 GiB); affects log volume only.
pub const DEFAULT_PROGRESS_LOG_INTERVAL: u64 = 1024 * 1024 * 1024;

/// Suffix appended to the destination name for the staging file.
const STAGING_SUFFIX: &str = ".tmp";

/// Engine-level tuning for transfers.
#[derive(Clone, Debug)]
pub struct TransferOptions {
    /// Final destination directory.
    pub base_dir: PathBuf,

    /// Writable staging directory for in-flight files.
    pub staging_dir: PathBuf,

    /// Byte-range size of each chunk.
    pub chunk_size: u64,

    /// Maximum ranges in flight per job; 1 means strictly sequential.
    pub parallel_ranges: usize,

    /// Write buffer size per in-flight range.
    pub buffer_size: usize,

    /// Retry schedule for chunk fetches.
    pub retry: RetryPolicy,

    /// Run the validation pass after all chunks are written.
    pub verify_integrity: bool,

    /// Emit a progress log line every this many bytes.
    pub progress_log_interval: u64,
}

impl TransferOptions {
    /// Creates options for the given directories with defaults elsewhere.
    pub fn new(base_dir: impl Into<PathBuf>, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            staging_dir: staging_dir.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            parallel_ranges: DEFAULT_PARALLEL_RANGES,
            buffer_size: DEFAULT_BUFFER_SIZE,
            retry: RetryPolicy::default(),
            verify_integrity: true,
            progress_log_interval: DEFAULT_PROGRESS_LOG_INTERVAL,
        }
    }

    /// Sets the chunk size.
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Sets the intra-job parallelism bound.
    pub fn with_parallel_ranges(mut self, parallel_ranges: usize) -> Self {
        self.parallel_ranges = parallel_ranges;
        self
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Enables or disables the validation pass.
    pub fn with_verify_integrity(mut self, verify: bool) -> Self {
        self.verify_integrity = verify;
        self
    }
}

/// One transfer request, as accepted by the dispatcher.
#[derive(Clone, Debug)]
pub struct TransferRequest {
    /// Source object key in the configured bucket.
    pub source_key: String,

    /// File name under the destination base directory.
    pub destination_name: String,

    /// Optional expected SHA-256 of the whole object (lowercase hex).
    /// When present and integrity checking is on, the staged file is
    /// hashed and compared before promotion.
    pub expected_sha256: Option<String>,
}

/// Drives single jobs end to end. One orchestrator serves all jobs; each
/// `run` call owns its job's staging file exclusively for the job's
/// lifetime.
pub struct TransferOrchestrator {
    store: Arc<dyn ObjectStore>,
    progress: Arc<ProgressStore>,
    fetcher: ChunkFetcher,
    options: TransferOptions,
}

impl TransferOrchestrator {
    /// Creates an orchestrator over the given store and progress registry.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        progress: Arc<ProgressStore>,
        options: TransferOptions,
    ) -> Self {
        let fetcher = ChunkFetcher::new(Arc::clone(&store), options.retry, options.buffer_size);
        Self {
            store,
            progress,
            fetcher,
            options,
        }
    }

    /// Runs one job to a terminal state.
    ///
    /// The outcome is always recorded in the progress store; the returned
    /// result exists for callers (and tests) that want the error value
    /// itself. On any failure the staging file is deleted best-effort.
    pub async fn run(
        &self,
        id: &JobId,
        request: &TransferRequest,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let staging_path = self.staging_path(&request.destination_name);

        match self.execute(id, request, &staging_path, cancel).await {
            Ok(total) => {
                self.progress.complete(id);
                info!(
                    job_id = %id,
                    source_key = %request.source_key,
                    total_bytes = total,
                    "transfer completed"
                );
                Ok(())
            }
            Err(err) => {
                if err.is_cancelled() {
                    info!(job_id = %id, "transfer cancelled");
                } else {
                    error!(job_id = %id, error = %err, "transfer failed");
                }
                self.cleanup_staging(&staging_path).await;
                self.progress.fail(id, err.to_string());
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        id: &JobId,
        request: &TransferRequest,
        staging_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, TransferError> {
        // 1. Resolve source metadata.
        let metadata = tokio::select! {
            result = self.store.head(&request.source_key) => {
                result.map_err(TransferError::Metadata)?
            }
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
        };
        let total_size = metadata.content_length;
        info!(
            job_id = %id,
            source_key = %request.source_key,
            total_size,
            etag = metadata.etag.as_deref().unwrap_or("-"),
            "resolved source metadata"
        );

        // 2. Job becomes visible as Downloading with its real size.
        self.progress.register(
            id.clone(),
            &request.source_key,
            &request.destination_name,
            total_size,
        );

        // 3. Stage file, parents included.
        self.create_staging_file(staging_path).await?;

        // 4 & 5. Fetch the plan with bounded parallelism; each range
        // writes a disjoint offset, so no lock is needed on the file.
        let plan = plan_chunks(total_size, self.options.chunk_size);
        self.fetch_plan(id, &request.source_key, staging_path, plan, cancel)
            .await?;

        // 6. Validation pass.
        if self.options.verify_integrity {
            self.progress.update_status(id, TransferStatus::Validating);
            self.validate(staging_path, total_size, request.expected_sha256.as_deref())
                .await?;
        }

        // 7. Atomic promotion; the destination becomes visible only here.
        self.promote(staging_path, &request.destination_name).await?;

        Ok(total_size)
    }

    fn staging_path(&self, destination_name: &str) -> PathBuf {
        self.options
            .staging_dir
            .join(format!("{destination_name}{STAGING_SUFFIX}"))
    }

    async fn create_staging_file(&self, staging_path: &Path) -> Result<(), TransferError> {
        if let Some(parent) = staging_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(TransferError::Staging)?;
        }
        tokio::fs::File::create(staging_path)
            .await
            .map_err(TransferError::Staging)?;
        Ok(())
    }

    async fn fetch_plan(
        &self,
        id: &JobId,
        source_key: &str,
        staging_path: &Path,
        plan: Vec<ChunkRange>,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let total_chunks = plan.len();
        let parallelism = self.options.parallel_ranges.max(1);

        let mut completions = futures::stream::iter(plan.into_iter().map(|range| {
            let fetcher = &self.fetcher;
            async move {
                fetcher
                    .fetch_range(source_key, staging_path, range, cancel)
                    .await
                    .map(|_| range)
            }
        }))
        .buffer_unordered(parallelism);

        let log_interval = self.options.progress_log_interval.max(1);
        let mut completed_bytes = 0u64;
        let mut logged_intervals = 0u64;
        while let Some(result) = completions.next().await {
            // The first terminal chunk error aborts the job; dropping the
            // stream drops all in-flight range fetches with it.
            let range = result?;

            self.progress.add_bytes(id, range.len());
            completed_bytes += range.len();

            let intervals = completed_bytes / log_interval;
            if intervals > logged_intervals {
                logged_intervals = intervals;
                info!(
                    job_id = %id,
                    chunk = range.index,
                    total_chunks,
                    completed_bytes,
                    "transfer progress"
                );
            }
        }

        Ok(())
    }

    async fn validate(
        &self,
        staging_path: &Path,
        total_size: u64,
        expected_sha256: Option<&str>,
    ) -> Result<(), TransferError> {
        let staged_size = tokio::fs::metadata(staging_path)
            .await
            .map_err(|e| TransferError::Validation(format!("stat staged file: {e}")))?
            .len();

        if staged_size != total_size {
            return Err(TransferError::Validation(format!(
                "size mismatch: staged {staged_size} bytes, source reported {total_size}"
            )));
        }

        // Size-only validation is the baseline; a content digest runs only
        // when the caller supplied one.
        if let Some(expected) = expected_sha256 {
            let actual = hash_file(staging_path)
                .await
                .map_err(|e| TransferError::Validation(format!("hash staged file: {e}")))?;
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(TransferError::Validation(format!(
                    "sha256 mismatch: staged {actual}, expected {expected}"
                )));
            }
        }

        Ok(())
    }

    async fn promote(
        &self,
        staging_path: &Path,
        destination_name: &str,
    ) -> Result<(), TransferError> {
        let final_path = self.options.base_dir.join(destination_name);
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(TransferError::Promotion)?;
        }

        // Single rename so a partially written file is never visible at
        // the destination path. Requires staging and base directories on
        // the same filesystem.
        tokio::fs::rename(staging_path, &final_path)
            .await
            .map_err(TransferError::Promotion)?;

        info!(path = %final_path.display(), "staged file promoted");
        Ok(())
    }

    async fn cleanup_staging(&self, staging_path: &Path) {
        match tokio::fs::remove_file(staging_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                // Never masks the original failure.
                warn!(
                    path = %staging_path.display(),
                    error = %e,
                    "failed to remove staging file"
                );
            }
        }
    }
}

/// Streams a file through SHA-256, returning the lowercase hex digest.
async fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    use crate::provider::test_support::{FaultPlan, MockObjectStore};

    struct Fixture {
        _dir: tempfile::TempDir,
        base_dir: PathBuf,
        staging_dir: PathBuf,
        progress: Arc<ProgressStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let base_dir = dir.path().join("final");
            let staging_dir = dir.path().join("staging");
            Self {
                _dir: dir,
                base_dir,
                staging_dir,
                progress: Arc::new(ProgressStore::new()),
            }
        }

        fn orchestrator(&self, store: MockObjectStore, chunk_size: u64) -> TransferOrchestrator {
            let options = TransferOptions::new(&self.base_dir, &self.staging_dir)
                .with_chunk_size(chunk_size);
            TransferOrchestrator::new(Arc::new(store), Arc::clone(&self.progress), options)
        }

        fn staging_file(&self, name: &str) -> PathBuf {
            self.staging_dir.join(format!("{name}.tmp"))
        }

        fn final_file(&self, name: &str) -> PathBuf {
            self.base_dir.join(name)
        }
    }

    fn request(name: &str) -> TransferRequest {
        TransferRequest {
            source_key: "datasets/huge.bin".to_string(),
            destination_name: name.to_string(),
            expected_sha256: None,
        }
    }

    #[tokio::test]
    async fn test_multi_chunk_transfer_completes_and_promotes() {
        let data: Vec<u8> = (0..=255u8).cycle().take(2500).collect();
        let fx = Fixture::new();
        let orchestrator = fx.orchestrator(
            MockObjectStore::new().with_object("datasets/huge.bin", data.clone()),
            1000,
        );

        let id = JobId::new();
        orchestrator
            .run(&id, &request("huge.bin"), &CancellationToken::new())
            .await
            .unwrap();

        let job = fx.progress.get(&id).unwrap();
        assert_eq!(job.status, TransferStatus::Completed);
        assert_eq!(job.bytes_transferred, 2500);
        assert_eq!(job.total_size, 2500);
        assert!(job.completed_at.is_some());

        assert_eq!(tokio::fs::read(fx.final_file("huge.bin")).await.unwrap(), data);
        assert!(!fx.staging_file("huge.bin").exists());
    }

    #[tokio::test]
    async fn test_zero_length_object_completes_immediately() {
        let fx = Fixture::new();
        let orchestrator = fx.orchestrator(
            MockObjectStore::new().with_object("datasets/huge.bin", Vec::new()),
            1000,
        );

        let id = JobId::new();
        orchestrator
            .run(&id, &request("empty.bin"), &CancellationToken::new())
            .await
            .unwrap();

        let job = fx.progress.get(&id).unwrap();
        assert_eq!(job.status, TransferStatus::Completed);
        assert_eq!(job.bytes_transferred, 0);

        let final_file = fx.final_file("empty.bin");
        assert!(final_file.exists());
        assert_eq!(tokio::fs::metadata(final_file).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_missing_source_fails_with_metadata_error() {
        let fx = Fixture::new();
        let orchestrator = fx.orchestrator(MockObjectStore::new(), 1000);

        let id = JobId::new();
        fx.progress.register_pending(id.clone(), "datasets/huge.bin", "gone.bin");
        let err = orchestrator
            .run(&id, &request("gone.bin"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::Metadata(_)));
        let job = fx.progress.get(&id).unwrap();
        assert_eq!(job.status, TransferStatus::Failed);
        assert!(job.error_message.unwrap().contains("metadata lookup failed"));
        assert!(!fx.staging_file("gone.bin").exists());
        assert!(!fx.final_file("gone.bin").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poisoned_chunk_rolls_back_staging_and_destination() {
        let data = vec![9u8; 10_000];
        let fx = Fixture::new();
        let orchestrator = fx.orchestrator(
            MockObjectStore::new()
                .with_object("datasets/huge.bin", data)
                .with_fault(FaultPlan {
                    poisoned_chunk: Some(3),
                    ..FaultPlan::default()
                }),
            1000,
        );

        let id = JobId::new();
        let err = orchestrator
            .run(&id, &request("huge.bin"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            TransferError::ChunkTransfer { chunk_index: 3, .. }
        ));
        let job = fx.progress.get(&id).unwrap();
        assert_eq!(job.status, TransferStatus::Failed);
        assert!(job.error_message.unwrap().contains("chunk 3"));
        assert!(!fx.staging_file("huge.bin").exists());
        assert!(!fx.final_file("huge.bin").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_short_read_fails_job() {
        let data = vec![1u8; 1000];
        let fx = Fixture::new();
        let orchestrator = fx.orchestrator(
            MockObjectStore::new()
                .with_object("datasets/huge.bin", data)
                .with_fault(FaultPlan {
                    always_short: true,
                    ..FaultPlan::default()
                }),
            1000,
        );

        let id = JobId::new();
        let err = orchestrator
            .run(&id, &request("short.bin"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::ChunkTransfer { .. }));
        assert_eq!(
            fx.progress.get(&id).unwrap().status,
            TransferStatus::Failed
        );
        assert!(!fx.staging_file("short.bin").exists());
        assert!(!fx.final_file("short.bin").exists());
    }

    #[tokio::test]
    async fn test_cancellation_before_start_reports_cancelled() {
        let fx = Fixture::new();
        let orchestrator = fx.orchestrator(
            MockObjectStore::new().with_object("datasets/huge.bin", vec![0u8; 100]),
            10,
        );

        let cancel = CancellationToken::new();
        cancel.cancel();

        let id = JobId::new();
        fx.progress.register_pending(id.clone(), "datasets/huge.bin", "c.bin");
        let err = orchestrator
            .run(&id, &request("c.bin"), &cancel)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        let job = fx.progress.get(&id).unwrap();
        assert_eq!(job.status, TransferStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("transfer cancelled"));
        assert!(!fx.final_file("c.bin").exists());
    }

    #[tokio::test]
    async fn test_sha256_mismatch_fails_validation() {
        let data = vec![5u8; 500];
        let fx = Fixture::new();
        let orchestrator = fx.orchestrator(
            MockObjectStore::new().with_object("datasets/huge.bin", data),
            1000,
        );

        let mut req = request("hashed.bin");
        req.expected_sha256 = Some("deadbeef".repeat(8));

        let id = JobId::new();
        let err = orchestrator
            .run(&id, &req, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::Validation(_)));
        assert!(!fx.staging_file("hashed.bin").exists());
        assert!(!fx.final_file("hashed.bin").exists());
    }

    #[tokio::test]
    async fn test_sha256_match_passes_validation() {
        let data = b"terabytes in theory, kilobytes in tests".to_vec();
        let digest = {
            let mut hasher = Sha256::new();
            hasher.update(&data);
            format!("{:x}", hasher.finalize())
        };

        let fx = Fixture::new();
        let orchestrator = fx.orchestrator(
            MockObjectStore::new().with_object("datasets/huge.bin", data.clone()),
            16,
        );

        let mut req = request("hashed.bin");
        req.expected_sha256 = Some(digest);

        let id = JobId::new();
        orchestrator
            .run(&id, &req, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            tokio::fs::read(fx.final_file("hashed.bin")).await.unwrap(),
            data
        );
    }

    #[tokio::test]
    async fn test_promotion_overwrites_existing_destination() {
        let data = vec![42u8; 64];
        let fx = Fixture::new();
        let orchestrator = fx.orchestrator(
            MockObjectStore::new().with_object("datasets/huge.bin", data.clone()),
            32,
        );

        tokio::fs::create_dir_all(&fx.base_dir).await.unwrap();
        tokio::fs::write(fx.final_file("existing.bin"), b"stale contents")
            .await
            .unwrap();

        let id = JobId::new();
        orchestrator
            .run(&id, &request("existing.bin"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            tokio::fs::read(fx.final_file("existing.bin")).await.unwrap(),
            data
        );
    }

    #[tokio::test]
    async fn test_sequential_mode_transfers_in_plan_order() {
        let data: Vec<u8> = (0..100u8).collect();
        let fx = Fixture::new();
        let options = TransferOptions::new(&fx.base_dir, &fx.staging_dir)
            .with_chunk_size(10)
            .with_parallel_ranges(1);
        let orchestrator = TransferOrchestrator::new(
            Arc::new(MockObjectStore::new().with_object("datasets/huge.bin", data.clone())),
            Arc::clone(&fx.progress),
            options,
        );

        let id = JobId::new();
        orchestrator
            .run(&id, &request("seq.bin"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(tokio::fs::read(fx.final_file("seq.bin")).await.unwrap(), data);
    }
}
