//! Retrying fetch of a single byte range into the staging file.
//!
//! One fetch attempt is one ranged read streamed to the chunk's offset.
//! Attempts that deliver fewer (or more) bytes than requested are
//! failures; a short transfer is never accepted as partial success.
//! Failed attempts back off exponentially, capped, and every suspension
//! point races the job's cancellation token so an abort takes effect
//! within one chunk read.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter, SeekFrom};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::chunk::ChunkRange;
use crate::provider::ObjectStore;
use crate::transfer::TransferError;

/// Default maximum fetch attempts per chunk.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default write buffer size (1 MiB).
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

/// Base delay of the backoff schedule (1 second).
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Exponent cap: delays stop growing at `BACKOFF_BASE * 2^6` = 64s.
const BACKOFF_MAX_EXPONENT: u32 = 6;

/// Bounded-retry schedule with capped exponential backoff.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Maximum attempts per chunk (including the first).
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the given attempt ceiling.
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Delay before retry number `retry` (0-based).
    ///
    /// The schedule is 1s, 2s, 4s, 8s, 16s, 32s, 64s, 64s, ...
    pub fn delay_for(&self, retry: u32) -> Duration {
        BACKOFF_BASE * 2u32.pow(retry.min(BACKOFF_MAX_EXPONENT))
    }
}

/// Fetches single chunks with retry, backoff, and cancellation.
///
/// The fetcher is cheap to share across in-flight ranges of one job; each
/// call opens its own handle on the staging file, so concurrent fetches
/// of disjoint ranges never contend on a shared seek position.
pub struct ChunkFetcher {
    store: Arc<dyn ObjectStore>,
    policy: RetryPolicy,
    buffer_size: usize,
}

impl ChunkFetcher {
    /// Creates a fetcher over the given store.
    pub fn new(store: Arc<dyn ObjectStore>, policy: RetryPolicy, buffer_size: usize) -> Self {
        Self {
            store,
            policy,
            buffer_size,
        }
    }

    /// Writes exactly `range.len()` bytes of `source_key` at
    /// `range.start` of the staging file, or reports a terminal failure.
    ///
    /// Retries transient failures up to the policy's ceiling, sleeping
    /// between attempts. A failed attempt may leave garbage bytes in the
    /// destination range; the orchestrator discards the whole staging
    /// file on terminal failure, so that is acceptable.
    pub async fn fetch_range(
        &self,
        source_key: &str,
        staging_path: &Path,
        range: ChunkRange,
        cancel: &CancellationToken,
    ) -> Result<u64, TransferError> {
        let mut attempts = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }

            // The attempt itself is a suspension point: a cancel request
            // must not wait out a stalled read. An aborted attempt may
            // leave a partial write behind, which the job-level cleanup
            // discards.
            let outcome = tokio::select! {
                outcome = self.attempt(source_key, staging_path, range) => outcome,
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            };

            match outcome {
                Ok(written) => {
                    debug!(
                        chunk = range.index,
                        bytes = written,
                        attempts = attempts + 1,
                        "chunk fetched"
                    );
                    return Ok(written);
                }
                Err(message) => {
                    attempts += 1;
                    if attempts >= self.policy.max_retries {
                        warn!(
                            chunk = range.index,
                            attempts, "chunk failed, retries exhausted"
                        );
                        return Err(TransferError::ChunkTransfer {
                            chunk_index: range.index,
                            attempts,
                            message,
                        });
                    }

                    let delay = self.policy.delay_for(attempts - 1);
                    warn!(
                        chunk = range.index,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "chunk attempt failed, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                    }
                }
            }
        }
    }

    /// One fetch attempt: ranged read streamed to the chunk offset.
    async fn attempt(
        &self,
        source_key: &str,
        staging_path: &Path,
        range: ChunkRange,
    ) -> Result<u64, String> {
        let file = OpenOptions::new()
            .write(true)
            .open(staging_path)
            .await
            .map_err(|e| format!("open staging file: {e}"))?;

        let mut writer = BufWriter::with_capacity(self.buffer_size, file);
        writer
            .seek(SeekFrom::Start(range.start))
            .await
            .map_err(|e| format!("seek to {}: {e}", range.start))?;

        let mut stream = self
            .store
            .get_range(source_key, range)
            .await
            .map_err(|e| e.to_string())?;

        let expected = range.len();
        let mut written = 0u64;
        loop {
            let chunk = stream.next().await;
            match chunk {
                Some(Ok(bytes)) => {
                    written += bytes.len() as u64;
                    if written > expected {
                        return Err(format!(
                            "range over-delivered: expected {expected} bytes, got {written}"
                        ));
                    }
                    writer
                        .write_all(&bytes)
                        .await
                        .map_err(|e| format!("write chunk: {e}"))?;
                }
                Some(Err(e)) => return Err(e.to_string()),
                None => break,
            }
        }

        writer
            .flush()
            .await
            .map_err(|e| format!("flush chunk: {e}"))?;

        if written != expected {
            return Err(format!(
                "incomplete chunk transfer: expected {expected} bytes, got {written}"
            ));
        }

        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    use crate::provider::test_support::{FaultPlan, MockObjectStore};

    async fn staging_file(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("target.bin.tmp");
        tokio::fs::File::create(&path).await.unwrap();
        path
    }

    fn fetcher(store: MockObjectStore) -> (Arc<MockObjectStore>, ChunkFetcher) {
        let store = Arc::new(store);
        let fetcher = ChunkFetcher::new(
            Arc::clone(&store) as Arc<dyn ObjectStore>,
            RetryPolicy::default(),
            DEFAULT_BUFFER_SIZE,
        );
        (store, fetcher)
    }

    #[test]
    fn test_backoff_schedule_doubles_then_caps() {
        let policy = RetryPolicy::default();
        let secs: Vec<u64> = (0..9).map(|r| policy.delay_for(r).as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 32, 64, 64, 64]);
    }

    #[tokio::test]
    async fn test_fetch_writes_bytes_at_range_offset() {
        let data: Vec<u8> = (0..200u8).collect();
        let (_store, fetcher) = fetcher(MockObjectStore::new().with_object("key", data.clone()));

        let dir = tempdir().unwrap();
        let path = staging_file(&dir).await;
        let range = ChunkRange {
            index: 1,
            start: 100,
            end: 199,
        };

        let cancel = CancellationToken::new();
        let written = fetcher
            .fetch_range("key", &path, range, &cancel)
            .await
            .unwrap();
        assert_eq!(written, 100);

        let contents = tokio::fs::read(&path).await.unwrap();
        assert_eq!(contents.len(), 200);
        assert_eq!(&contents[100..], &data[100..]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_recover_with_expected_backoff() {
        let data = vec![7u8; 50];
        let (store, fetcher) = fetcher(
            MockObjectStore::new()
                .with_object("key", data)
                .with_fault(FaultPlan {
                    failures_before_success: 3,
                    ..FaultPlan::default()
                }),
        );

        let dir = tempdir().unwrap();
        let path = staging_file(&dir).await;
        let range = ChunkRange {
            index: 0,
            start: 0,
            end: 49,
        };

        let started = tokio::time::Instant::now();
        let cancel = CancellationToken::new();
        let written = fetcher
            .fetch_range("key", &path, range, &cancel)
            .await
            .unwrap();

        assert_eq!(written, 50);
        assert_eq!(store.range_calls(), 4);
        // Three backoffs: 1s + 2s + 4s.
        assert_eq!(started.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_stops_after_max_retries() {
        let (store, fetcher) = fetcher(MockObjectStore::new().with_fault(FaultPlan {
            failures_before_success: usize::MAX,
            ..FaultPlan::default()
        }));

        let dir = tempdir().unwrap();
        let path = staging_file(&dir).await;
        let range = ChunkRange {
            index: 2,
            start: 0,
            end: 9,
        };

        let started = tokio::time::Instant::now();
        let cancel = CancellationToken::new();
        let err = fetcher
            .fetch_range("missing", &path, range, &cancel)
            .await
            .unwrap_err();

        assert_eq!(store.range_calls(), DEFAULT_MAX_RETRIES as usize);
        // Four backoffs between five attempts: 1s + 2s + 4s + 8s.
        assert_eq!(started.elapsed(), Duration::from_secs(15));
        match err {
            TransferError::ChunkTransfer {
                chunk_index,
                attempts,
                ..
            } => {
                assert_eq!(chunk_index, 2);
                assert_eq!(attempts, DEFAULT_MAX_RETRIES);
            }
            other => panic!("expected ChunkTransfer, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_transfer_is_never_accepted() {
        let data = vec![1u8; 1000];
        let (store, fetcher) = fetcher(
            MockObjectStore::new()
                .with_object("key", data)
                .with_fault(FaultPlan {
                    always_short: true,
                    ..FaultPlan::default()
                }),
        );

        let dir = tempdir().unwrap();
        let path = staging_file(&dir).await;
        let range = ChunkRange {
            index: 0,
            start: 0,
            end: 999,
        };

        let cancel = CancellationToken::new();
        let err = fetcher
            .fetch_range("key", &path, range, &cancel)
            .await
            .unwrap_err();

        assert_eq!(store.range_calls(), DEFAULT_MAX_RETRIES as usize);
        match err {
            TransferError::ChunkTransfer { message, .. } => {
                assert!(message.contains("incomplete chunk transfer"), "{message}");
                assert!(message.contains("expected 1000"), "{message}");
                assert!(message.contains("got 999"), "{message}");
            }
            other => panic!("expected ChunkTransfer, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_backoff() {
        let (_store, fetcher) = fetcher(MockObjectStore::new().with_fault(FaultPlan {
            failures_before_success: usize::MAX,
            ..FaultPlan::default()
        }));

        let dir = tempdir().unwrap();
        let path = staging_file(&dir).await;
        let range = ChunkRange {
            index: 0,
            start: 0,
            end: 9,
        };

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            canceller.cancel();
        });

        let started = tokio::time::Instant::now();
        let err = fetcher
            .fetch_range("missing", &path, range, &cancel)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        // Aborted inside the first 1s backoff, not after the full schedule.
        assert_eq!(started.elapsed(), Duration::from_millis(500));
    }
}
