//! Service configuration.
//!
//! Typed settings with sensible defaults, loadable from an INI file.
//! Every tuning knob of the engine surfaces here; the conversion methods
//! at the bottom translate the file-level view into the engine-level
//! option structs so the wiring lives in one place.
//!
//! ```ini
//! [object_store]
//! bucket = archive
//! region = eu-west-1
//! endpoint = http://minio.local:9000
//!
//! [chunking]
//! chunk_size_bytes = 104857600
//! parallel_ranges = 4
//!
//! [destination]
//! base_dir = /mnt/nas/incoming
//! staging_dir = /mnt/nas/.staging
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use ini::Ini;
use thiserror::Error;

use crate::dispatcher::{DispatcherConfig, DEFAULT_JOB_TIMEOUT, DEFAULT_QUEUE_CAPACITY, DEFAULT_WORKER_COUNT};
use crate::fetcher::{RetryPolicy, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_RETRIES};
use crate::provider::{S3StoreConfig, DEFAULT_REQUEST_TIMEOUT_SECS};
use crate::transfer::{
    TransferOptions, DEFAULT_CHUNK_SIZE, DEFAULT_PARALLEL_RANGES, DEFAULT_PROGRESS_LOG_INTERVAL,
};

/// Default bind address for the HTTP API.
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8080";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read or parsed.
    #[error("failed to load config file: {0}")]
    Load(String),

    /// A value failed validation.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Object store connection settings.
#[derive(Clone, Debug)]
pub struct ObjectStoreConfig {
    /// Bucket holding the source objects.
    pub bucket: String,
    /// Region for hostname construction.
    pub region: String,
    /// Custom S3-compatible endpoint.
    pub endpoint: Option<String>,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Maximum fetch attempts per chunk.
    pub max_retries: u32,
    /// Use the transfer-acceleration hostname.
    pub use_transfer_acceleration: bool,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            region: "us-east-1".to_string(),
            endpoint: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            use_transfer_acceleration: false,
        }
    }
}

/// Chunking and intra-job concurrency settings.
#[derive(Clone, Debug)]
pub struct ChunkingConfig {
    /// Byte-range size per chunk.
    pub chunk_size_bytes: u64,
    /// Write buffer per in-flight range.
    pub buffer_size_bytes: usize,
    /// Ranges in flight per job; 1 means sequential.
    pub parallel_ranges: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: DEFAULT_CHUNK_SIZE,
            buffer_size_bytes: DEFAULT_BUFFER_SIZE,
            parallel_ranges: DEFAULT_PARALLEL_RANGES,
        }
    }
}

/// Destination storage settings.
#[derive(Clone, Debug)]
pub struct DestinationConfig {
    /// Final directory for promoted files.
    pub base_dir: PathBuf,
    /// Staging directory for in-flight files; must share a filesystem
    /// with `base_dir` for the promotion rename to be atomic.
    pub staging_dir: PathBuf,
    /// Run the validation pass after download.
    pub verify_integrity: bool,
    /// Progress log cadence in bytes.
    pub progress_log_interval_bytes: u64,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("downloads"),
            staging_dir: PathBuf::from("downloads/.staging"),
            verify_integrity: true,
            progress_log_interval_bytes: DEFAULT_PROGRESS_LOG_INTERVAL,
        }
    }
}

/// Worker pool settings.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Concurrent jobs.
    pub worker_count: usize,
    /// Queued submissions beyond the running jobs.
    pub queue_capacity: usize,
    /// Wall-clock ceiling per job in seconds.
    pub job_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            job_timeout_secs: DEFAULT_JOB_TIMEOUT.as_secs(),
        }
    }
}

/// Complete service configuration.
#[derive(Clone, Debug, Default)]
pub struct AppConfig {
    pub object_store: ObjectStoreConfig,
    pub chunking: ChunkingConfig,
    pub destination: DestinationConfig,
    pub workers: WorkerConfig,
    /// HTTP bind address.
    pub bind_address: Option<String>,
}

impl AppConfig {
    /// Loads configuration from an INI file, falling back to defaults for
    /// absent options, then validates the result.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_file(path).map_err(|e| ConfigError::Load(e.to_string()))?;
        let mut config = Self::default();

        if let Some(section) = ini.section(Some("object_store")) {
            if let Some(v) = section.get("bucket") {
                config.object_store.bucket = v.to_string();
            }
            if let Some(v) = section.get("region") {
                config.object_store.region = v.to_string();
            }
            if let Some(v) = section.get("endpoint") {
                config.object_store.endpoint = Some(v.to_string());
            }
            if let Some(v) = section.get("request_timeout_secs") {
                config.object_store.request_timeout_secs =
                    parse(v, "object_store.request_timeout_secs")?;
            }
            if let Some(v) = section.get("max_retries") {
                config.object_store.max_retries = parse(v, "object_store.max_retries")?;
            }
            if let Some(v) = section.get("use_transfer_acceleration") {
                config.object_store.use_transfer_acceleration =
                    parse(v, "object_store.use_transfer_acceleration")?;
            }
        }

        if let Some(section) = ini.section(Some("chunking")) {
            if let Some(v) = section.get("chunk_size_bytes") {
                config.chunking.chunk_size_bytes = parse(v, "chunking.chunk_size_bytes")?;
            }
            if let Some(v) = section.get("buffer_size_bytes") {
                config.chunking.buffer_size_bytes = parse(v, "chunking.buffer_size_bytes")?;
            }
            if let Some(v) = section.get("parallel_ranges") {
                config.chunking.parallel_ranges = parse(v, "chunking.parallel_ranges")?;
            }
        }

        if let Some(section) = ini.section(Some("destination")) {
            if let Some(v) = section.get("base_dir") {
                config.destination.base_dir = PathBuf::from(v);
            }
            if let Some(v) = section.get("staging_dir") {
                config.destination.staging_dir = PathBuf::from(v);
            }
            if let Some(v) = section.get("verify_integrity") {
                config.destination.verify_integrity = parse(v, "destination.verify_integrity")?;
            }
            if let Some(v) = section.get("progress_log_interval_bytes") {
                config.destination.progress_log_interval_bytes =
                    parse(v, "destination.progress_log_interval_bytes")?;
            }
        }

        if let Some(section) = ini.section(Some("workers")) {
            if let Some(v) = section.get("worker_count") {
                config.workers.worker_count = parse(v, "workers.worker_count")?;
            }
            if let Some(v) = section.get("queue_capacity") {
                config.workers.queue_capacity = parse(v, "workers.queue_capacity")?;
            }
            if let Some(v) = section.get("job_timeout_secs") {
                config.workers.job_timeout_secs = parse(v, "workers.job_timeout_secs")?;
            }
        }

        if let Some(section) = ini.section(Some("server")) {
            if let Some(v) = section.get("bind_address") {
                config.bind_address = Some(v.to_string());
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks invariants the engine relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.object_store.bucket.is_empty() {
            return Err(ConfigError::Invalid(
                "object_store.bucket must be set".to_string(),
            ));
        }
        if self.chunking.chunk_size_bytes == 0 {
            return Err(ConfigError::Invalid(
                "chunking.chunk_size_bytes must be greater than zero".to_string(),
            ));
        }
        if self.chunking.buffer_size_bytes == 0 {
            return Err(ConfigError::Invalid(
                "chunking.buffer_size_bytes must be greater than zero".to_string(),
            ));
        }
        if self.chunking.parallel_ranges == 0 {
            return Err(ConfigError::Invalid(
                "chunking.parallel_ranges must be at least 1".to_string(),
            ));
        }
        if self.workers.worker_count == 0 {
            return Err(ConfigError::Invalid(
                "workers.worker_count must be at least 1".to_string(),
            ));
        }
        if self.destination.base_dir == self.destination.staging_dir {
            return Err(ConfigError::Invalid(
                "destination.staging_dir must differ from base_dir".to_string(),
            ));
        }
        Ok(())
    }

    /// Store client settings for [`crate::provider::S3ObjectStore`].
    pub fn s3_store_config(&self) -> S3StoreConfig {
        let mut config = S3StoreConfig::new(self.object_store.bucket.clone())
            .with_region(self.object_store.region.clone())
            .with_request_timeout(Duration::from_secs(self.object_store.request_timeout_secs))
            .with_transfer_acceleration(self.object_store.use_transfer_acceleration);
        if let Some(endpoint) = &self.object_store.endpoint {
            config = config.with_endpoint(endpoint.clone());
        }
        config
    }

    /// Engine options for [`crate::transfer::TransferOrchestrator`].
    pub fn transfer_options(&self) -> TransferOptions {
        let mut options = TransferOptions::new(
            self.destination.base_dir.clone(),
            self.destination.staging_dir.clone(),
        )
        .with_chunk_size(self.chunking.chunk_size_bytes)
        .with_parallel_ranges(self.chunking.parallel_ranges)
        .with_retry(RetryPolicy::new(self.object_store.max_retries))
        .with_verify_integrity(self.destination.verify_integrity);
        options.buffer_size = self.chunking.buffer_size_bytes;
        options.progress_log_interval = self.destination.progress_log_interval_bytes;
        options
    }

    /// Worker pool settings for [`crate::dispatcher::JobDispatcher`].
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            worker_count: self.workers.worker_count,
            queue_capacity: self.workers.queue_capacity,
            job_timeout: Duration::from_secs(self.workers.job_timeout_secs),
        }
    }

    /// Bind address for the HTTP API.
    pub fn bind_address(&self) -> &str {
        self.bind_address.as_deref().unwrap_or(DEFAULT_BIND_ADDRESS)
    }
}

fn parse<T: std::str::FromStr>(value: &str, option: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{option}: cannot parse '{value}'")))
}
