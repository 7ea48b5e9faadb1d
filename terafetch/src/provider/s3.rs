//! Reqwest-backed client for S3-compatible object stores.
//!
//! Requests are issued as plain HTTP against either a custom endpoint
//! (MinIO, a signing gateway, any S3-compatible front) in path style, or
//! the public AWS virtual-hosted form when no endpoint is configured.
//! Request signing is out of scope for this client; deployments that need
//! authenticated access put a signing proxy or presigning gateway at the
//! configured endpoint.

use std::time::Duration;

use futures_util::TryStreamExt;
use reqwest::{Client, StatusCode};

use super::{ByteStream, ObjectMetadata, ObjectStore, ProviderError, StoreFuture};
use crate::chunk::ChunkRange;

/// Default per-request timeout (30 minutes, sized for 100 MiB ranges on
/// slow links).
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 1800;

/// Configuration for [`S3ObjectStore`].
#[derive(Clone, Debug)]
pub struct S3StoreConfig {
    /// Bucket (or container) holding the source objects.
    pub bucket: String,

    /// AWS region used when no custom endpoint is given.
    pub region: String,

    /// Custom endpoint for S3-compatible stores; path-style addressing.
    pub endpoint: Option<String>,

    /// Per-request timeout applied to metadata and range reads.
    pub request_timeout: Duration,

    /// Use the S3 transfer-acceleration hostname (ignored with a custom
    /// endpoint).
    pub use_transfer_acceleration: bool,
}

impl Default for S3StoreConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            region: "us-east-1".to_string(),
            endpoint: None,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            use_transfer_acceleration: false,
        }
    }
}

impl S3StoreConfig {
    /// Creates a config for the given bucket with defaults elsewhere.
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            ..Self::default()
        }
    }

    /// Sets a custom S3-compatible endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Sets the region used for hostname construction.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Sets the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Enables the transfer-acceleration hostname.
    pub fn with_transfer_acceleration(mut self, enabled: bool) -> Self {
        self.use_transfer_acceleration = enabled;
        self
    }

    /// Builds the request URL for an object key.
    fn object_url(&self, key: &str) -> String {
        match &self.endpoint {
            Some(endpoint) => {
                format!("{}/{}/{}", endpoint.trim_end_matches('/'), self.bucket, key)
            }
            None if self.use_transfer_acceleration => {
                format!("https://{}.s3-accelerate.amazonaws.com/{}", self.bucket, key)
            }
            None => format!(
                "https://{}.s3.{}.amazonaws.com/{}",
                self.bucket, self.region, key
            ),
        }
    }
}

/// [`ObjectStore`] implementation over HTTP with reqwest.
pub struct S3ObjectStore {
    client: Client,
    config: S3StoreConfig,
}

impl S3ObjectStore {
    /// Creates a store client from the given configuration.
    pub fn new(config: S3StoreConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ProviderError::Http(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    fn classify_status(status: StatusCode, key: &str) -> ProviderError {
        if status == StatusCode::NOT_FOUND {
            ProviderError::NotFound(key.to_string())
        } else {
            ProviderError::Status {
                code: status.as_u16(),
                key: key.to_string(),
            }
        }
    }
}

impl ObjectStore for S3ObjectStore {
    fn head<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ObjectMetadata> {
        Box::pin(async move {
            let url = self.config.object_url(key);
            let response = self
                .client
                .head(&url)
                .send()
                .await
                .map_err(|e| ProviderError::Http(e.to_string()))?;

            if !response.status().is_success() {
                return Err(Self::classify_status(response.status(), key));
            }

            let content_length = response
                .headers()
                .get(reqwest::header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(|| ProviderError::MissingContentLength(key.to_string()))?;

            let etag = response
                .headers()
                .get(reqwest::header::ETAG)
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string);

            Ok(ObjectMetadata {
                content_length,
                etag,
            })
        })
    }

    fn get_range<'a>(&'a self, key: &'a str, range: ChunkRange) -> StoreFuture<'a, ByteStream> {
        Box::pin(async move {
            let url = self.config.object_url(key);
            let response = self
                .client
                .get(&url)
                .header(reqwest::header::RANGE, range.http_range_value())
                .send()
                .await
                .map_err(|e| ProviderError::Http(e.to_string()))?;

            let status = response.status();
            // 206 is the ranged reply; 200 is tolerated for single-range
            // reads of stores that ignore Range on small objects.
            if status != StatusCode::PARTIAL_CONTENT && status != StatusCode::OK {
                return Err(Self::classify_status(status, key));
            }

            let stream = response
                .bytes_stream()
                .map_err(|e| ProviderError::Http(e.to_string()));

            Ok(Box::pin(stream) as ByteStream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_url_path_style_with_endpoint() {
        let config = S3StoreConfig::new("archive").with_endpoint("http://minio.local:9000/");
        assert_eq!(
            config.object_url("datasets/huge.bin"),
            "http://minio.local:9000/archive/datasets/huge.bin"
        );
    }

    #[test]
    fn test_object_url_virtual_hosted_default() {
        let config = S3StoreConfig::new("archive").with_region("eu-west-1");
        assert_eq!(
            config.object_url("huge.bin"),
            "https://archive.s3.eu-west-1.amazonaws.com/huge.bin"
        );
    }

    #[test]
    fn test_object_url_accelerated() {
        let config = S3StoreConfig::new("archive").with_transfer_acceleration(true);
        assert_eq!(
            config.object_url("huge.bin"),
            "https://archive.s3-accelerate.amazonaws.com/huge.bin"
        );
    }

    #[test]
    fn test_endpoint_wins_over_acceleration() {
        let config = S3StoreConfig::new("archive")
            .with_endpoint("http://gateway:8000")
            .with_transfer_acceleration(true);
        assert_eq!(
            config.object_url("huge.bin"),
            "http://gateway:8000/archive/huge.bin"
        );
    }
}
