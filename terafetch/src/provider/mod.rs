//! Object store client boundary.
//!
//! The transfer engine talks to the remote store exclusively through the
//! [`ObjectStore`] trait. This keeps the engine testable (tests inject
//! in-memory or fault-injecting stores) and keeps wire details out of the
//! orchestration code. The production implementation is [`S3ObjectStore`],
//! a reqwest-based client for S3-compatible HTTP endpoints.

mod s3;

pub use s3::{S3ObjectStore, S3StoreConfig, DEFAULT_REQUEST_TIMEOUT_SECS};

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;
use thiserror::Error;

use crate::chunk::ChunkRange;

/// Metadata resolved for a source object before transfer begins.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectMetadata {
    /// Total object size in bytes.
    pub content_length: u64,

    /// Entity tag reported by the store, when available.
    pub etag: Option<String>,
}

/// Errors surfaced by object store operations.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Transport-level failure (connect, timeout, body read).
    #[error("request failed: {0}")]
    Http(String),

    /// The store answered with an unexpected HTTP status.
    #[error("unexpected HTTP status {code} for {key}")]
    Status {
        /// HTTP status code returned by the store.
        code: u16,
        /// Object key the request was for.
        key: String,
    },

    /// The source object does not exist.
    #[error("object not found: {0}")]
    NotFound(String),

    /// The store did not report a content length for the object.
    #[error("no content length reported for {0}")]
    MissingContentLength(String),
}

/// Streaming body of a ranged read.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ProviderError>> + Send>>;

/// Boxed future used to keep [`ObjectStore`] dyn-compatible.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

/// Read-side interface to a remote object store.
///
/// Implementations must support metadata lookup and byte-range retrieval;
/// nothing else is required of the transport. Boxed futures keep the trait
/// usable as a trait object held by the orchestrator.
pub trait ObjectStore: Send + Sync + 'static {
    /// Resolves size and entity tag for `key`.
    ///
    /// Returns [`ProviderError::NotFound`] if the object does not exist.
    fn head<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ObjectMetadata>;

    /// Opens a streaming read of the given byte range of `key`.
    ///
    /// The stream yields exactly the requested bytes on success; a stream
    /// that ends short is detected and rejected by the caller.
    fn get_range<'a>(&'a self, key: &'a str, range: ChunkRange) -> StoreFuture<'a, ByteStream>;
}
