//! TeraFetch - Chunked terabyte-scale object store downloads
//!
//! This library provides the core functionality for transferring very large
//! objects from S3-compatible stores to local storage: byte-range chunking,
//! per-chunk retry with capped exponential backoff, staging files with atomic
//! promotion, live progress tracking, and a bounded worker pool behind an
//! HTTP API.
//!
//! The modules layer cleanly:
//!
//! - [`chunk`] plans the byte-range layout of a transfer.
//! - [`provider`] is the object store boundary ([`provider::ObjectStore`]).
//! - [`fetcher`] downloads a single range with retry and cancellation.
//! - [`transfer`] runs one whole job: staging, chunks, validation, promotion.
//! - [`progress`] tracks every job for the query API.
//! - [`dispatcher`] queues jobs onto a fixed worker pool.
//! - [`api`] exposes submission, progress, and cancellation over HTTP.
//! - [`config`] loads the whole stack's settings from an INI file.

pub mod api;
pub mod chunk;
pub mod config;
pub mod dispatcher;
pub mod fetcher;
pub mod progress;
pub mod provider;
pub mod transfer;

pub use config::AppConfig;
pub use dispatcher::JobDispatcher;
pub use progress::{JobId, ProgressStore, TransferStatus};
pub use provider::{ObjectStore, S3ObjectStore};
pub use transfer::{TransferOrchestrator, TransferRequest};
