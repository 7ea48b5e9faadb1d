//! Terminal error taxonomy for transfer jobs.
//!
//! Per-attempt transient errors are retried inside the fetcher and never
//! surface here; everything in this enum terminates its job. Terminal
//! errors are reported solely through the progress store's error message,
//! so the `Display` text is what a polling caller eventually sees.

use thiserror::Error;

use crate::provider::ProviderError;

/// A terminal transfer failure.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Source metadata could not be resolved (missing object, transport
    /// failure on the head request).
    #[error("metadata lookup failed: {0}")]
    Metadata(#[source] ProviderError),

    /// The staging area could not be created or written.
    #[error("staging failure: {0}")]
    Staging(#[source] std::io::Error),

    /// A chunk failed after exhausting its retries.
    #[error("chunk {chunk_index} failed after {attempts} attempts: {message}")]
    ChunkTransfer {
        /// Ordinal of the chunk within the plan.
        chunk_index: usize,
        /// Attempts made before giving up.
        attempts: u32,
        /// Last attempt's error text.
        message: String,
    },

    /// The staged file did not match the source after a full download.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The atomic move of the staging file to its final path failed.
    #[error("promotion failed: {0}")]
    Promotion(#[source] std::io::Error),

    /// The job was cancelled by an operator request or shutdown.
    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    /// Whether this error is the cooperative-cancellation terminator.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
