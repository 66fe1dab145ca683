//! Error taxonomy shared by every pipeline stage.

use std::time::Duration;

use thiserror::Error;

use crate::builder::BuildReport;

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, RagError>;

/// Failures surfaced by indexing and query-time operations.
#[derive(Debug, Error)]
pub enum RagError {
    /// The embedding model/service could not be reached or answered badly.
    #[error("embedding service unavailable: {reason}")]
    EmbeddingUnavailable {
        /// Human-readable cause.
        reason: String,
    },

    /// Vectors disagree with the index (or each other) on dimension.
    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Dimension fixed by the index or first vector.
        expected: usize,
        /// Offending dimension.
        actual: usize,
    },

    /// Search was attempted on an index with zero entries.
    #[error("index has no entries; nothing has been indexed yet")]
    EmptyIndex,

    /// A document record lacked required fields.
    #[error("malformed document {document_id}: {reason}")]
    MalformedDocument {
        /// Identifier of the record, or a positional label when the id is missing.
        document_id: String,
        /// Which field was missing or invalid.
        reason: String,
    },

    /// The generation service did not answer within the configured timeout.
    #[error("generation timed out after {timeout:?}")]
    GenerationTimeout {
        /// Timeout that elapsed.
        timeout: Duration,
    },

    /// The generation service failed for a reason other than a timeout.
    #[error("generation failed: {reason}")]
    GenerationFailed {
        /// Human-readable cause.
        reason: String,
    },

    /// Configuration values that cannot work together.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// On-disk index artifact is missing pieces or fails integrity checks.
    #[error("index artifact error: {0}")]
    IndexFormat(String),

    /// An index build gave up part way; the report describes what was done.
    #[error("index build aborted after {} chunks: {source}", .report.chunks_embedded)]
    BuildAborted {
        /// Counts gathered before the build stopped.
        report: Box<BuildReport>,
        /// Failure that stopped the build.
        source: Box<RagError>,
    },

    /// Filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialisation failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RagError {
    /// True for transient failures worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::EmbeddingUnavailable { .. } | Self::GenerationTimeout { .. }
        )
    }

    pub(crate) fn embedding_unavailable(reason: impl Into<String>) -> Self {
        Self::EmbeddingUnavailable {
            reason: reason.into(),
        }
    }

    pub(crate) fn malformed(document_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedDocument {
            document_id: document_id.into(),
            reason: reason.into(),
        }
    }
}
