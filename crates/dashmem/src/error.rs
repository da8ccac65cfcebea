// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Error types for the memory core.
//!
//! Read-path absence is `Option::None`, never an error. Errors are reserved
//! for calls that cannot proceed (bad dimensions, invalid queries, capacity,
//! I/O) and carry structured fields rather than sentinel strings.

use thiserror::Error;

/// Which side of a dual-write a partial failure landed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTarget {
    /// The structured (key/value/tag) backend.
    Structured,
    /// The vector (HNSW) backend.
    Vector,
}

impl std::fmt::Display for WriteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Structured => write!(f, "structured"),
            Self::Vector => write!(f, "vector"),
        }
    }
}

/// Errors surfaced by the memory core.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MemoryError {
    /// A vector's length differs from the configured index dimension.
    #[error("Vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// The configured dimension.
        expected: usize,
        /// The offending vector's length.
        actual: usize,
    },

    /// The vector index is at its configured element cap.
    #[error("Capacity exceeded: max_elements = {max_elements}")]
    CapacityExceeded {
        /// The configured cap.
        max_elements: usize,
    },

    /// Query builder validation failed; no backend was contacted.
    #[error("Invalid query: {reason}")]
    InvalidQuery {
        /// What the validator rejected.
        reason: String,
    },

    /// One side of a dual-write failed. The caller should retry; the other
    /// side's write stands.
    #[error("Partial write failure in {backend} backend: {source}")]
    PartialWrite {
        /// The backend that failed.
        backend: WriteTarget,
        /// The underlying failure.
        #[source]
        source: Box<MemoryError>,
    },

    /// A content-only semantic query arrived with no embedding generator
    /// configured.
    #[error("No embedding generator configured for content-only semantic query")]
    EmbedderUnavailable,

    /// The embedding generator itself failed.
    #[error("Embedding generation failed: {reason}")]
    EmbeddingFailed {
        /// Generator-reported reason.
        reason: String,
    },

    /// Snapshot or checkpoint file I/O.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot payload could not be encoded or decoded.
    #[error("Serialization failed: {reason}")]
    Serialization {
        /// Codec-reported reason.
        reason: String,
    },

    /// A snapshot file failed its magic/version/CRC verification.
    #[error("Snapshot integrity check failed: {reason}")]
    IntegrityCheckFailed {
        /// Which header field mismatched.
        reason: String,
    },
}

impl From<dashmem_hnsw::IndexError> for MemoryError {
    fn from(err: dashmem_hnsw::IndexError) -> Self {
        match err {
            dashmem_hnsw::IndexError::DimensionMismatch { expected, actual } => {
                Self::DimensionMismatch { expected, actual }
            }
            dashmem_hnsw::IndexError::CapacityExceeded { max_elements } => {
                Self::CapacityExceeded { max_elements }
            }
            other => Self::InvalidQuery {
                reason: other.to_string(),
            },
        }
    }
}

/// Result alias for memory-core operations.
pub type Result<T> = std::result::Result<T, MemoryError>;
