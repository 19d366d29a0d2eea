//! Error kinds shared across every edge-tutor crate.
//!
//! Mirrors the split the rest of the workspace uses: a `thiserror` enum for
//! typed, matchable kinds at crate boundaries, with `anyhow::Error` folded
//! in at the edges for opaque upstream failures.

use thiserror::Error;

/// The complete set of error kinds a caller of the edge runtime can observe.
///
/// The variant names match `spec.md` §7 exactly so that propagation-policy
/// decisions (local recovery vs. surface vs. halt) can be made by matching
/// on `TutorError::kind()` rather than on ad-hoc string content.
#[derive(Debug, Error)]
pub enum TutorError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("queue is full")]
    QueueFull,

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("retrieval error: {0}")]
    Retrieval(String),

    #[error("generation error: {0}")]
    Generation(String),

    #[error("checksum mismatch: expected {expected}, computed {computed}")]
    ChecksumMismatch { expected: String, computed: String },

    #[error("version conflict: {0}")]
    VersionConflict(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("transient upstream error: {0}")]
    TransientUpstream(String),

    #[error("permanent upstream error: {0}")]
    PermanentUpstream(String),

    #[error("subsystem unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl TutorError {
    /// The stable kind tag, usable for metrics/logging without matching the
    /// whole enum.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::Auth(_) => "AuthError",
            Self::QueueFull => "QueueFull",
            Self::Timeout(_) => "Timeout",
            Self::Cancelled => "Cancelled",
            Self::Embedding(_) => "EmbeddingError",
            Self::Retrieval(_) => "RetrievalError",
            Self::Generation(_) => "GenerationError",
            Self::ChecksumMismatch { .. } => "ChecksumMismatch",
            Self::VersionConflict(_) => "VersionConflict",
            Self::Storage(_) => "StorageError",
            Self::TransientUpstream(_) => "TransientUpstream",
            Self::PermanentUpstream(_) => "PermanentUpstream",
            Self::Unavailable(_) => "Unavailable",
            Self::Internal(_) => "Internal",
        }
    }

    /// Whether this kind is safe to retry internally without surfacing to
    /// the caller (policy table in `spec.md` §7).
    #[must_use]
    pub const fn is_locally_recoverable(&self) -> bool {
        matches!(self, Self::TransientUpstream(_))
    }
}

/// Convenience result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, TutorError>;
