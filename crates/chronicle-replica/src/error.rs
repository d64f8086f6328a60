use thiserror::Error;

use chronicle_core::{BlobError, ContentHash, LogError, LogIndex, LogKind, PartitionId, StorageError};

/// Failures reported by an upstream connection.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UpstreamError {
    #[error("Upstream unavailable: {0}")]
    Unavailable(String),

    /// Transient condition the upstream expects to clear immediately.
    #[error("Upstream asked to retry: {0}")]
    RetryNow(String),

    #[error("Upstream rejected request: {0}")]
    Rejected(String),
}

#[derive(Error, Debug, Clone)]
pub enum ReplicaError {
    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("Out of order {kind} event for {partition}: expected index {expected}, got {got}")]
    OutOfOrder {
        partition: PartitionId,
        kind: LogKind,
        expected: LogIndex,
        got: LogIndex,
    },

    /// No retriever could supply the content.
    #[error("Media content unavailable: {0}")]
    MediaUnavailable(String),

    /// A retriever was reached but failed.
    #[error("Media retrieval failed for {media}: {reason}")]
    MediaRetrieval { media: String, reason: String },

    #[error("Media entry not found: {0}")]
    MediaNotFound(String),

    #[error("Declared content hash {declared} does not match content {actual}")]
    HashMismatch {
        declared: ContentHash,
        actual: ContentHash,
    },

    #[error("Partition {0} is not connected")]
    NotConnected(PartitionId),

    #[error("Partition {0} is already connected")]
    AlreadyConnected(PartitionId),

    #[error("Decoding failed: {0}")]
    Decode(String),

    #[error("Event sink failed: {0}")]
    Sink(String),

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("{operation} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last: Box<ReplicaError>,
        /// Every error seen, oldest first, including `last`.
        history: Vec<ReplicaError>,
    },
}

impl ReplicaError {
    /// Errors that indicate a logic bug or tampering. Never retried.
    pub fn is_integrity(&self) -> bool {
        match self {
            ReplicaError::Log(e) => e.is_integrity(),
            ReplicaError::Blob(e) => e.is_integrity(),
            ReplicaError::OutOfOrder { .. } | ReplicaError::HashMismatch { .. } => true,
            ReplicaError::RetriesExhausted { last, .. } => last.is_integrity(),
            _ => false,
        }
    }

    /// Errors worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            ReplicaError::Log(LogError::Storage(_))
            | ReplicaError::Blob(BlobError::Storage(_))
            | ReplicaError::Storage(_)
            | ReplicaError::MediaRetrieval { .. }
            | ReplicaError::Task(_) => true,
            ReplicaError::Upstream(e) => !matches!(e, UpstreamError::Rejected(_)),
            _ => false,
        }
    }

    /// Transient errors that ask for an immediate retry.
    pub fn is_instant_retry(&self) -> bool {
        matches!(self, ReplicaError::Upstream(UpstreamError::RetryNow(_)))
    }

    /// The error behind retry exhaustion, or this error.
    pub fn root(&self) -> &ReplicaError {
        match self {
            ReplicaError::RetriesExhausted { last, .. } => last.root(),
            other => other,
        }
    }
}
