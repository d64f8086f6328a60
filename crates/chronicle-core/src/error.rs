use thiserror::Error;

use crate::blob::ContentHash;
use crate::event::{CommandId, LogIndex, LogKind};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Corrupt record: {0}")]
    Serialization(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LogError {
    #[error("Log conflict in {kind} at index {log_index}: stored command {stored}, incoming {incoming}")]
    Conflict {
        kind: LogKind,
        log_index: LogIndex,
        stored: CommandId,
        incoming: CommandId,
    },

    #[error("Non-contiguous write to {kind}: expected index {expected}, got {got}")]
    NonContiguous {
        kind: LogKind,
        expected: LogIndex,
        got: LogIndex,
    },

    #[error("Expected {expected} command ids for {kind} range starting at {first}, found {found} records")]
    ExpectedCountMismatch {
        kind: LogKind,
        first: LogIndex,
        expected: usize,
        found: usize,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BlobError {
    #[error("Content integrity violation for {content_hash}: {detail}")]
    ContentIntegrity {
        content_hash: ContentHash,
        detail: String,
    },

    #[error("Blob not found: {0}")]
    NotFound(ContentHash),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl LogError {
    /// True for errors that signal a logic bug or tampering rather than I/O trouble.
    pub fn is_integrity(&self) -> bool {
        !matches!(self, LogError::Storage(_))
    }
}

impl BlobError {
    pub fn is_integrity(&self) -> bool {
        matches!(self, BlobError::ContentIntegrity { .. })
    }
}
