//! Chronicle Core - Domain types, storage traits, and log rules.
//!
//! This crate contains the partition log and media data model shared by the
//! storage engine and the replica. It has no dependencies on other Chronicle
//! crates.

pub mod blob;
pub mod error;
pub mod event;
pub mod log;
pub mod media;
pub mod storage;

// Re-exports for convenience
pub use blob::{BlobMeta, ContentHash};
pub use error::{BlobError, LogError, StorageError};
pub use event::{Action, CommandId, EventRange, LogEvent, LogIndex, LogKind, PartitionId};
pub use log::{check_expected_ids, plan_append, AppendPlan};
pub use media::{MediaChange, MediaEntry, MediaInfo, MEDIA_TYPE_NAME};
pub use storage::memory::{MemoryBlobBackend, MemoryPartitionStore};
pub use storage::{BlobBackend, LogStore, MediaStore, PartitionStore};
