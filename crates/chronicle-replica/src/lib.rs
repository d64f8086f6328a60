//! Chronicle Replica - Local partition replicas over a shared blob cache.
//!
//! A replica keeps a partition's truth log and command queue, tracks the
//! media resources its events describe, and makes their content available
//! through the content-addressed blob store.

pub mod blob_store;
pub mod chronicle;
pub mod contents;
pub mod error;
pub mod media_sync;
pub mod media_table;
pub mod narrate;
pub mod receive;
pub mod registry;
pub mod replica;
pub mod retry;
pub mod upstream;

#[cfg(test)]
mod test_support;

pub use blob_store::{BlobSnapshot, BlobStore, Decoded};
pub use chronicle::{ChronicleOptions, ChronicleResult, EventResult};
pub use contents::{
    data_uri, ContentKind, ContentRequest, MediaContent, MediaDecoder, Utf8Decoder,
    DEFAULT_INLINE_THRESHOLD,
};
pub use error::{ReplicaError, UpstreamError};
pub use media_sync::{
    retriever, throw_on_media_request, MediaSyncEngine, PreparedBlob, RetrieveMediaBuffer,
};
pub use media_table::{MediaEntryTable, MediaFlags, PersistedMediaMap};
pub use narrate::{NarrateOptions, NarrationResult, RemoteNarration};
pub use receive::ReceiveOptions;
pub use registry::{OpenOptions, RegistryConfig, ReplicaRegistry};
pub use replica::{ConnectOptions, PartitionReplica, ReplicaConfig, ReplicaRanges, ReplicaStatus};
pub use retry::{BackoffPolicy, Retried, RetryPolicy, Sleeper, TokioSleeper};
pub use upstream::{
    EventSink, MediaRequest, NullSink, PushSender, Upstream, UpstreamConnection, UpstreamContent,
    UpstreamNarrateOptions,
};
