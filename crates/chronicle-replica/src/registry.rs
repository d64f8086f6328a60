//! Process-wide registry of open partition replicas and the shared blob cache.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::info;

use chronicle_core::{
    BlobBackend, BlobError, ContentHash, MediaEntry, MemoryPartitionStore, PartitionId,
    PartitionStore,
};

use crate::blob_store::BlobStore;
use crate::contents::DEFAULT_INLINE_THRESHOLD;
use crate::error::ReplicaError;
use crate::media_table::PersistedMediaMap;
use crate::narrate::{NarrateOptions, NarrationResult};
use crate::replica::{ConnectOptions, PartitionReplica, ReplicaConfig, ReplicaParts};
use crate::retry::{BackoffPolicy, RetryPolicy, Sleeper, TokioSleeper};
use crate::upstream::{EventSink, NullSink, Upstream};

#[derive(Clone)]
pub struct RegistryConfig {
    pub inline_threshold: usize,
    pub retry_policy: Arc<dyn RetryPolicy>,
    pub sleeper: Arc<dyn Sleeper>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
            retry_policy: Arc::new(BackoffPolicy::default()),
            sleeper: Arc::new(TokioSleeper),
        }
    }
}

#[derive(Clone)]
pub struct OpenOptions {
    pub locally_persisted: bool,
    pub media_in_memory: bool,
    pub connect_upstream: bool,
    /// Receives narrated and received events. Defaults to discarding them.
    pub sink: Option<Arc<dyn EventSink>>,
    pub narrate: NarrateOptions,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            locally_persisted: true,
            media_in_memory: true,
            connect_upstream: true,
            sink: None,
            narrate: NarrateOptions::default(),
        }
    }
}

struct RegistryInner {
    blobs: BlobStore,
    store: Arc<dyn PartitionStore>,
    memory_store: Arc<MemoryPartitionStore>,
    persisted_media: PersistedMediaMap,
    upstream: Option<Arc<dyn Upstream>>,
    config: RegistryConfig,
    replicas: DashMap<PartitionId, PartitionReplica>,
}

/// Owns the blob cache and the replicas opened against it.
#[derive(Clone)]
pub struct ReplicaRegistry {
    inner: Arc<RegistryInner>,
}

impl ReplicaRegistry {
    pub fn new(
        blob_backend: Arc<dyn BlobBackend>,
        store: Arc<dyn PartitionStore>,
        upstream: Option<Arc<dyn Upstream>>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                blobs: BlobStore::new(blob_backend),
                store,
                memory_store: Arc::new(MemoryPartitionStore::new()),
                persisted_media: PersistedMediaMap::new(),
                upstream,
                config,
                replicas: DashMap::new(),
            }),
        }
    }

    /// Open and connect a partition. An already open partition is returned
    /// as is, without narrating again.
    pub async fn open_partition(
        &self,
        partition: PartitionId,
        options: OpenOptions,
    ) -> Result<(PartitionReplica, Option<NarrationResult>), ReplicaError> {
        let replica = match self.inner.replicas.entry(partition.clone()) {
            Entry::Occupied(existing) => return Ok((existing.get().clone(), None)),
            Entry::Vacant(vacant) => {
                let replica = self.build_replica(partition.clone(), &options);
                vacant.insert(replica.clone());
                replica
            }
        };

        let connected = replica
            .connect(ConnectOptions {
                connect_upstream: options.connect_upstream,
                narrate: options.narrate,
            })
            .await;
        match connected {
            Ok(narration) => {
                info!("Opened partition {}", partition);
                Ok((replica, Some(narration)))
            }
            Err(e) => {
                self.inner.replicas.remove(&partition);
                Err(e)
            }
        }
    }

    fn build_replica(&self, partition: PartitionId, options: &OpenOptions) -> PartitionReplica {
        let store: Arc<dyn PartitionStore> = if options.locally_persisted {
            self.inner.store.clone()
        } else {
            self.inner.memory_store.clone()
        };
        let config = ReplicaConfig {
            locally_persisted: options.locally_persisted,
            media_in_memory: options.media_in_memory,
            inline_threshold: self.inner.config.inline_threshold,
        };
        let parts = ReplicaParts {
            store,
            blobs: self.inner.blobs.clone(),
            persisted_media: self.inner.persisted_media.clone(),
            upstream: self.inner.upstream.clone(),
            sink: options.sink.clone().unwrap_or_else(|| Arc::new(NullSink)),
            retry_policy: self.inner.config.retry_policy.clone(),
            sleeper: self.inner.config.sleeper.clone(),
        };
        PartitionReplica::new(partition, config, parts)
    }

    /// Disconnect and forget a partition. Returns false if it was not open.
    pub fn close_partition(&self, partition: &PartitionId) -> bool {
        match self.inner.replicas.remove(partition) {
            Some((_, replica)) => {
                replica.disconnect();
                true
            }
            None => false,
        }
    }

    pub fn replica(&self, partition: &PartitionId) -> Option<PartitionReplica> {
        self.inner.replicas.get(partition).map(|r| r.value().clone())
    }

    /// Media entry of any locally persisted open partition.
    pub fn persisted_media(&self, media_id: &str) -> Option<MediaEntry> {
        self.inner.persisted_media.get(media_id)
    }

    pub async fn read_blob(&self, content_hash: &ContentHash) -> Result<Bytes, BlobError> {
        self.inner.blobs.read(content_hash).await
    }

    pub async fn write_blob(
        &self,
        buffer: Bytes,
        content_hash: &ContentHash,
        initial_persist_refs: i64,
    ) -> Result<ContentHash, BlobError> {
        self.inner
            .blobs
            .write(buffer, content_hash, initial_persist_refs)
            .await
    }

    pub fn try_get_cached_blob(&self, content_hash: &ContentHash) -> Option<Bytes> {
        self.inner.blobs.try_get_cached(content_hash)
    }

    /// Delete stored blobs nothing references.
    pub async fn compact_blobs(&self) -> Result<usize, BlobError> {
        self.inner.blobs.compact().await
    }

    pub fn blob_store(&self) -> &BlobStore {
        &self.inner.blobs
    }
}
