//! Per-partition replica: lifecycle, state, and inspection.
//!
//! Receiving, narration and chronicling live in sibling modules as further
//! `impl PartitionReplica` blocks.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use chronicle_core::{
    CommandId, ContentHash, EventRange, LogEvent, LogIndex, LogKind, MediaEntry, MediaInfo,
    PartitionId, PartitionStore,
};

use crate::blob_store::BlobStore;
use crate::contents::DEFAULT_INLINE_THRESHOLD;
use crate::error::ReplicaError;
use crate::media_sync::MediaSyncEngine;
use crate::media_table::{MediaEntryTable, MediaFlags, PersistedMediaMap};
use crate::narrate::{NarrateOptions, NarrationResult};
use crate::receive::ReceiveOptions;
use crate::retry::{RetryPolicy, Sleeper};
use crate::upstream::{EventSink, Upstream, UpstreamConnection};

/// How a replica stores what it receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaConfig {
    /// Write events, media entries and blobs to the durable store. When
    /// false the replica lives in memory only.
    pub locally_persisted: bool,
    /// Pin media content of this partition in memory.
    pub media_in_memory: bool,
    /// Largest buffer returned inline as a data URI when an upstream exists.
    pub inline_threshold: usize,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            locally_persisted: true,
            media_in_memory: true,
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
        }
    }
}

impl ReplicaConfig {
    pub(crate) fn media_flags(&self) -> MediaFlags {
        MediaFlags {
            is_persisted: self.locally_persisted,
            is_in_memory: self.media_in_memory,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaStatus {
    Disconnected,
    Connecting,
    Narrating,
    Ready,
}

/// Stored ranges of both sequences.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicaRanges {
    pub truths: EventRange,
    pub commands: EventRange,
}

impl ReplicaRanges {
    pub fn get(&self, kind: LogKind) -> EventRange {
        match kind {
            LogKind::Truths => self.truths,
            LogKind::Commands => self.commands,
        }
    }

    pub(crate) fn get_mut(&mut self, kind: LogKind) -> &mut EventRange {
        match kind {
            LogKind::Truths => &mut self.truths,
            LogKind::Commands => &mut self.commands,
        }
    }

    /// Next index a sequence accepts. An empty command queue restarts at the
    /// head of the truth log.
    pub fn expected_next(&self, kind: LogKind) -> LogIndex {
        match kind {
            LogKind::Truths => self.truths.next,
            LogKind::Commands if self.commands.is_empty() => {
                self.commands.next.max(self.truths.next)
            }
            LogKind::Commands => self.commands.next,
        }
    }
}

pub(crate) type TruthWatcher = oneshot::Sender<Result<LogEvent, ReplicaError>>;

pub(crate) struct ReplicaState {
    pub(crate) status: ReplicaStatus,
    pub(crate) ranges: ReplicaRanges,
    pub(crate) media: MediaEntryTable,
    pub(crate) truth_watchers: HashMap<CommandId, Vec<TruthWatcher>>,
    pub(crate) displaced_commands: u64,
    pub(crate) connection: Option<Arc<dyn UpstreamConnection>>,
    push_task: Option<JoinHandle<()>>,
}

pub(crate) struct ReplicaInner {
    pub(crate) partition: PartitionId,
    pub(crate) config: ReplicaConfig,
    pub(crate) store: Arc<dyn PartitionStore>,
    pub(crate) blobs: BlobStore,
    pub(crate) media_sync: MediaSyncEngine,
    pub(crate) persisted_media: PersistedMediaMap,
    upstream: Option<Arc<dyn Upstream>>,
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) state: Mutex<ReplicaState>,
    /// Serializes truth receipt.
    pub(crate) truth_gate: tokio::sync::Mutex<()>,
    /// Serializes command receipt and index assignment.
    pub(crate) command_gate: Arc<tokio::sync::Mutex<()>>,
}

/// Collaborators a replica is built from.
pub(crate) struct ReplicaParts {
    pub store: Arc<dyn PartitionStore>,
    pub blobs: BlobStore,
    pub persisted_media: PersistedMediaMap,
    pub upstream: Option<Arc<dyn Upstream>>,
    pub sink: Arc<dyn EventSink>,
    pub retry_policy: Arc<dyn RetryPolicy>,
    pub sleeper: Arc<dyn Sleeper>,
}

#[derive(Clone)]
pub struct ConnectOptions {
    /// Acquire an upstream connection when an upstream is configured.
    pub connect_upstream: bool,
    pub narrate: NarrateOptions,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_upstream: true,
            narrate: NarrateOptions::default(),
        }
    }
}

/// Handle to one partition's replica. Clones share the same replica.
#[derive(Clone)]
pub struct PartitionReplica {
    pub(crate) inner: Arc<ReplicaInner>,
}

impl PartitionReplica {
    pub(crate) fn new(partition: PartitionId, config: ReplicaConfig, parts: ReplicaParts) -> Self {
        let media_sync = MediaSyncEngine::new(
            parts.blobs.clone(),
            config.locally_persisted,
            parts.retry_policy,
            parts.sleeper,
        );
        Self {
            inner: Arc::new(ReplicaInner {
                partition,
                config,
                store: parts.store,
                blobs: parts.blobs,
                media_sync,
                persisted_media: parts.persisted_media,
                upstream: parts.upstream,
                sink: parts.sink,
                state: Mutex::new(ReplicaState {
                    status: ReplicaStatus::Disconnected,
                    ranges: ReplicaRanges::default(),
                    media: MediaEntryTable::new(),
                    truth_watchers: HashMap::new(),
                    displaced_commands: 0,
                    connection: None,
                    push_task: None,
                }),
                truth_gate: tokio::sync::Mutex::new(()),
                command_gate: Arc::new(tokio::sync::Mutex::new(())),
            }),
        }
    }

    /// Load local state, attach to the upstream and narrate.
    pub async fn connect(&self, options: ConnectOptions) -> Result<NarrationResult, ReplicaError> {
        let partition = &self.inner.partition;
        {
            let mut state = self.inner.state.lock();
            if state.status != ReplicaStatus::Disconnected {
                return Err(ReplicaError::AlreadyConnected(partition.clone()));
            }
            state.status = ReplicaStatus::Connecting;
        }

        if let Err(e) = self.load_local_state() {
            self.inner.state.lock().status = ReplicaStatus::Disconnected;
            return Err(e);
        }

        if options.connect_upstream {
            self.attach_upstream().await;
        }

        self.inner.state.lock().status = ReplicaStatus::Narrating;
        let narration = match self.narrate(options.narrate).await {
            Ok(narration) => narration,
            Err(e) => {
                warn!("Narration of {} failed, disconnecting: {}", partition, e);
                self.disconnect();
                return Err(e);
            }
        };

        let ranges = {
            let mut state = self.inner.state.lock();
            state.status = ReplicaStatus::Ready;
            state.ranges
        };
        info!(
            "Connected {}: truths {:?}, commands {:?}",
            partition, ranges.truths, ranges.commands
        );
        Ok(narration)
    }

    fn load_local_state(&self) -> Result<(), ReplicaError> {
        let partition = &self.inner.partition;
        let ranges = ReplicaRanges {
            truths: self.inner.store.range(partition, LogKind::Truths)?,
            commands: self.inner.store.range(partition, LogKind::Commands)?,
        };
        let media = MediaEntryTable::load(self.inner.store.get_all_media(partition)?);

        let in_memory: Vec<(ContentHash, i64)> = media
            .entries()
            .filter_map(|entry| entry.in_memory_hash().map(|hash| (hash.clone(), 1)))
            .collect();
        for entry in media.entries() {
            self.inner.persisted_media.publish(partition, entry);
        }
        debug!("Loaded {} media entries for {}", media.len(), partition);

        {
            let mut state = self.inner.state.lock();
            state.ranges = ranges;
            state.media = media;
        }
        self.inner.blobs.adjust_in_memory_ref_counts(&in_memory);
        Ok(())
    }

    async fn attach_upstream(&self) {
        let Some(upstream) = self.inner.upstream.clone() else {
            return;
        };
        let partition = &self.inner.partition;
        let (push, mut pushed) = mpsc::unbounded_channel();

        let connection = match upstream.acquire_connection(partition, push).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!("Upstream for {} unavailable, continuing offline: {}", partition, e);
                return;
            }
        };
        self.inner.media_sync.set_upstream(Some(connection.clone()));

        let replica: Weak<ReplicaInner> = Arc::downgrade(&self.inner);
        let push_task = tokio::spawn(async move {
            while let Some(events) = pushed.recv().await {
                let Some(inner) = replica.upgrade() else {
                    break;
                };
                let replica = PartitionReplica { inner };
                if let Err(e) = replica.receive_truths(events, ReceiveOptions::default()).await {
                    warn!("Failed to receive pushed truths for {}: {}", replica.partition_id(), e);
                }
            }
        });

        let mut state = self.inner.state.lock();
        state.connection = Some(connection);
        state.push_task = Some(push_task);
    }

    /// Release the replica's in-memory blob references and its share of the
    /// persisted media map. Idempotent.
    pub fn disconnect(&self) {
        let (released, push_task) = {
            let mut state = self.inner.state.lock();
            if state.status == ReplicaStatus::Disconnected {
                return;
            }
            state.status = ReplicaStatus::Disconnected;

            let media = std::mem::take(&mut state.media);
            let released: Vec<(ContentHash, i64)> = media
                .entries()
                .filter_map(|entry| entry.in_memory_hash().map(|hash| (hash.clone(), -1)))
                .collect();
            state.connection = None;
            // Pending truth watchers resolve as disconnected
            state.truth_watchers.clear();
            (released, state.push_task.take())
        };

        self.inner.blobs.adjust_in_memory_ref_counts(&released);
        self.inner
            .persisted_media
            .retract_partition(&self.inner.partition);
        self.inner.media_sync.set_upstream(None);
        if let Some(task) = push_task {
            task.abort();
        }
        info!("Disconnected {}", self.inner.partition);
    }

    pub(crate) fn ensure_connected(&self) -> Result<(), ReplicaError> {
        if self.status() == ReplicaStatus::Disconnected {
            return Err(ReplicaError::NotConnected(self.inner.partition.clone()));
        }
        Ok(())
    }

    pub(crate) fn connection(&self) -> Option<Arc<dyn UpstreamConnection>> {
        self.inner.state.lock().connection.clone()
    }

    pub fn partition_id(&self) -> &PartitionId {
        &self.inner.partition
    }

    pub fn config(&self) -> ReplicaConfig {
        self.inner.config
    }

    pub fn status(&self) -> ReplicaStatus {
        self.inner.state.lock().status
    }

    pub fn ranges(&self) -> ReplicaRanges {
        self.inner.state.lock().ranges
    }

    pub fn media_entry(&self, media_id: &str) -> Option<MediaEntry> {
        self.inner.state.lock().media.get(media_id).cloned()
    }

    /// Media info with fields inherited along the prototype chain.
    pub fn resolve_media_info(&self, media_id: &str) -> Option<MediaInfo> {
        self.inner.state.lock().media.resolve(media_id)
    }

    /// Queued commands pruned because a different truth took their slot.
    pub fn displaced_commands(&self) -> u64 {
        self.inner.state.lock().displaced_commands
    }

    pub fn has_upstream(&self) -> bool {
        self.connection().is_some()
    }
}
