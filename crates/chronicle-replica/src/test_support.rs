//! Shared fixtures for unit tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;

use chronicle_core::{
    Action, BlobBackend, CommandId, ContentHash, LogEvent, LogIndex, LogKind, MediaInfo,
    MemoryBlobBackend, MemoryPartitionStore, PartitionId, PartitionStore, MEDIA_TYPE_NAME,
};

use crate::blob_store::BlobStore;
use crate::error::{ReplicaError, UpstreamError};
use crate::media_table::PersistedMediaMap;
use crate::replica::{ConnectOptions, PartitionReplica, ReplicaConfig, ReplicaParts};
use crate::retry::{BackoffPolicy, Sleeper};
use crate::upstream::{
    EventSink, MediaRequest, PushSender, Upstream, UpstreamConnection, UpstreamContent,
    UpstreamNarrateOptions,
};

pub fn truth(index: LogIndex, command: &str) -> LogEvent {
    LogEvent::new(index, CommandId::new(command), Vec::new())
}

/// An event creating a text media resource with content `hash`.
pub fn media_event(index: LogIndex, media_id: &str, hash: &ContentHash) -> LogEvent {
    LogEvent::new(
        index,
        CommandId::new(format!("create-{media_id}-{index}")),
        vec![Action::created(
            media_id,
            MEDIA_TYPE_NAME,
            json!({ "name": media_id, "mimeType": "text/plain", "content": hash.as_str() }),
        )],
    )
}

/// Sleeper that returns at once.
pub struct NoSleep;

impl Sleeper for NoSleep {
    fn sleep(&self, _: std::time::Duration) -> futures::future::BoxFuture<'static, ()> {
        Box::pin(async {})
    }
}

#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<(LogKind, LogEvent)>>,
}

impl CollectingSink {
    fn indices(&self, kind: LogKind) -> Vec<LogIndex> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, e)| e.log_index)
            .collect()
    }

    pub fn truth_indices(&self) -> Vec<LogIndex> {
        self.indices(LogKind::Truths)
    }

    pub fn command_indices(&self) -> Vec<LogIndex> {
        self.indices(LogKind::Commands)
    }
}

#[async_trait]
impl EventSink for CollectingSink {
    async fn receive_truths(&self, _: &PartitionId, events: &[LogEvent]) -> Result<(), ReplicaError> {
        let mut collected = self.events.lock().unwrap();
        collected.extend(events.iter().map(|e| (LogKind::Truths, e.clone())));
        Ok(())
    }

    async fn receive_commands(&self, _: &PartitionId, events: &[LogEvent]) -> Result<(), ReplicaError> {
        let mut collected = self.events.lock().unwrap();
        collected.extend(events.iter().map(|e| (LogKind::Commands, e.clone())));
        Ok(())
    }
}

/// In-memory upstream authority. Chronicled commands become truths at the
/// head of its log.
#[derive(Default)]
pub struct FakeUpstream {
    truths: Mutex<Vec<LogEvent>>,
    chronicled: Mutex<usize>,
    reject: bool,
}

impl FakeUpstream {
    pub fn with_truths(truths: Vec<LogEvent>) -> Self {
        Self {
            truths: Mutex::new(truths),
            ..Self::default()
        }
    }

    pub fn rejecting() -> Self {
        Self {
            reject: true,
            ..Self::default()
        }
    }

    pub fn add_truth(&self, event: LogEvent) {
        self.truths.lock().unwrap().push(event);
    }

    pub fn chronicled(&self) -> usize {
        *self.chronicled.lock().unwrap()
    }
}

struct FakeConnection {
    upstream: Arc<FakeUpstream>,
}

#[async_trait]
impl Upstream for Arc<FakeUpstream> {
    async fn acquire_connection(
        &self,
        _: &PartitionId,
        _: PushSender,
    ) -> Result<Arc<dyn UpstreamConnection>, UpstreamError> {
        Ok(Arc::new(FakeConnection {
            upstream: self.clone(),
        }))
    }
}

#[async_trait]
impl UpstreamConnection for FakeConnection {
    async fn narrate_event_log(
        &self,
        options: UpstreamNarrateOptions,
    ) -> Result<Vec<LogEvent>, UpstreamError> {
        let truths = self.upstream.truths.lock().unwrap();
        Ok(truths
            .iter()
            .filter(|e| e.log_index >= options.first_event_id)
            .cloned()
            .collect())
    }

    async fn chronicle_events(&self, events: Vec<LogEvent>) -> Result<Vec<LogEvent>, UpstreamError> {
        if self.upstream.reject {
            return Err(UpstreamError::Rejected("read only".to_string()));
        }
        *self.upstream.chronicled.lock().unwrap() += events.len();
        let mut truths = self.upstream.truths.lock().unwrap();
        let confirmed: Vec<LogEvent> = events
            .into_iter()
            .map(|mut event| {
                event.log_index = truths.len() as LogIndex;
                truths.push(event.clone());
                event
            })
            .collect();
        Ok(confirmed)
    }

    async fn prepare_bvob(&self, buffer: Bytes, _: &MediaInfo) -> Result<ContentHash, UpstreamError> {
        Ok(ContentHash::of(&buffer))
    }

    async fn request_media_contents(
        &self,
        requests: &[MediaRequest],
    ) -> Result<Vec<UpstreamContent>, UpstreamError> {
        requests
            .iter()
            .map(|request| match (&request.media_info.content_hash, request.as_url) {
                (Some(hash), true) => Ok(UpstreamContent::Url(format!("https://upstream.test/{hash}"))),
                _ => Err(UpstreamError::Unavailable("no buffers upstream".to_string())),
            })
            .collect()
    }
}

/// A replica over in-memory stores, not yet connected.
pub fn open_replica(
    config: ReplicaConfig,
    upstream: Option<Arc<FakeUpstream>>,
    sink: Arc<dyn EventSink>,
) -> (PartitionReplica, BlobStore) {
    replica_over(
        config,
        Arc::new(MemoryPartitionStore::new()),
        Arc::new(MemoryBlobBackend::new()),
        upstream,
        sink,
    )
}

/// A replica over the given stores, not yet connected.
pub fn replica_over(
    config: ReplicaConfig,
    store: Arc<dyn PartitionStore>,
    backend: Arc<dyn BlobBackend>,
    upstream: Option<Arc<FakeUpstream>>,
    sink: Arc<dyn EventSink>,
) -> (PartitionReplica, BlobStore) {
    let blobs = BlobStore::new(backend);
    let parts = ReplicaParts {
        store,
        blobs: blobs.clone(),
        persisted_media: PersistedMediaMap::new(),
        upstream: upstream.map(|u| Arc::new(u) as Arc<dyn Upstream>),
        sink,
        retry_policy: Arc::new(BackoffPolicy::default()),
        sleeper: Arc::new(NoSleep),
    };
    let replica = PartitionReplica::new(PartitionId::new("test:partition"), config, parts);
    (replica, blobs)
}

pub async fn connected_replica(
    config: ReplicaConfig,
    upstream: Arc<FakeUpstream>,
    sink: Arc<dyn EventSink>,
) -> (PartitionReplica, BlobStore) {
    let (replica, blobs) = open_replica(config, Some(upstream), sink);
    replica.connect(ConnectOptions::default()).await.unwrap();
    (replica, blobs)
}

pub async fn collecting_replica(
    locally_persisted: bool,
    sink: Arc<dyn EventSink>,
) -> (PartitionReplica, BlobStore) {
    let config = ReplicaConfig {
        locally_persisted,
        ..ReplicaConfig::default()
    };
    let (replica, blobs) = open_replica(config, None, sink);
    replica.connect(ConnectOptions::default()).await.unwrap();
    (replica, blobs)
}

pub async fn memory_replica(locally_persisted: bool) -> (PartitionReplica, BlobStore) {
    collecting_replica(locally_persisted, Arc::new(CollectingSink::default())).await
}

