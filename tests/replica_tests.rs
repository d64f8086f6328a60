use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use serde_json::json;
use tempfile::tempdir;

use chronicle_core::{
    Action, BlobBackend, BlobError, BlobMeta, CommandId, ContentHash, EventRange, LogError,
    LogEvent, LogIndex, LogKind, LogStore, MediaEntry, MediaInfo, PartitionId, StorageError,
    MEDIA_TYPE_NAME,
};
use chronicle_db::{init_database, RedbBlobBackend, RedbPartitionStore};
use chronicle_replica::{
    retriever, BackoffPolicy, BlobStore, ChronicleOptions, EventSink, MediaRequest,
    MediaSyncEngine, OpenOptions, PushSender, ReceiveOptions, RegistryConfig, ReplicaError,
    ReplicaRegistry, Sleeper, Upstream, UpstreamConnection, UpstreamContent, UpstreamError,
    UpstreamNarrateOptions,
};

// ============================================================================
// Fixtures
// ============================================================================

struct NoSleep;

impl Sleeper for NoSleep {
    fn sleep(&self, _: Duration) -> BoxFuture<'static, ()> {
        Box::pin(async {})
    }
}

/// Redb blob backend that counts durable writes.
struct CountingBackend {
    inner: RedbBlobBackend,
    puts: AtomicUsize,
}

impl BlobBackend for CountingBackend {
    fn get_meta(&self, content_hash: &ContentHash) -> Result<Option<BlobMeta>, StorageError> {
        self.inner.get_meta(content_hash)
    }

    fn all_meta(&self) -> Result<Vec<BlobMeta>, StorageError> {
        self.inner.all_meta()
    }

    fn put(&self, meta: &BlobMeta, buffer: &[u8]) -> Result<(), StorageError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put(meta, buffer)
    }

    fn read_buffer(&self, content_hash: &ContentHash) -> Result<Option<Vec<u8>>, StorageError> {
        self.inner.read_buffer(content_hash)
    }

    fn adjust_persist_refs(
        &self,
        deltas: &[(ContentHash, i64)],
    ) -> Result<Vec<BlobMeta>, StorageError> {
        self.inner.adjust_persist_refs(deltas)
    }

    fn delete(&self, hashes: &[ContentHash]) -> Result<(), StorageError> {
        self.inner.delete(hashes)
    }
}

#[derive(Default)]
struct CollectingSink {
    events: Mutex<Vec<(LogKind, LogIndex)>>,
}

#[async_trait]
impl EventSink for CollectingSink {
    async fn receive_truths(&self, _: &PartitionId, events: &[LogEvent]) -> Result<(), ReplicaError> {
        let mut collected = self.events.lock().unwrap();
        collected.extend(events.iter().map(|e| (LogKind::Truths, e.log_index)));
        Ok(())
    }

    async fn receive_commands(&self, _: &PartitionId, events: &[LogEvent]) -> Result<(), ReplicaError> {
        let mut collected = self.events.lock().unwrap();
        collected.extend(events.iter().map(|e| (LogKind::Commands, e.log_index)));
        Ok(())
    }
}

/// Upstream that confirms every command at the head of its log.
#[derive(Default)]
struct ConfirmingUpstream {
    truths: Arc<Mutex<Vec<LogEvent>>>,
}

struct ConfirmingConnection {
    truths: Arc<Mutex<Vec<LogEvent>>>,
}

#[async_trait]
impl Upstream for ConfirmingUpstream {
    async fn acquire_connection(
        &self,
        _: &PartitionId,
        _: PushSender,
    ) -> Result<Arc<dyn UpstreamConnection>, UpstreamError> {
        Ok(Arc::new(ConfirmingConnection {
            truths: self.truths.clone(),
        }))
    }
}

#[async_trait]
impl UpstreamConnection for ConfirmingConnection {
    async fn narrate_event_log(
        &self,
        options: UpstreamNarrateOptions,
    ) -> Result<Vec<LogEvent>, UpstreamError> {
        let truths = self.truths.lock().unwrap();
        Ok(truths
            .iter()
            .filter(|e| e.log_index >= options.first_event_id)
            .cloned()
            .collect())
    }

    async fn chronicle_events(&self, events: Vec<LogEvent>) -> Result<Vec<LogEvent>, UpstreamError> {
        let mut truths = self.truths.lock().unwrap();
        Ok(events
            .into_iter()
            .map(|mut event| {
                event.log_index = truths.len() as LogIndex;
                truths.push(event.clone());
                event
            })
            .collect())
    }

    async fn prepare_bvob(&self, buffer: Bytes, _: &MediaInfo) -> Result<ContentHash, UpstreamError> {
        Ok(ContentHash::of(&buffer))
    }

    async fn request_media_contents(
        &self,
        _: &[MediaRequest],
    ) -> Result<Vec<UpstreamContent>, UpstreamError> {
        Err(UpstreamError::Unavailable("no media upstream".to_string()))
    }
}

fn registry_at(path: &Path, upstream: Option<Arc<dyn Upstream>>) -> ReplicaRegistry {
    let db = init_database(path).unwrap();
    ReplicaRegistry::new(
        Arc::new(RedbBlobBackend::new(db.clone())),
        Arc::new(RedbPartitionStore::new(db)),
        upstream,
        RegistryConfig {
            sleeper: Arc::new(NoSleep),
            ..RegistryConfig::default()
        },
    )
}

fn event(index: LogIndex, command: &str) -> LogEvent {
    LogEvent::new(index, CommandId::new(command), Vec::new())
}

fn create_media(index: LogIndex, media_id: &str, hash: &ContentHash) -> LogEvent {
    LogEvent::new(
        index,
        CommandId::new(format!("create-{media_id}")),
        vec![Action::created(
            media_id,
            MEDIA_TYPE_NAME,
            json!({ "name": media_id, "mimeType": "text/plain", "content": hash.as_str() }),
        )],
    )
}

fn destroy_media(index: LogIndex, media_id: &str) -> LogEvent {
    LogEvent::new(
        index,
        CommandId::new(format!("destroy-{media_id}")),
        vec![Action::destroyed(media_id, MEDIA_TYPE_NAME)],
    )
}

fn offline() -> OpenOptions {
    OpenOptions {
        connect_upstream: false,
        ..OpenOptions::default()
    }
}

// ============================================================================
// Content addressing
// ============================================================================

#[tokio::test]
async fn test_hello_is_written_once() {
    let dir = tempdir().unwrap();
    let db = init_database(dir.path().join("blobs.redb")).unwrap();
    let backend = Arc::new(CountingBackend {
        inner: RedbBlobBackend::new(db),
        puts: AtomicUsize::new(0),
    });
    let blobs = BlobStore::new(backend.clone());

    let hello = Bytes::from_static(b"hello");
    let h1 = ContentHash::of(&hello);
    blobs.write(hello.clone(), &h1, 0).await.unwrap();
    assert_eq!(blobs.read(&h1).await.unwrap(), hello);

    blobs.write(hello, &h1, 0).await.unwrap();
    assert_eq!(backend.puts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_mismatched_buffer_persists_nothing() {
    let dir = tempdir().unwrap();
    let db = init_database(dir.path().join("blobs.redb")).unwrap();
    let backend = Arc::new(RedbBlobBackend::new(db));
    let blobs = BlobStore::new(backend.clone());

    let declared = ContentHash::of(b"what was promised");
    let err = blobs
        .write(Bytes::from_static(b"what arrived"), &declared, 1)
        .await
        .unwrap_err();

    assert!(matches!(err, BlobError::ContentIntegrity { .. }));
    assert!(backend.get_meta(&declared).unwrap().is_none());
}

// ============================================================================
// Log rules
// ============================================================================

#[test]
fn test_differing_command_at_occupied_index_conflicts() {
    let dir = tempdir().unwrap();
    let store = RedbPartitionStore::new(init_database(dir.path().join("log.redb")).unwrap());
    let partition = PartitionId::new("chronicle://test/log");

    store
        .append(&partition, LogKind::Truths, &[event(0, "A")])
        .unwrap();
    store
        .append(&partition, LogKind::Truths, &[event(0, "A")])
        .unwrap();
    let err = store
        .append(&partition, LogKind::Truths, &[event(0, "X")])
        .unwrap_err();

    assert!(matches!(err, LogError::Conflict { log_index: 0, .. }));
    assert_eq!(
        store.range(&partition, LogKind::Truths).unwrap(),
        EventRange::new(0, 1)
    );
}

// ============================================================================
// Media sync
// ============================================================================

#[tokio::test]
async fn test_retriever_failing_twice_reports_two_errors() {
    let dir = tempdir().unwrap();
    let db = init_database(dir.path().join("media.redb")).unwrap();
    let blobs = BlobStore::new(Arc::new(RedbBlobBackend::new(db)));
    let engine = MediaSyncEngine::new(
        blobs.clone(),
        true,
        Arc::new(BackoffPolicy::default()),
        Arc::new(NoSleep),
    );

    let content = Bytes::from_static(b"third time lucky");
    let hash = ContentHash::of(&content);
    let mut entry = MediaEntry::new("m1", 0);
    entry.media_info.content_hash = Some(hash.clone());
    entry.is_persisted = true;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let flaky = retriever(move |info: MediaInfo| {
        let content = content.clone();
        let call = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if call < 2 {
                return Err(ReplicaError::MediaRetrieval {
                    media: info.name.unwrap_or_default(),
                    reason: format!("attempt {} timed out", call + 1),
                });
            }
            Ok(content)
        }
    });

    let synced = engine.sync_media_content(&entry, Some(flaky), None).await.unwrap();

    assert_eq!(synced.value, Some(hash.clone()));
    assert_eq!(synced.failures.len(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(blobs.is_durable(&hash).await.unwrap());
}

// ============================================================================
// Replica lifecycle over redb
// ============================================================================

#[tokio::test]
async fn test_narration_delivers_truths_then_commands_once() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("narrate.redb");
    let partition = PartitionId::new("chronicle://test/narrate");

    {
        let registry = registry_at(&path, None);
        let (replica, _) = registry.open_partition(partition.clone(), offline()).await.unwrap();
        replica
            .receive_truths((0..3).map(|i| event(i, &format!("t{i}"))).collect(), ReceiveOptions::default())
            .await
            .unwrap();
        replica
            .receive_commands(vec![event(3, "c3"), event(4, "c4")], ReceiveOptions::default())
            .await
            .unwrap();
        registry.close_partition(&partition);
    }

    let registry = registry_at(&path, None);
    let sink = Arc::new(CollectingSink::default());
    let (replica, narration) = registry
        .open_partition(
            partition.clone(),
            OpenOptions {
                sink: Some(sink.clone()),
                ..offline()
            },
        )
        .await
        .unwrap();

    let narration = narration.unwrap();
    assert_eq!(narration.truths.len(), 3);
    assert_eq!(narration.commands.len(), 2);
    assert_eq!(
        *sink.events.lock().unwrap(),
        vec![
            (LogKind::Truths, 0),
            (LogKind::Truths, 1),
            (LogKind::Truths, 2),
            (LogKind::Commands, 3),
            (LogKind::Commands, 4),
        ]
    );
    assert_eq!(replica.ranges().commands, EventRange::new(3, 5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_receives_accept_each_truth_once() {
    let dir = tempdir().unwrap();
    let sink = Arc::new(CollectingSink::default());
    let registry = registry_at(&dir.path().join("concurrent.redb"), None);
    let (replica, _) = registry
        .open_partition(
            PartitionId::new("chronicle://test/concurrent"),
            OpenOptions {
                sink: Some(sink.clone()),
                ..offline()
            },
        )
        .await
        .unwrap();

    let batch: Vec<LogEvent> = (0..20).map(|i| event(i, &format!("t{i}"))).collect();
    let handles: Vec<_> = (0..20)
        .map(|_| {
            let replica = replica.clone();
            let batch = batch.clone();
            tokio::spawn(async move { replica.receive_truths(batch, ReceiveOptions::default()).await })
        })
        .collect();

    let mut accepted = Vec::new();
    for handle in handles {
        let results = handle.await.unwrap().unwrap();
        accepted.extend(results.into_iter().flatten().map(|e| e.log_index));
    }
    accepted.sort_unstable();

    assert_eq!(accepted, (0..20).collect::<Vec<LogIndex>>());
    assert_eq!(replica.ranges().truths, EventRange::new(0, 20));
    assert_eq!(
        *sink.events.lock().unwrap(),
        (0..20).map(|i| (LogKind::Truths, i)).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn test_ref_counts_follow_media_entries() {
    let dir = tempdir().unwrap();
    let registry = registry_at(&dir.path().join("refs.redb"), None);
    let a = PartitionId::new("chronicle://test/a");
    let b = PartitionId::new("chronicle://test/b");
    let (replica_a, _) = registry.open_partition(a.clone(), offline()).await.unwrap();
    let (replica_b, _) = registry.open_partition(b.clone(), offline()).await.unwrap();

    let content = Bytes::from_static(b"shared picture");
    let hash = ContentHash::of(&content);
    let fetch = ReceiveOptions {
        retrieve: Some(retriever(move |_| {
            let content = content.clone();
            async move { Ok::<_, ReplicaError>(content) }
        })),
        ..ReceiveOptions::default()
    };

    replica_a
        .receive_truths(vec![create_media(0, "pic-a", &hash)], fetch.clone())
        .await
        .unwrap();
    replica_b
        .receive_truths(vec![create_media(0, "pic-b", &hash)], fetch)
        .await
        .unwrap();
    let snapshot = registry.blob_store().snapshot(&hash).unwrap();
    assert_eq!((snapshot.persist_ref_count, snapshot.in_memory_ref_count), (2, 2));

    replica_a
        .receive_truths(vec![destroy_media(1, "pic-a")], ReceiveOptions::default())
        .await
        .unwrap();
    let snapshot = registry.blob_store().snapshot(&hash).unwrap();
    assert_eq!((snapshot.persist_ref_count, snapshot.in_memory_ref_count), (1, 1));

    registry.close_partition(&b);
    let snapshot = registry.blob_store().snapshot(&hash).unwrap();
    assert_eq!((snapshot.persist_ref_count, snapshot.in_memory_ref_count), (1, 0));
    assert!(registry.persisted_media("pic-b").is_none());

    let orphan = Bytes::from_static(b"nobody wants me");
    let orphan_hash = ContentHash::of(&orphan);
    registry.write_blob(orphan, &orphan_hash, 0).await.unwrap();

    assert_eq!(registry.compact_blobs().await.unwrap(), 1);
    assert!(matches!(
        registry.read_blob(&orphan_hash).await,
        Err(BlobError::NotFound(_))
    ));
    assert_eq!(registry.read_blob(&hash).await.unwrap(), Bytes::from_static(b"shared picture"));
}

#[tokio::test]
async fn test_chronicled_command_becomes_truth() {
    let dir = tempdir().unwrap();
    let partition = PartitionId::new("chronicle://test/chronicle");
    let upstream: Arc<dyn Upstream> = Arc::new(ConfirmingUpstream::default());
    let registry = registry_at(&dir.path().join("chronicle.redb"), Some(upstream));

    let (replica, _) = registry
        .open_partition(partition.clone(), OpenOptions::default())
        .await
        .unwrap();
    assert!(replica.has_upstream());

    let result = replica
        .chronicle_events(vec![LogEvent::command(Vec::new())], ChronicleOptions::default())
        .await
        .unwrap();
    let truth = result.event_results[0].truth_event().await.unwrap();
    assert_eq!(truth.log_index, 0);
    assert!(replica.ranges().commands.is_empty());

    // Reloading from the database sees the truth and an empty queue
    registry.close_partition(&partition);
    let (reopened, _) = registry.open_partition(partition, offline()).await.unwrap();
    assert_eq!(reopened.ranges().truths, EventRange::new(0, 1));
    assert!(reopened.ranges().commands.is_empty());
    assert_eq!(reopened.ranges().expected_next(LogKind::Commands), 1);
}
