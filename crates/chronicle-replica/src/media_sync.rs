//! Resolution of media content into the blob store, with retries, plus the
//! optimistic mirroring of freshly prepared blobs to the upstream.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tracing::{debug, error, warn};

use chronicle_core::{ContentHash, MediaEntry, MediaInfo};

use crate::blob_store::BlobStore;
use crate::error::ReplicaError;
use crate::retry::{run_with_retries, Retried, RetryPolicy, Sleeper};
use crate::upstream::{MediaRequest, UpstreamConnection, UpstreamContent};

/// Caller-supplied source of media buffers.
pub type RetrieveMediaBuffer =
    Arc<dyn Fn(MediaInfo) -> BoxFuture<'static, Result<Bytes, ReplicaError>> + Send + Sync>;

/// Wrap an async function as a retriever.
pub fn retriever<F, Fut>(f: F) -> RetrieveMediaBuffer
where
    F: Fn(MediaInfo) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes, ReplicaError>> + Send + 'static,
{
    Arc::new(move |info| f(info).boxed())
}

/// A retriever that always fails with `MediaUnavailable`.
pub fn throw_on_media_request() -> RetrieveMediaBuffer {
    retriever(|info: MediaInfo| async move {
        Err::<Bytes, _>(ReplicaError::MediaUnavailable(describe(&info)))
    })
}

pub(crate) fn describe(info: &MediaInfo) -> String {
    match (&info.name, &info.content_hash) {
        (Some(name), _) => name.clone(),
        (None, Some(hash)) => hash.to_string(),
        (None, None) => "<unnamed media>".to_string(),
    }
}

type Process = Shared<BoxFuture<'static, Result<(), ReplicaError>>>;

fn joined(handle: tokio::task::JoinHandle<Result<(), ReplicaError>>) -> Process {
    async move {
        handle
            .await
            .map_err(|e| ReplicaError::Task(e.to_string()))?
    }
    .boxed()
    .shared()
}

/// A blob accepted for local persistence and upstream mirroring.
#[derive(Clone)]
pub struct PreparedBlob {
    pub buffer: Bytes,
    pub content_hash: ContentHash,
    persist: Process,
    upstream: Process,
}

impl PreparedBlob {
    /// Resolves once the blob is stored locally.
    pub async fn persisted(&self) -> Result<(), ReplicaError> {
        self.persist.clone().await
    }

    /// Resolves once the upstream accepted the blob, or immediately when
    /// there is no upstream.
    pub async fn mirrored_upstream(&self) -> Result<(), ReplicaError> {
        self.upstream.clone().await
    }
}

struct MediaSyncInner {
    blobs: BlobStore,
    locally_persisted: bool,
    retry_policy: Arc<dyn RetryPolicy>,
    sleeper: Arc<dyn Sleeper>,
    upstream: RwLock<Option<Arc<dyn UpstreamConnection>>>,
    in_flight: DashMap<ContentHash, PreparedBlob>,
}

#[derive(Clone)]
pub struct MediaSyncEngine {
    inner: Arc<MediaSyncInner>,
}

impl MediaSyncEngine {
    pub fn new(
        blobs: BlobStore,
        locally_persisted: bool,
        retry_policy: Arc<dyn RetryPolicy>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            inner: Arc::new(MediaSyncInner {
                blobs,
                locally_persisted,
                retry_policy,
                sleeper,
                upstream: RwLock::new(None),
                in_flight: DashMap::new(),
            }),
        }
    }

    pub fn set_upstream(&self, connection: Option<Arc<dyn UpstreamConnection>>) {
        *self.inner.upstream.write() = connection;
    }

    fn upstream(&self) -> Option<Arc<dyn UpstreamConnection>> {
        self.inner.upstream.read().clone()
    }

    /// Hash `content` and start storing it locally and mirroring it upstream.
    ///
    /// A declared hash that disagrees with the content is logged and nothing
    /// is stored. Preparing a hash already in flight joins that preparation.
    pub async fn prepare_blob(&self, content: Bytes, media_info: &MediaInfo) -> Option<PreparedBlob> {
        let content_hash = ContentHash::of(&content);
        if let Some(declared) = &media_info.content_hash {
            if *declared != content_hash {
                warn!(
                    "Content of {} hashes to {}, expected {}; not storing",
                    describe(media_info),
                    content_hash,
                    declared
                );
                return None;
            }
        }

        let vacant = match self.inner.in_flight.entry(content_hash.clone()) {
            Entry::Occupied(existing) => return Some(existing.get().clone()),
            Entry::Vacant(vacant) => vacant,
        };

        let persist = {
            let engine = self.clone();
            let buffer = content.clone();
            let hash = content_hash.clone();
            joined(tokio::spawn(async move {
                let result = if engine.inner.locally_persisted {
                    engine.inner.blobs.write(buffer, &hash, 0).await.map(|_| ())
                } else {
                    engine.inner.blobs.cache_in_memory(buffer, &hash)
                };
                engine.inner.in_flight.remove(&hash);
                result.map_err(ReplicaError::from)
            }))
        };

        let upstream = match self.upstream() {
            Some(connection) => {
                let policy = self.inner.retry_policy.clone();
                let sleeper = self.inner.sleeper.clone();
                let buffer = content.clone();
                let info = media_info.clone();
                joined(tokio::spawn(async move {
                    let operation = format!("prepare bvob {}", describe(&info));
                    let result = run_with_retries(&operation, &*policy, &*sleeper, |_| {
                        let connection = connection.clone();
                        let buffer = buffer.clone();
                        let info = info.clone();
                        async move {
                            connection
                                .prepare_bvob(buffer, &info)
                                .await
                                .map_err(ReplicaError::from)
                        }
                    })
                    .await;
                    if let Err(e) = &result {
                        error!("Upstream preparation of {} failed: {}", describe(&info), e);
                    }
                    result.map(|_| ())
                }))
            }
            None => futures::future::ready(Ok(())).boxed().shared(),
        };

        let prepared = PreparedBlob {
            buffer: content,
            content_hash,
            persist,
            upstream,
        };
        vacant.insert(prepared.clone());
        Some(prepared)
    }

    /// Make the content of `entry` available locally.
    ///
    /// Content already cached or stored is left alone. Otherwise `retrieve`
    /// (or the upstream, when connected) is asked for it under the retry
    /// policy, `retry_policy` when given and the engine's own otherwise. The
    /// success value carries the errors of retried attempts.
    pub async fn sync_media_content(
        &self,
        entry: &MediaEntry,
        retrieve: Option<RetrieveMediaBuffer>,
        retry_policy: Option<Arc<dyn RetryPolicy>>,
    ) -> Result<Retried<Option<ContentHash>>, ReplicaError> {
        let done = |hash: Option<ContentHash>| Retried {
            value: hash,
            failures: Vec::new(),
        };
        let Some(content_hash) = entry.media_info.content_hash.clone() else {
            return Ok(done(None));
        };
        let blobs = &self.inner.blobs;

        if blobs.is_durable(&content_hash).await? {
            return Ok(done(Some(content_hash)));
        }
        if let Some(cached) = blobs.try_get_cached(&content_hash) {
            if self.inner.locally_persisted {
                blobs.write(cached, &content_hash, 0).await?;
            }
            debug!("Media {} served from memory", entry.media_id);
            return Ok(done(Some(content_hash)));
        }
        let in_flight = self
            .inner
            .in_flight
            .get(&content_hash)
            .map(|prepared| prepared.value().clone());
        if let Some(prepared) = in_flight {
            prepared.persisted().await?;
            return Ok(done(Some(content_hash)));
        }

        let retrieve = retrieve
            .or_else(|| self.upstream_retriever())
            .unwrap_or_else(throw_on_media_request);
        let info = entry.media_info.clone();
        let operation = format!("sync media {}", entry.media_id);
        let policy = retry_policy.unwrap_or_else(|| self.inner.retry_policy.clone());

        run_with_retries(
            &operation,
            &*policy,
            &*self.inner.sleeper,
            |_| {
                let engine = self.clone();
                let retrieve = retrieve.clone();
                let info = info.clone();
                let declared = content_hash.clone();
                async move {
                    let content = retrieve(info.clone()).await?;
                    if !declared.matches(&content) {
                        return Err(ReplicaError::HashMismatch {
                            declared,
                            actual: ContentHash::of(&content),
                        });
                    }
                    let prepared = engine.prepare_blob(content, &info).await.ok_or_else(|| {
                        ReplicaError::MediaRetrieval {
                            media: describe(&info),
                            reason: "content rejected".to_string(),
                        }
                    })?;
                    prepared.persisted().await?;
                    Ok(Some(prepared.content_hash))
                }
            },
        )
        .await
    }

    fn upstream_retriever(&self) -> Option<RetrieveMediaBuffer> {
        let connection = self.upstream()?;
        Some(retriever(move |info: MediaInfo| {
            let connection = connection.clone();
            async move {
                let request = MediaRequest {
                    media_info: info.clone(),
                    as_url: false,
                };
                let contents = connection
                    .request_media_contents(std::slice::from_ref(&request))
                    .await?;
                match contents.into_iter().next() {
                    Some(UpstreamContent::Buffer(buffer)) => Ok(buffer),
                    _ => Err(ReplicaError::MediaRetrieval {
                        media: describe(&info),
                        reason: "upstream returned no buffer".to_string(),
                    }),
                }
            }
        }))
    }
}
