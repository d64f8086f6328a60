//! Content-addressable blob cache shared by every open partition.
//!
//! Each hash has one record in a concurrent index. A record carries two
//! independent reference counts: the durable persist count mirrored from the
//! backend, and a process-local in-memory count that pins the buffer and its
//! decodings in memory. Concurrent writes or reads of one hash join the same
//! in-flight future; unrelated hashes never contend.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tracing::{debug, info, warn};

use chronicle_core::{BlobBackend, BlobError, BlobMeta, ContentHash, StorageError};

type PendingRead = Shared<BoxFuture<'static, Result<Bytes, BlobError>>>;
type PendingWrite = Shared<BoxFuture<'static, Result<BlobMeta, BlobError>>>;

/// A cached decoding result.
pub type Decoded = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
struct BlobRecord {
    byte_length: Option<u64>,
    persist_ref_count: i64,
    in_memory_ref_count: i64,
    durable: bool,
    buffer: Option<Bytes>,
    pending_read: Option<PendingRead>,
    pending_write: Option<PendingWrite>,
    decodings: HashMap<String, Decoded>,
}

impl BlobRecord {
    fn check_length(&self, content_hash: &ContentHash, byte_length: u64) -> Result<(), BlobError> {
        match self.byte_length {
            Some(known) if known != byte_length => Err(BlobError::ContentIntegrity {
                content_hash: content_hash.clone(),
                detail: format!("byte length {} differs from recorded {}", byte_length, known),
            }),
            _ => Ok(()),
        }
    }

    fn settle(&mut self, meta: &BlobMeta) {
        self.durable = true;
        self.byte_length = Some(meta.byte_length);
        self.persist_ref_count = meta.persist_ref_count;
    }

    /// Nothing left worth indexing.
    fn is_vacant(&self) -> bool {
        !self.durable
            && self.buffer.is_none()
            && self.pending_read.is_none()
            && self.pending_write.is_none()
            && self.in_memory_ref_count == 0
            && self.persist_ref_count == 0
    }
}

/// Point-in-time view of a blob record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobSnapshot {
    pub byte_length: Option<u64>,
    pub persist_ref_count: i64,
    pub in_memory_ref_count: i64,
    pub durable: bool,
    pub has_buffer: bool,
    pub decodings: usize,
}

struct BlobStoreInner {
    backend: Arc<dyn BlobBackend>,
    records: DashMap<ContentHash, BlobRecord>,
}

/// Shared handle to the blob cache.
#[derive(Clone)]
pub struct BlobStore {
    inner: Arc<BlobStoreInner>,
}

async fn blocking<T, F>(f: F) -> Result<T, BlobError>
where
    F: FnOnce() -> Result<T, BlobError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BlobError::Storage(StorageError::Database(format!("blob task failed: {e}"))))?
}

fn verify_digest(content_hash: &ContentHash, buffer: &[u8]) -> Result<(), BlobError> {
    if content_hash.matches(buffer) {
        return Ok(());
    }
    Err(BlobError::ContentIntegrity {
        content_hash: content_hash.clone(),
        detail: format!("buffer digests to {}", ContentHash::of(buffer)),
    })
}

impl BlobStore {
    pub fn new(backend: Arc<dyn BlobBackend>) -> Self {
        Self {
            inner: Arc::new(BlobStoreInner {
                backend,
                records: DashMap::new(),
            }),
        }
    }

    /// Store `buffer` under `content_hash`, writing it durably at most once.
    ///
    /// A positive `initial_persist_refs` is added to the stored persist count
    /// whether or not this call performed the write.
    pub async fn write(
        &self,
        buffer: Bytes,
        content_hash: &ContentHash,
        initial_persist_refs: i64,
    ) -> Result<ContentHash, BlobError> {
        verify_digest(content_hash, &buffer)?;
        let byte_length = buffer.len() as u64;
        let initial = initial_persist_refs.max(0);

        let plan = {
            let mut record = self.inner.records.entry(content_hash.clone()).or_default();
            record.check_length(content_hash, byte_length)?;

            if record.durable {
                None
            } else {
                match &record.pending_write {
                    Some(pending) => Some((pending.clone(), true)),
                    None => {
                        let pending =
                            self.durable_write(buffer.clone(), content_hash.clone(), initial);
                        record.pending_write = Some(pending.clone());
                        Some((pending, false))
                    }
                }
            }
        };

        let Some((pending, joined)) = plan else {
            if initial > 0 {
                self.adjust_persist_ref_counts(&[(content_hash.clone(), initial)])
                    .await?;
            }
            debug!("Blob {} already durable, skipping write", content_hash);
            return Ok(content_hash.clone());
        };

        let result = pending.await;

        if let Some(mut record) = self.inner.records.get_mut(content_hash) {
            record.pending_write = None;
            if let Ok(meta) = &result {
                record.settle(meta);
            }
        }
        let meta = result?;

        if joined && initial > 0 {
            self.adjust_persist_ref_counts(&[(content_hash.clone(), initial)])
                .await?;
        }
        debug!("Blob {} written ({} bytes)", content_hash, meta.byte_length);
        Ok(content_hash.clone())
    }

    fn durable_write(&self, buffer: Bytes, content_hash: ContentHash, initial: i64) -> PendingWrite {
        let backend = self.inner.backend.clone();
        async move {
            blocking(move || match backend.get_meta(&content_hash)? {
                Some(existing) => {
                    if existing.byte_length != buffer.len() as u64 {
                        return Err(BlobError::ContentIntegrity {
                            content_hash: content_hash.clone(),
                            detail: format!(
                                "byte length {} differs from stored {}",
                                buffer.len(),
                                existing.byte_length
                            ),
                        });
                    }
                    if initial == 0 {
                        return Ok(existing);
                    }
                    let updated = backend.adjust_persist_refs(&[(content_hash, initial)])?;
                    Ok(updated.into_iter().next().unwrap_or(existing))
                }
                None => {
                    let meta = BlobMeta::new(content_hash, buffer.len() as u64, initial);
                    backend.put(&meta, &buffer)?;
                    Ok(meta)
                }
            })
            .await
        }
        .boxed()
        .shared()
    }

    /// Publish a buffer in memory only. Used by partitions that do not
    /// persist locally.
    pub fn cache_in_memory(&self, buffer: Bytes, content_hash: &ContentHash) -> Result<(), BlobError> {
        verify_digest(content_hash, &buffer)?;
        let mut record = self.inner.records.entry(content_hash.clone()).or_default();
        record.check_length(content_hash, buffer.len() as u64)?;
        record.byte_length = Some(buffer.len() as u64);
        if record.buffer.is_none() {
            record.buffer = Some(buffer);
        }
        Ok(())
    }

    /// Read a buffer, from memory when cached, otherwise with one durable
    /// read shared by all concurrent readers.
    pub async fn read(&self, content_hash: &ContentHash) -> Result<Bytes, BlobError> {
        let pending = {
            let mut record = self.inner.records.entry(content_hash.clone()).or_default();
            if let Some(buffer) = &record.buffer {
                return Ok(buffer.clone());
            }
            match &record.pending_read {
                Some(pending) => pending.clone(),
                None => {
                    let pending = self.durable_read(content_hash.clone());
                    record.pending_read = Some(pending.clone());
                    pending
                }
            }
        };

        let result = pending.await;

        let vacant = match self.inner.records.get_mut(content_hash) {
            Some(mut record) => {
                record.pending_read = None;
                if let Ok(buffer) = &result {
                    record.durable = true;
                    record.byte_length = Some(buffer.len() as u64);
                    if record.in_memory_ref_count > 0 && record.buffer.is_none() {
                        record.buffer = Some(buffer.clone());
                    }
                }
                record.is_vacant()
            }
            None => false,
        };
        if vacant {
            self.inner.records.remove_if(content_hash, |_, r| r.is_vacant());
        }

        result
    }

    fn durable_read(&self, content_hash: ContentHash) -> PendingRead {
        let backend = self.inner.backend.clone();
        async move {
            blocking(move || match backend.read_buffer(&content_hash)? {
                Some(buffer) => Ok(Bytes::from(buffer)),
                None => Err(BlobError::NotFound(content_hash)),
            })
            .await
        }
        .boxed()
        .shared()
    }

    /// The in-memory buffer, if one is cached.
    pub fn try_get_cached(&self, content_hash: &ContentHash) -> Option<Bytes> {
        self.inner
            .records
            .get(content_hash)
            .and_then(|record| record.buffer.clone())
    }

    /// Whether the blob is known to be durably stored, consulting the backend
    /// when the index has no record.
    pub async fn is_durable(&self, content_hash: &ContentHash) -> Result<bool, BlobError> {
        if let Some(record) = self.inner.records.get(content_hash) {
            if record.durable {
                return Ok(true);
            }
        }
        let backend = self.inner.backend.clone();
        let hash = content_hash.clone();
        let meta = blocking(move || Ok(backend.get_meta(&hash)?)).await?;

        match meta {
            Some(meta) => {
                self.inner
                    .records
                    .entry(content_hash.clone())
                    .or_default()
                    .settle(&meta);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Apply durable ref-count deltas atomically, clamping at zero.
    pub async fn adjust_persist_ref_counts(
        &self,
        deltas: &[(ContentHash, i64)],
    ) -> Result<(), BlobError> {
        let deltas: Vec<(ContentHash, i64)> =
            deltas.iter().filter(|(_, d)| *d != 0).cloned().collect();
        if deltas.is_empty() {
            return Ok(());
        }

        let backend = self.inner.backend.clone();
        let requested = deltas.clone();
        let updated = blocking(move || Ok(backend.adjust_persist_refs(&deltas)?)).await?;

        for (content_hash, delta) in &requested {
            if !updated.iter().any(|meta| &meta.content_hash == content_hash) {
                warn!(
                    "Dropped persist ref delta {} for {}: no stored blob",
                    delta, content_hash
                );
            }
        }
        for meta in &updated {
            self.inner
                .records
                .entry(meta.content_hash.clone())
                .or_default()
                .settle(meta);
        }
        Ok(())
    }

    /// Apply in-memory ref-count deltas, clamping at zero.
    ///
    /// A count rising from zero loads the buffer in the background; a count
    /// dropping to zero evicts the buffer and its decodings.
    pub fn adjust_in_memory_ref_counts(&self, deltas: &[(ContentHash, i64)]) {
        for (content_hash, delta) in deltas {
            if *delta == 0 {
                continue;
            }

            let (needs_load, vacant) = {
                let mut record = self.inner.records.entry(content_hash.clone()).or_default();
                let before = record.in_memory_ref_count;
                let after = (before + delta).max(0);
                record.in_memory_ref_count = after;

                if before > 0 && after == 0 {
                    record.buffer = None;
                    record.decodings.clear();
                }
                let needs_load = before == 0 && after > 0 && record.buffer.is_none();
                (needs_load, record.is_vacant())
            };

            if vacant {
                self.inner.records.remove_if(content_hash, |_, r| r.is_vacant());
            }
            if needs_load {
                self.load_in_background(content_hash.clone());
            }
        }
    }

    fn load_in_background(&self, content_hash: ContentHash) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime to preload blob {}, deferring to first read", content_hash);
            return;
        };
        let store = self.clone();
        handle.spawn(async move {
            if let Err(e) = store.read(&content_hash).await {
                warn!("Failed to preload blob {}: {}", content_hash, e);
            }
        });
    }

    /// A cached decoding of the blob by `decoder_id`.
    pub fn cached_decoding(&self, content_hash: &ContentHash, decoder_id: &str) -> Option<Decoded> {
        self.inner
            .records
            .get(content_hash)
            .and_then(|record| record.decodings.get(decoder_id).cloned())
    }

    /// Cache a decoding. Only blobs pinned in memory keep decodings.
    pub fn store_decoding(&self, content_hash: &ContentHash, decoder_id: &str, decoded: Decoded) {
        if let Some(mut record) = self.inner.records.get_mut(content_hash) {
            if record.in_memory_ref_count > 0 {
                record.decodings.insert(decoder_id.to_string(), decoded);
            }
        }
    }

    pub fn snapshot(&self, content_hash: &ContentHash) -> Option<BlobSnapshot> {
        self.inner.records.get(content_hash).map(|record| BlobSnapshot {
            byte_length: record.byte_length,
            persist_ref_count: record.persist_ref_count,
            in_memory_ref_count: record.in_memory_ref_count,
            durable: record.durable,
            has_buffer: record.buffer.is_some(),
            decodings: record.decodings.len(),
        })
    }

    /// Delete durable records no partition references and nothing holds in
    /// memory. Returns the number of records removed.
    pub async fn compact(&self) -> Result<usize, BlobError> {
        let backend = self.inner.backend.clone();
        let metas = blocking(move || Ok(backend.all_meta()?)).await?;

        let doomed: Vec<ContentHash> = metas
            .into_iter()
            .filter(|meta| meta.persist_ref_count == 0)
            .map(|meta| meta.content_hash)
            .filter(|hash| {
                self.inner.records.get(hash).map_or(true, |record| {
                    record.in_memory_ref_count == 0
                        && record.pending_read.is_none()
                        && record.pending_write.is_none()
                })
            })
            .collect();

        if doomed.is_empty() {
            return Ok(0);
        }

        let backend = self.inner.backend.clone();
        let hashes = doomed.clone();
        blocking(move || Ok(backend.delete(&hashes)?)).await?;

        for hash in &doomed {
            self.inner.records.remove(hash);
        }
        info!("Compacted {} unreferenced blobs", doomed.len());
        Ok(doomed.len())
    }
}
