use crate::blob::{BlobMeta, ContentHash};
use crate::error::{LogError, StorageError};
use crate::event::{CommandId, EventRange, LogEvent, LogIndex, LogKind, PartitionId};
use crate::media::{MediaChange, MediaEntry};

/// Append-only storage of a partition's truth and command sequences.
pub trait LogStore: Send + Sync {
    /// Current `[first, next)` range of a sequence.
    fn range(&self, partition: &PartitionId, kind: LogKind) -> Result<EventRange, StorageError>;

    /// Append events at the next free indices.
    /// Resending an event already stored with the same command id is a no-op.
    fn append(
        &self,
        partition: &PartitionId,
        kind: LogKind,
        events: &[LogEvent],
    ) -> Result<(), LogError>;

    /// Inclusive range scan. Empty or out-of-bounds ranges yield no events.
    fn read_range(
        &self,
        partition: &PartitionId,
        kind: LogKind,
        first: LogIndex,
        last: LogIndex,
    ) -> Result<Vec<LogEvent>, StorageError>;

    /// Delete an inclusive range, returning the removed events.
    /// With `expected`, every removed record must carry the matching command id
    /// (positionally) or nothing is deleted.
    fn delete_range(
        &self,
        partition: &PartitionId,
        kind: LogKind,
        first: LogIndex,
        last: LogIndex,
        expected: Option<&[CommandId]>,
    ) -> Result<Vec<LogEvent>, LogError>;
}

/// Storage of a partition's media entries.
pub trait MediaStore: Send + Sync {
    fn get_media(
        &self,
        partition: &PartitionId,
        media_id: &str,
    ) -> Result<Option<MediaEntry>, StorageError>;

    fn get_all_media(&self, partition: &PartitionId) -> Result<Vec<MediaEntry>, StorageError>;

    /// Store an entry unless a version with an equal or later log index exists.
    /// Returns whether the entry was written.
    fn upsert_media(&self, partition: &PartitionId, entry: MediaEntry)
        -> Result<bool, StorageError>;

    /// Remove an entry. Returns whether one was removed.
    fn remove_media(&self, partition: &PartitionId, media_id: &str) -> Result<bool, StorageError>;
}

/// Combined partition storage with an atomic per-event commit.
pub trait PartitionStore: LogStore + MediaStore {
    /// Append one event and apply its media changes in a single transaction.
    fn commit(
        &self,
        partition: &PartitionId,
        kind: LogKind,
        event: &LogEvent,
        media: &[MediaChange],
    ) -> Result<(), LogError>;
}

/// Process-wide durable storage for blob metadata and content.
pub trait BlobBackend: Send + Sync {
    fn get_meta(&self, content_hash: &ContentHash) -> Result<Option<BlobMeta>, StorageError>;

    fn all_meta(&self) -> Result<Vec<BlobMeta>, StorageError>;

    /// Write metadata and buffer together.
    fn put(&self, meta: &BlobMeta, buffer: &[u8]) -> Result<(), StorageError>;

    fn read_buffer(&self, content_hash: &ContentHash) -> Result<Option<Vec<u8>>, StorageError>;

    /// Apply persist ref-count deltas in one transaction, clamping at zero.
    /// Returns the updated metadata; hashes without a record are skipped.
    fn adjust_persist_refs(
        &self,
        deltas: &[(ContentHash, i64)],
    ) -> Result<Vec<BlobMeta>, StorageError>;

    /// Physically remove records and their buffers.
    fn delete(&self, hashes: &[ContentHash]) -> Result<(), StorageError>;
}

/// In-memory implementations, used for memory-only partitions and in tests.
pub mod memory {
    use super::*;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use parking_lot::RwLock;

    use crate::log::{check_expected_ids, plan_append};

    #[derive(Default)]
    struct Sequence {
        events: BTreeMap<LogIndex, LogEvent>,
        next: LogIndex,
    }

    impl Sequence {
        fn range(&self) -> EventRange {
            match self.events.keys().next() {
                Some(&first) => EventRange::new(first, self.next),
                None => EventRange::empty_at(self.next),
            }
        }

        fn append(&mut self, kind: LogKind, events: &[LogEvent]) -> Result<(), LogError> {
            let plan = plan_append(kind, self.range(), events, |index| {
                Ok(self.events.get(&index).map(|e| e.command_id.clone()))
            })?;
            for position in plan.inserts {
                let event = &events[position];
                self.events.insert(event.log_index, event.clone());
            }
            self.next = self.next.max(plan.next);
            Ok(())
        }
    }

    #[derive(Default)]
    struct PartitionData {
        truths: Sequence,
        commands: Sequence,
        medias: HashMap<String, MediaEntry>,
    }

    impl PartitionData {
        fn sequence(&self, kind: LogKind) -> &Sequence {
            match kind {
                LogKind::Truths => &self.truths,
                LogKind::Commands => &self.commands,
            }
        }

        fn sequence_mut(&mut self, kind: LogKind) -> &mut Sequence {
            match kind {
                LogKind::Truths => &mut self.truths,
                LogKind::Commands => &mut self.commands,
            }
        }

        fn apply_media(&mut self, change: &MediaChange) {
            if !change.applies_over(self.medias.get(change.media_id())) {
                return;
            }
            match change {
                MediaChange::Upsert(entry) => {
                    self.medias.insert(entry.media_id.clone(), entry.clone());
                }
                MediaChange::Remove { media_id, .. } => {
                    self.medias.remove(media_id);
                }
            }
        }
    }

    /// In-memory partition store.
    #[derive(Default)]
    pub struct MemoryPartitionStore {
        partitions: RwLock<HashMap<PartitionId, PartitionData>>,
    }

    impl MemoryPartitionStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl LogStore for MemoryPartitionStore {
        fn range(&self, partition: &PartitionId, kind: LogKind) -> Result<EventRange, StorageError> {
            let partitions = self.partitions.read();
            Ok(partitions
                .get(partition)
                .map(|p| p.sequence(kind).range())
                .unwrap_or_default())
        }

        fn append(
            &self,
            partition: &PartitionId,
            kind: LogKind,
            events: &[LogEvent],
        ) -> Result<(), LogError> {
            let mut partitions = self.partitions.write();
            partitions
                .entry(partition.clone())
                .or_default()
                .sequence_mut(kind)
                .append(kind, events)
        }

        fn read_range(
            &self,
            partition: &PartitionId,
            kind: LogKind,
            first: LogIndex,
            last: LogIndex,
        ) -> Result<Vec<LogEvent>, StorageError> {
            if first > last {
                return Ok(Vec::new());
            }
            let partitions = self.partitions.read();
            Ok(partitions
                .get(partition)
                .map(|p| {
                    p.sequence(kind)
                        .events
                        .range(first..=last)
                        .map(|(_, e)| e.clone())
                        .collect()
                })
                .unwrap_or_default())
        }

        fn delete_range(
            &self,
            partition: &PartitionId,
            kind: LogKind,
            first: LogIndex,
            last: LogIndex,
            expected: Option<&[CommandId]>,
        ) -> Result<Vec<LogEvent>, LogError> {
            if first > last {
                return Ok(Vec::new());
            }
            let mut partitions = self.partitions.write();
            let Some(data) = partitions.get_mut(partition) else {
                return Ok(Vec::new());
            };
            let sequence = data.sequence_mut(kind);
            let found: Vec<LogEvent> = sequence
                .events
                .range(first..=last)
                .map(|(_, e)| e.clone())
                .collect();
            if let Some(expected) = expected {
                check_expected_ids(kind, first, &found, expected)?;
            }
            for event in &found {
                sequence.events.remove(&event.log_index);
            }
            Ok(found)
        }
    }

    impl MediaStore for MemoryPartitionStore {
        fn get_media(
            &self,
            partition: &PartitionId,
            media_id: &str,
        ) -> Result<Option<MediaEntry>, StorageError> {
            let partitions = self.partitions.read();
            Ok(partitions
                .get(partition)
                .and_then(|p| p.medias.get(media_id).cloned()))
        }

        fn get_all_media(&self, partition: &PartitionId) -> Result<Vec<MediaEntry>, StorageError> {
            let partitions = self.partitions.read();
            Ok(partitions
                .get(partition)
                .map(|p| p.medias.values().cloned().collect())
                .unwrap_or_default())
        }

        fn upsert_media(
            &self,
            partition: &PartitionId,
            entry: MediaEntry,
        ) -> Result<bool, StorageError> {
            let mut partitions = self.partitions.write();
            let data = partitions.entry(partition.clone()).or_default();

            // Only update if newer
            if let Some(existing) = data.medias.get(&entry.media_id) {
                if !existing.should_replace_with(entry.log_index) {
                    return Ok(false);
                }
            }

            data.medias.insert(entry.media_id.clone(), entry);
            Ok(true)
        }

        fn remove_media(&self, partition: &PartitionId, media_id: &str) -> Result<bool, StorageError> {
            let mut partitions = self.partitions.write();
            Ok(partitions
                .get_mut(partition)
                .map(|p| p.medias.remove(media_id).is_some())
                .unwrap_or(false))
        }
    }

    impl PartitionStore for MemoryPartitionStore {
        fn commit(
            &self,
            partition: &PartitionId,
            kind: LogKind,
            event: &LogEvent,
            media: &[MediaChange],
        ) -> Result<(), LogError> {
            let mut partitions = self.partitions.write();
            let data = partitions.entry(partition.clone()).or_default();
            data.sequence_mut(kind)
                .append(kind, std::slice::from_ref(event))?;
            for change in media {
                data.apply_media(change);
            }
            Ok(())
        }
    }

    /// In-memory blob backend. Counts buffer writes so tests can observe
    /// write-once behaviour.
    #[derive(Default)]
    pub struct MemoryBlobBackend {
        metas: RwLock<HashMap<ContentHash, BlobMeta>>,
        buffers: RwLock<HashMap<ContentHash, Vec<u8>>>,
        writes: AtomicUsize,
    }

    impl MemoryBlobBackend {
        pub fn new() -> Self {
            Self::default()
        }

        /// Number of `put` calls that reached the backend.
        pub fn durable_writes(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }
    }

    impl BlobBackend for MemoryBlobBackend {
        fn get_meta(&self, content_hash: &ContentHash) -> Result<Option<BlobMeta>, StorageError> {
            Ok(self.metas.read().get(content_hash).cloned())
        }

        fn all_meta(&self) -> Result<Vec<BlobMeta>, StorageError> {
            Ok(self.metas.read().values().cloned().collect())
        }

        fn put(&self, meta: &BlobMeta, buffer: &[u8]) -> Result<(), StorageError> {
            let mut metas = self.metas.write();
            let mut buffers = self.buffers.write();
            metas.insert(meta.content_hash.clone(), meta.clone());
            buffers.insert(meta.content_hash.clone(), buffer.to_vec());
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn read_buffer(&self, content_hash: &ContentHash) -> Result<Option<Vec<u8>>, StorageError> {
            Ok(self.buffers.read().get(content_hash).cloned())
        }

        fn adjust_persist_refs(
            &self,
            deltas: &[(ContentHash, i64)],
        ) -> Result<Vec<BlobMeta>, StorageError> {
            let mut metas = self.metas.write();
            let mut updated = Vec::new();
            for (hash, delta) in deltas {
                if let Some(meta) = metas.get_mut(hash) {
                    meta.adjust(*delta);
                    updated.push(meta.clone());
                }
            }
            Ok(updated)
        }

        fn delete(&self, hashes: &[ContentHash]) -> Result<(), StorageError> {
            let mut metas = self.metas.write();
            let mut buffers = self.buffers.write();
            for hash in hashes {
                metas.remove(hash);
                buffers.remove(hash);
            }
            Ok(())
        }
    }

}
