use redb::{ReadableTable, Table};

use chronicle_core::{MediaChange, MediaEntry, MediaStore, PartitionId, StorageError};

use crate::log_store::RedbPartitionStore;
use crate::tables::{encode_media_key, partition_end, partition_prefix, MEDIAS_TABLE};

fn stored_media<T>(table: &T, key: &[u8]) -> Result<Option<MediaEntry>, StorageError>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    match table
        .get(key)
        .map_err(|e| StorageError::Database(e.to_string()))?
    {
        Some(value) => {
            let entry: MediaEntry = serde_json::from_slice(value.value())
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            Ok(Some(entry))
        }
        None => Ok(None),
    }
}

/// Apply one media change under log-order versioning.
/// Returns whether the table changed.
pub(crate) fn apply_media_change(
    table: &mut Table<'_, &'static [u8], &'static [u8]>,
    partition: &str,
    change: &MediaChange,
) -> Result<bool, StorageError> {
    let key = encode_media_key(partition, change.media_id());

    let existing = stored_media(table, key.as_slice())?;
    if !change.applies_over(existing.as_ref()) {
        return Ok(false);
    }

    match change {
        MediaChange::Upsert(entry) => {
            let value = serde_json::to_vec(entry)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            table
                .insert(key.as_slice(), value.as_slice())
                .map_err(|e| StorageError::Database(e.to_string()))?;
            Ok(true)
        }
        MediaChange::Remove { .. } => {
            let result = table
                .remove(key.as_slice())
                .map_err(|e| StorageError::Database(e.to_string()))?;
            Ok(result.is_some())
        }
    }
}

impl MediaStore for RedbPartitionStore {
    fn get_media(
        &self,
        partition: &PartitionId,
        media_id: &str,
    ) -> Result<Option<MediaEntry>, StorageError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let table = read_txn
            .open_table(MEDIAS_TABLE)
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let key = encode_media_key(partition.as_str(), media_id);
        stored_media(&table, key.as_slice())
    }

    fn get_all_media(&self, partition: &PartitionId) -> Result<Vec<MediaEntry>, StorageError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let table = read_txn
            .open_table(MEDIAS_TABLE)
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let start = partition_prefix(partition.as_str());
        let end = partition_end(partition.as_str());

        let mut entries = Vec::new();
        for entry in table
            .range(start.as_slice()..end.as_slice())
            .map_err(|e| StorageError::Database(e.to_string()))?
        {
            let (_, value) = entry.map_err(|e| StorageError::Database(e.to_string()))?;
            let media: MediaEntry = serde_json::from_slice(value.value())
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            entries.push(media);
        }

        Ok(entries)
    }

    fn upsert_media(
        &self,
        partition: &PartitionId,
        entry: MediaEntry,
    ) -> Result<bool, StorageError> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let written;
        {
            let mut table = write_txn
                .open_table(MEDIAS_TABLE)
                .map_err(|e| StorageError::Database(e.to_string()))?;
            written = apply_media_change(&mut table, partition.as_str(), &MediaChange::Upsert(entry))?;
        }

        write_txn
            .commit()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(written)
    }

    fn remove_media(&self, partition: &PartitionId, media_id: &str) -> Result<bool, StorageError> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let removed;
        {
            let mut table = write_txn
                .open_table(MEDIAS_TABLE)
                .map_err(|e| StorageError::Database(e.to_string()))?;

            let key = encode_media_key(partition.as_str(), media_id);
            let result = table
                .remove(key.as_slice())
                .map_err(|e| StorageError::Database(e.to_string()))?;
            removed = result.is_some();
        }

        write_txn
            .commit()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(removed)
    }
}
