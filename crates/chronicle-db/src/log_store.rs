use std::sync::Arc;

use redb::{Database, ReadableTable, WriteTransaction};

use chronicle_core::{
    check_expected_ids, plan_append, CommandId, EventRange, LogError, LogEvent, LogIndex, LogKind,
    LogStore, MediaChange, PartitionId, PartitionStore, StorageError,
};

use crate::media_store::apply_media_change;
use crate::tables::{
    decode_event_index, encode_event_key, encode_sequence_key, log_table, partition_end,
    partition_prefix, COMMANDS_TABLE, MEDIAS_TABLE, SEQUENCES_TABLE, TRUTHS_TABLE,
};

/// redb implementation of the partition log and media tables.
pub struct RedbPartitionStore {
    pub(crate) db: Arc<Database>,
}

impl RedbPartitionStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Initialize the database tables.
    pub fn init_tables(db: &Database) -> Result<(), StorageError> {
        let write_txn = db
            .begin_write()
            .map_err(|e| StorageError::Database(e.to_string()))?;
        {
            // Create tables if they don't exist
            let _ = write_txn
                .open_table(TRUTHS_TABLE)
                .map_err(|e| StorageError::Database(e.to_string()))?;
            let _ = write_txn
                .open_table(COMMANDS_TABLE)
                .map_err(|e| StorageError::Database(e.to_string()))?;
            let _ = write_txn
                .open_table(MEDIAS_TABLE)
                .map_err(|e| StorageError::Database(e.to_string()))?;
            let _ = write_txn
                .open_table(SEQUENCES_TABLE)
                .map_err(|e| StorageError::Database(e.to_string()))?;
        }
        write_txn
            .commit()
            .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(())
    }
}

/// First index stored for a partition, if any.
fn first_stored<T>(table: &T, partition: &str) -> Result<Option<LogIndex>, StorageError>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    let start = partition_prefix(partition);
    let end = partition_end(partition);
    let mut range = table
        .range(start.as_slice()..end.as_slice())
        .map_err(|e| StorageError::Database(e.to_string()))?;

    match range.next() {
        Some(entry) => {
            let (key, _) = entry.map_err(|e| StorageError::Database(e.to_string()))?;
            Ok(Some(decode_event_index(key.value())))
        }
        None => Ok(None),
    }
}

fn sequence_range<T, S>(
    table: &T,
    sequences: &S,
    partition: &str,
    kind: LogKind,
) -> Result<EventRange, StorageError>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
    S: ReadableTable<&'static [u8], u64>,
{
    let key = encode_sequence_key(partition, kind);
    let next = sequences
        .get(key.as_slice())
        .map_err(|e| StorageError::Database(e.to_string()))?
        .map(|v| v.value())
        .unwrap_or(0);

    Ok(match first_stored(table, partition)? {
        Some(first) => EventRange::new(first, next),
        None => EventRange::empty_at(next),
    })
}

fn stored_event<T>(table: &T, partition: &str, index: LogIndex) -> Result<Option<LogEvent>, StorageError>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    let key = encode_event_key(partition, index);
    match table
        .get(key.as_slice())
        .map_err(|e| StorageError::Database(e.to_string()))?
    {
        Some(value) => {
            let event: LogEvent = serde_json::from_slice(value.value())
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            Ok(Some(event))
        }
        None => Ok(None),
    }
}

/// Validate and write `events` inside an open write transaction.
pub(crate) fn append_in_txn(
    write_txn: &WriteTransaction,
    partition: &PartitionId,
    kind: LogKind,
    events: &[LogEvent],
) -> Result<(), LogError> {
    let p = partition.as_str();
    let mut table = write_txn
        .open_table(log_table(kind))
        .map_err(|e| StorageError::Database(e.to_string()))?;
    let mut sequences = write_txn
        .open_table(SEQUENCES_TABLE)
        .map_err(|e| StorageError::Database(e.to_string()))?;

    let range = sequence_range(&table, &sequences, p, kind)?;
    let plan = plan_append(kind, range, events, |index| {
        Ok(stored_event(&table, p, index)?.map(|e| e.command_id))
    })?;

    for position in plan.inserts {
        let event = &events[position];
        let key = encode_event_key(p, event.log_index);
        let value =
            serde_json::to_vec(event).map_err(|e| StorageError::Serialization(e.to_string()))?;
        table
            .insert(key.as_slice(), value.as_slice())
            .map_err(|e| StorageError::Database(e.to_string()))?;
    }

    if plan.next > range.next {
        let key = encode_sequence_key(p, kind);
        sequences
            .insert(key.as_slice(), plan.next)
            .map_err(|e| StorageError::Database(e.to_string()))?;
    }

    Ok(())
}

impl LogStore for RedbPartitionStore {
    fn range(&self, partition: &PartitionId, kind: LogKind) -> Result<EventRange, StorageError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let table = read_txn
            .open_table(log_table(kind))
            .map_err(|e| StorageError::Database(e.to_string()))?;
        let sequences = read_txn
            .open_table(SEQUENCES_TABLE)
            .map_err(|e| StorageError::Database(e.to_string()))?;

        sequence_range(&table, &sequences, partition.as_str(), kind)
    }

    fn append(
        &self,
        partition: &PartitionId,
        kind: LogKind,
        events: &[LogEvent],
    ) -> Result<(), LogError> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        append_in_txn(&write_txn, partition, kind, events)?;

        write_txn
            .commit()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(())
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

        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let table = read_txn
            .open_table(log_table(kind))
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let start_key = encode_event_key(partition.as_str(), first);
        let end_key = encode_event_key(partition.as_str(), last);

        let mut events = Vec::new();
        let range = table
            .range(start_key.as_slice()..=end_key.as_slice())
            .map_err(|e| StorageError::Database(e.to_string()))?;

        for entry in range {
            let (_, value) = entry.map_err(|e| StorageError::Database(e.to_string()))?;
            let event: LogEvent = serde_json::from_slice(value.value())
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            events.push(event);
        }

        Ok(events)
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

        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let found = {
            let mut table = write_txn
                .open_table(log_table(kind))
                .map_err(|e| StorageError::Database(e.to_string()))?;

            let start_key = encode_event_key(partition.as_str(), first);
            let end_key = encode_event_key(partition.as_str(), last);

            let mut found = Vec::new();
            for entry in table
                .range(start_key.as_slice()..=end_key.as_slice())
                .map_err(|e| StorageError::Database(e.to_string()))?
            {
                let (_, value) = entry.map_err(|e| StorageError::Database(e.to_string()))?;
                let event: LogEvent = serde_json::from_slice(value.value())
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                found.push(event);
            }

            // Dropping the transaction without commit leaves everything in place
            if let Some(expected) = expected {
                check_expected_ids(kind, first, &found, expected)?;
            }

            for event in &found {
                let key = encode_event_key(partition.as_str(), event.log_index);
                table
                    .remove(key.as_slice())
                    .map_err(|e| StorageError::Database(e.to_string()))?;
            }
            found
        };

        write_txn
            .commit()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(found)
    }
}

impl PartitionStore for RedbPartitionStore {
    fn commit(
        &self,
        partition: &PartitionId,
        kind: LogKind,
        event: &LogEvent,
        media: &[MediaChange],
    ) -> Result<(), LogError> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        append_in_txn(&write_txn, partition, kind, std::slice::from_ref(event))?;
        {
            let mut medias = write_txn
                .open_table(MEDIAS_TABLE)
                .map_err(|e| StorageError::Database(e.to_string()))?;
            for change in media {
                apply_media_change(&mut medias, partition.as_str(), change)?;
            }
        }

        write_txn
            .commit()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(())
    }
}
