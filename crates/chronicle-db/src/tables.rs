use redb::TableDefinition;

use chronicle_core::LogKind;

/// Table for confirmed events.
/// Key: (partition, log_index) as bytes
/// Value: serialized LogEvent as bytes
pub const TRUTHS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("truths");

/// Table for locally authored, unconfirmed events.
/// Key: (partition, log_index) as bytes
/// Value: serialized LogEvent as bytes
pub const COMMANDS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("commands");

/// Table for media entries.
/// Key: (partition, media_id) as bytes
/// Value: serialized MediaEntry as bytes
pub const MEDIAS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("medias");

/// Table for the next unused index of each sequence.
/// Key: (partition, kind) as bytes
/// Value: next unused log index
pub const SEQUENCES_TABLE: TableDefinition<&[u8], u64> = TableDefinition::new("sequences");

/// Table for blob metadata.
/// Key: content hash
/// Value: serialized BlobMeta as bytes
pub const BVOBS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("bvobs");

/// Table for blob content.
/// Key: content hash
/// Value: raw buffer
pub const BUFFERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("buffers");

const SEPARATOR: u8 = 0;

/// The log table holding a sequence.
pub fn log_table(kind: LogKind) -> TableDefinition<'static, &'static [u8], &'static [u8]> {
    match kind {
        LogKind::Truths => TRUTHS_TABLE,
        LogKind::Commands => COMMANDS_TABLE,
    }
}

/// Prefix shared by every key of a partition.
pub fn partition_prefix(partition: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(partition.len() + 1);
    key.extend_from_slice(partition.as_bytes());
    key.push(SEPARATOR);
    key
}

/// Exclusive upper bound for keys of a partition.
pub fn partition_end(partition: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(partition.len() + 1);
    key.extend_from_slice(partition.as_bytes());
    key.push(SEPARATOR + 1);
    key
}

/// Encode an event key (partition, log_index) to bytes.
/// Indices are big-endian so keys sort by index within a partition.
pub fn encode_event_key(partition: &str, log_index: u64) -> Vec<u8> {
    let mut key = partition_prefix(partition);
    key.extend_from_slice(&log_index.to_be_bytes());
    key
}

/// Decode the log index from an event key.
pub fn decode_event_index(bytes: &[u8]) -> u64 {
    let mut index = [0u8; 8];
    index.copy_from_slice(&bytes[bytes.len() - 8..]);
    u64::from_be_bytes(index)
}

/// Encode a media key (partition, media_id) to bytes.
pub fn encode_media_key(partition: &str, media_id: &str) -> Vec<u8> {
    let mut key = partition_prefix(partition);
    key.extend_from_slice(media_id.as_bytes());
    key
}

/// Encode a sequence counter key (partition, kind) to bytes.
pub fn encode_sequence_key(partition: &str, kind: LogKind) -> Vec<u8> {
    let mut key = partition_prefix(partition);
    key.extend_from_slice(kind.as_str().as_bytes());
    key
}
