use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::blob::ContentHash;
use crate::event::LogIndex;

/// Type name of resources whose payload is a blob.
pub const MEDIA_TYPE_NAME: &str = "Media";

/// Descriptive metadata of a media resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<ContentHash>,
}

impl MediaInfo {
    pub fn new(name: Option<String>, mime_type: Option<String>, content_hash: Option<ContentHash>) -> Self {
        Self {
            name,
            mime_type,
            content_hash,
        }
    }

    /// Apply the media fields found in a resource field map.
    ///
    /// Recognised keys are `name`, `mimeType` and `content`; a `null` value
    /// clears the field.
    pub fn apply_fields(&mut self, fields: &Map<String, Value>) {
        if let Some(value) = fields.get("name") {
            self.name = value.as_str().map(str::to_string);
        }
        if let Some(value) = fields.get("mimeType") {
            self.mime_type = value.as_str().map(str::to_string);
        }
        if let Some(value) = fields.get("content") {
            self.content_hash = value.as_str().map(ContentHash::new);
        }
    }

    /// Fill fields missing here from `fallback`.
    pub fn inherit_from(&mut self, fallback: &MediaInfo) {
        if self.name.is_none() {
            self.name.clone_from(&fallback.name);
        }
        if self.mime_type.is_none() {
            self.mime_type.clone_from(&fallback.mime_type);
        }
        if self.content_hash.is_none() {
            self.content_hash.clone_from(&fallback.content_hash);
        }
    }
}

/// The most recently seen version of a media resource within a partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaEntry {
    pub media_id: String,
    pub media_info: MediaInfo,
    pub is_persisted: bool,
    pub is_in_memory: bool,
    /// Index of the event that produced this version.
    pub log_index: LogIndex,
    /// Prototype chain, nearest first, resolved when the entry was created.
    #[serde(default)]
    pub fallback_ids: Vec<String>,
}

impl MediaEntry {
    pub fn new(media_id: impl Into<String>, log_index: LogIndex) -> Self {
        Self {
            media_id: media_id.into(),
            media_info: MediaInfo::default(),
            is_persisted: false,
            is_in_memory: false,
            log_index,
            fallback_ids: Vec::new(),
        }
    }

    /// Entries are versioned by log order: only a strictly later index wins.
    pub fn should_replace_with(&self, log_index: LogIndex) -> bool {
        log_index > self.log_index
    }

    /// Hash held with a durable attachment, if any.
    pub fn persisted_hash(&self) -> Option<&ContentHash> {
        self.media_info.content_hash.as_ref().filter(|_| self.is_persisted)
    }

    /// Hash held with an in-memory attachment, if any.
    pub fn in_memory_hash(&self) -> Option<&ContentHash> {
        self.media_info.content_hash.as_ref().filter(|_| self.is_in_memory)
    }
}

/// A change to a partition's media table produced by one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MediaChange {
    Upsert(MediaEntry),
    Remove { media_id: String, log_index: LogIndex },
}

impl MediaChange {
    pub fn media_id(&self) -> &str {
        match self {
            MediaChange::Upsert(entry) => &entry.media_id,
            MediaChange::Remove { media_id, .. } => media_id,
        }
    }

    pub fn log_index(&self) -> LogIndex {
        match self {
            MediaChange::Upsert(entry) => entry.log_index,
            MediaChange::Remove { log_index, .. } => *log_index,
        }
    }

    /// Whether this change supersedes `existing` under log-order versioning.
    pub fn applies_over(&self, existing: Option<&MediaEntry>) -> bool {
        existing.map_or(true, |e| e.should_replace_with(self.log_index()))
    }
}
