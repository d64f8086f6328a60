use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use chronicle_core::{
    Action, ContentHash, LogEvent, MediaChange, MediaEntry, MediaInfo, PartitionId,
    MEDIA_TYPE_NAME,
};

/// Attachment flags stamped on every entry a replica produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaFlags {
    pub is_persisted: bool,
    pub is_in_memory: bool,
}

/// A change that took effect, with the entry it replaced.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedChange {
    pub previous: Option<MediaEntry>,
    pub current: Option<MediaEntry>,
}

impl AppliedChange {
    /// Persist and in-memory ref-count deltas implied by this change.
    pub fn ref_deltas(&self) -> RefDeltas {
        let mut deltas = RefDeltas::default();
        let previous = self.previous.as_ref();
        let current = self.current.as_ref();

        push_delta(
            &mut deltas.persist,
            previous.and_then(MediaEntry::persisted_hash),
            current.and_then(MediaEntry::persisted_hash),
        );
        push_delta(
            &mut deltas.in_memory,
            previous.and_then(MediaEntry::in_memory_hash),
            current.and_then(MediaEntry::in_memory_hash),
        );
        deltas
    }
}

fn push_delta(
    out: &mut Vec<(ContentHash, i64)>,
    lost: Option<&ContentHash>,
    gained: Option<&ContentHash>,
) {
    if lost == gained {
        return;
    }
    if let Some(hash) = lost {
        out.push((hash.clone(), -1));
    }
    if let Some(hash) = gained {
        out.push((hash.clone(), 1));
    }
}

/// Ref-count deltas grouped by count.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefDeltas {
    pub persist: Vec<(ContentHash, i64)>,
    pub in_memory: Vec<(ContentHash, i64)>,
}

impl RefDeltas {
    pub fn extend(&mut self, other: RefDeltas) {
        self.persist.extend(other.persist);
        self.in_memory.extend(other.in_memory);
    }
}

/// In-memory view of a partition's media entries.
#[derive(Debug, Default)]
pub struct MediaEntryTable {
    entries: HashMap<String, MediaEntry>,
}

impl MediaEntryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(entries: Vec<MediaEntry>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|entry| (entry.media_id.clone(), entry))
                .collect(),
        }
    }

    pub fn get(&self, media_id: &str) -> Option<&MediaEntry> {
        self.entries.get(media_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &MediaEntry> {
        self.entries.values()
    }

    /// Media info of an entry with missing fields filled along its
    /// prototype chain, nearest prototype first.
    pub fn resolve(&self, media_id: &str) -> Option<MediaInfo> {
        let entry = self.entries.get(media_id)?;
        let mut info = entry.media_info.clone();
        for fallback_id in &entry.fallback_ids {
            if let Some(fallback) = self.entries.get(fallback_id) {
                info.inherit_from(&fallback.media_info);
            }
        }
        Some(info)
    }

    /// Apply a committed change. Returns `None` when a later version is
    /// already present.
    pub fn apply(&mut self, change: &MediaChange) -> Option<AppliedChange> {
        if !change.applies_over(self.entries.get(change.media_id())) {
            return None;
        }
        let (previous, current) = match change {
            MediaChange::Upsert(entry) => {
                let previous = self.entries.insert(entry.media_id.clone(), entry.clone());
                (previous, Some(entry.clone()))
            }
            MediaChange::Remove { media_id, .. } => (self.entries.remove(media_id), None),
        };
        Some(AppliedChange { previous, current })
    }

    /// Extract the media changes of each event, one list per event.
    ///
    /// Events are planned in order against an overlay so later events see the
    /// entries earlier ones produce. Several changes to one media id within an
    /// event collapse into the last.
    pub fn plan_changes(&self, events: &[LogEvent], flags: MediaFlags) -> Vec<Vec<MediaChange>> {
        let mut overlay: HashMap<String, Option<MediaEntry>> = HashMap::new();
        let mut planned = Vec::with_capacity(events.len());

        for event in events {
            let mut changes: Vec<MediaChange> = Vec::new();

            for action in event.leaf_actions() {
                if action.type_name() != Some(MEDIA_TYPE_NAME) {
                    continue;
                }
                let lookup = |id: &str| -> Option<MediaEntry> {
                    match overlay.get(id) {
                        Some(staged) => staged.clone(),
                        None => self.entries.get(id).cloned(),
                    }
                };

                let change = match action {
                    Action::Created {
                        id,
                        prototype,
                        initial_state,
                        ..
                    } => {
                        let mut entry = MediaEntry::new(id.clone(), event.log_index);
                        if let Some(prototype) = prototype {
                            entry.fallback_ids.push(prototype.clone());
                            if let Some(proto) = lookup(prototype) {
                                entry.fallback_ids.extend(proto.fallback_ids);
                            }
                        }
                        entry.media_info.apply_fields(initial_state);
                        entry.is_persisted = flags.is_persisted;
                        entry.is_in_memory = flags.is_in_memory;
                        MediaChange::Upsert(entry)
                    }
                    Action::FieldsChanged { id, sets, .. } => {
                        let mut entry =
                            lookup(id).unwrap_or_else(|| MediaEntry::new(id.clone(), event.log_index));
                        entry.log_index = event.log_index;
                        entry.media_info.apply_fields(sets);
                        entry.is_persisted = flags.is_persisted;
                        entry.is_in_memory = flags.is_in_memory;
                        MediaChange::Upsert(entry)
                    }
                    Action::Destroyed { id, .. } => MediaChange::Remove {
                        media_id: id.clone(),
                        log_index: event.log_index,
                    },
                    Action::Transacted { .. } => continue,
                };

                let staged = match &change {
                    MediaChange::Upsert(entry) => Some(entry.clone()),
                    MediaChange::Remove { .. } => None,
                };
                overlay.insert(change.media_id().to_string(), staged);

                match changes.iter_mut().find(|c| c.media_id() == change.media_id()) {
                    Some(slot) => *slot = change,
                    None => changes.push(change),
                }
            }

            planned.push(changes);
        }

        planned
    }
}

/// Registry-wide map of media entries whose content is durably stored,
/// merged across every open partition.
#[derive(Clone, Default)]
pub struct PersistedMediaMap {
    entries: Arc<DashMap<String, (PartitionId, MediaEntry)>>,
}

impl PersistedMediaMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an entry. Entries without durable content are ignored.
    pub fn publish(&self, partition: &PartitionId, entry: &MediaEntry) {
        if entry.is_persisted {
            self.entries
                .insert(entry.media_id.clone(), (partition.clone(), entry.clone()));
        }
    }

    /// Remove an entry contributed by `partition`.
    pub fn retract(&self, partition: &PartitionId, media_id: &str) {
        self.entries
            .remove_if(media_id, |_, (owner, _)| owner == partition);
    }

    /// Remove every entry contributed by `partition`.
    pub fn retract_partition(&self, partition: &PartitionId) {
        self.entries.retain(|_, (owner, _)| owner != partition);
    }

    pub fn get(&self, media_id: &str) -> Option<MediaEntry> {
        self.entries.get(media_id).map(|e| e.value().1.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
