use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Position of an event within one sequence of a partition.
pub type LogIndex = u64;

/// Identifier of a chronicle partition (a URI).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(String);

impl PartitionId {
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Idempotency token of a logical command, stable across resends.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(String);

impl CommandId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random command id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The two disjoint sequences every partition keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    /// Events confirmed by the upstream authority.
    Truths,
    /// Locally authored events awaiting confirmation.
    Commands,
}

impl LogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogKind::Truths => "truths",
            LogKind::Commands => "commands",
        }
    }
}

impl std::fmt::Display for LogKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resource mutation carried by an event.
///
/// The variant is decided once when the event is ingested; consumers match on
/// it instead of probing the shape of the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    /// A new resource, optionally instantiated from a prototype.
    Created {
        id: String,
        type_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prototype: Option<String>,
        #[serde(default)]
        initial_state: Map<String, Value>,
    },
    /// Field updates on an existing resource.
    FieldsChanged {
        id: String,
        type_name: String,
        #[serde(default)]
        sets: Map<String, Value>,
    },
    /// Explicit destruction of a resource.
    Destroyed { id: String, type_name: String },
    /// A group of actions applied together.
    Transacted { actions: Vec<Action> },
}

impl Action {
    pub fn created(id: impl Into<String>, type_name: impl Into<String>, state: Value) -> Self {
        Action::Created {
            id: id.into(),
            type_name: type_name.into(),
            prototype: None,
            initial_state: into_map(state),
        }
    }

    pub fn fields_changed(id: impl Into<String>, type_name: impl Into<String>, sets: Value) -> Self {
        Action::FieldsChanged {
            id: id.into(),
            type_name: type_name.into(),
            sets: into_map(sets),
        }
    }

    pub fn destroyed(id: impl Into<String>, type_name: impl Into<String>) -> Self {
        Action::Destroyed {
            id: id.into(),
            type_name: type_name.into(),
        }
    }

    /// The type name of the resource this action targets, if it targets one.
    pub fn type_name(&self) -> Option<&str> {
        match self {
            Action::Created { type_name, .. }
            | Action::FieldsChanged { type_name, .. }
            | Action::Destroyed { type_name, .. } => Some(type_name),
            Action::Transacted { .. } => None,
        }
    }

    /// Collect the non-transaction actions in application order.
    pub fn leaves<'a>(&'a self, out: &mut Vec<&'a Action>) {
        match self {
            Action::Transacted { actions } => {
                for action in actions {
                    action.leaves(out);
                }
            }
            leaf => out.push(leaf),
        }
    }
}

fn into_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// An immutable event stored in one of a partition's sequences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub log_index: LogIndex,
    pub command_id: CommandId,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub payload: Value,
}

impl LogEvent {
    pub fn new(log_index: LogIndex, command_id: CommandId, actions: Vec<Action>) -> Self {
        Self {
            log_index,
            command_id,
            actions,
            payload: Value::Null,
        }
    }

    /// An unindexed command; the replica assigns its index when chronicled.
    pub fn command(actions: Vec<Action>) -> Self {
        Self::new(0, CommandId::generate(), actions)
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// All leaf actions of this event, transactions flattened.
    pub fn leaf_actions(&self) -> Vec<&Action> {
        let mut out = Vec::new();
        for action in &self.actions {
            action.leaves(&mut out);
        }
        out
    }
}

/// Half-open range `[first, next)` of indices stored in one sequence.
///
/// An empty range still remembers `next`, the first unused index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EventRange {
    pub first: LogIndex,
    pub next: LogIndex,
}

impl EventRange {
    pub fn new(first: LogIndex, next: LogIndex) -> Self {
        Self { first, next }
    }

    /// An empty range whose next unused index is `next`.
    pub fn empty_at(next: LogIndex) -> Self {
        Self { first: next, next }
    }

    pub fn is_empty(&self) -> bool {
        self.first >= self.next
    }

    pub fn len(&self) -> u64 {
        self.next.saturating_sub(self.first)
    }

    pub fn contains(&self, log_index: LogIndex) -> bool {
        log_index >= self.first && log_index < self.next
    }

    pub fn last(&self) -> Option<LogIndex> {
        if self.is_empty() {
            None
        } else {
            Some(self.next - 1)
        }
    }

    /// Extend the range with a freshly written index.
    pub fn record(&mut self, log_index: LogIndex) {
        if self.is_empty() {
            self.first = log_index;
        }
        self.next = log_index + 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_leaf_actions_flatten_transactions() {
        let event = LogEvent::new(
            0,
            CommandId::new("c1"),
            vec![Action::Transacted {
                actions: vec![
                    Action::created("m1", "Media", json!({ "name": "a.png" })),
                    Action::Transacted {
                        actions: vec![Action::destroyed("e1", "Entity")],
                    },
                ],
            }],
        );

        let leaves = event.leaf_actions();
        assert_eq!(leaves.len(), 2);
        assert_eq!(leaves[0].type_name(), Some("Media"));
        assert_eq!(leaves[1].type_name(), Some("Entity"));
    }

    #[test]
    fn test_action_serde_tagging() {
        let action = Action::fields_changed("m1", "Media", json!({ "mimeType": "image/png" }));
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["type"], "FIELDS_CHANGED");

        let back: Action = serde_json::from_value(value).unwrap();
        assert_eq!(back, action);
    }

    #[test]
    fn test_event_range_record() {
        let mut range = EventRange::empty_at(4);
        assert!(range.is_empty());
        assert_eq!(range.last(), None);

        range.record(7);
        assert_eq!(range, EventRange::new(7, 8));
        range.record(8);
        assert_eq!(range.len(), 2);
        assert!(range.contains(7));
        assert!(!range.contains(9));
    }

    #[test]
    fn test_generated_command_ids_differ() {
        assert_ne!(CommandId::generate(), CommandId::generate());
    }
}
