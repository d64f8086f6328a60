//! Slot rules shared by every `LogStore` implementation.

use crate::error::{LogError, StorageError};
use crate::event::{CommandId, EventRange, LogEvent, LogIndex, LogKind};

/// Outcome of validating an append against the current state of a sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct AppendPlan {
    /// Positions (into the appended slice) of events that must be written.
    pub inserts: Vec<usize>,
    /// Next unused index once the plan is applied.
    pub next: LogIndex,
}

/// Validate `events` against a sequence currently spanning `range`.
///
/// `stored` looks up the command id already occupying an index. An occupied
/// slot holding the same command id is a no-op; a different id is a conflict.
/// A sequence holding no records may be re-based forward: its first write may
/// land at any index at or above `range.next`.
pub fn plan_append<F>(
    kind: LogKind,
    range: EventRange,
    events: &[LogEvent],
    mut stored: F,
) -> Result<AppendPlan, LogError>
where
    F: FnMut(LogIndex) -> Result<Option<CommandId>, StorageError>,
{
    let mut next = range.next;
    let mut empty = range.is_empty();
    let mut inserts = Vec::new();

    for (position, event) in events.iter().enumerate() {
        let index = event.log_index;
        if index < next {
            match stored(index)? {
                Some(existing) if existing == event.command_id => continue,
                Some(existing) => {
                    return Err(LogError::Conflict {
                        kind,
                        log_index: index,
                        stored: existing,
                        incoming: event.command_id.clone(),
                    })
                }
                // Below the retained range: the slot was pruned and can't be verified.
                None => {
                    return Err(LogError::NonContiguous {
                        kind,
                        expected: next,
                        got: index,
                    })
                }
            }
        }

        if index > next && !empty {
            return Err(LogError::NonContiguous {
                kind,
                expected: next,
                got: index,
            });
        }

        inserts.push(position);
        next = index + 1;
        empty = false;
    }

    Ok(AppendPlan { inserts, next })
}

/// Check positional command ids before a range delete.
pub fn check_expected_ids(
    kind: LogKind,
    first: LogIndex,
    found: &[LogEvent],
    expected: &[CommandId],
) -> Result<(), LogError> {
    if found.len() != expected.len() {
        return Err(LogError::ExpectedCountMismatch {
            kind,
            first,
            expected: expected.len(),
            found: found.len(),
        });
    }
    for (event, expected_id) in found.iter().zip(expected) {
        if &event.command_id != expected_id {
            return Err(LogError::Conflict {
                kind,
                log_index: event.log_index,
                stored: event.command_id.clone(),
                incoming: expected_id.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn event(index: LogIndex, command: &str) -> LogEvent {
        LogEvent::new(index, CommandId::new(command), Vec::new())
    }

    fn lookup<'a>(
        slots: &'a HashMap<LogIndex, &'a str>,
    ) -> impl FnMut(LogIndex) -> Result<Option<CommandId>, StorageError> + 'a {
        move |index| Ok(slots.get(&index).map(|c| CommandId::new(*c)))
    }

    #[test]
    fn test_plan_contiguous_append() {
        let slots = HashMap::new();
        let plan = plan_append(
            LogKind::Truths,
            EventRange::empty_at(0),
            &[event(0, "a"), event(1, "b")],
            lookup(&slots),
        )
        .unwrap();

        assert_eq!(plan.inserts, vec![0, 1]);
        assert_eq!(plan.next, 2);
    }

    #[test]
    fn test_plan_same_command_is_noop() {
        let slots = HashMap::from([(0, "a")]);
        let plan = plan_append(
            LogKind::Truths,
            EventRange::new(0, 1),
            &[event(0, "a"), event(1, "b")],
            lookup(&slots),
        )
        .unwrap();

        assert_eq!(plan.inserts, vec![1]);
    }

    #[test]
    fn test_plan_different_command_conflicts() {
        let slots = HashMap::from([(0, "a")]);
        let err = plan_append(
            LogKind::Truths,
            EventRange::new(0, 1),
            &[event(0, "X")],
            lookup(&slots),
        )
        .unwrap_err();

        assert!(matches!(err, LogError::Conflict { log_index: 0, .. }));
    }

    #[test]
    fn test_plan_gap_rejected() {
        let slots = HashMap::from([(0, "a")]);
        let err = plan_append(
            LogKind::Commands,
            EventRange::new(0, 1),
            &[event(2, "c")],
            lookup(&slots),
        )
        .unwrap_err();

        assert_eq!(
            err,
            LogError::NonContiguous {
                kind: LogKind::Commands,
                expected: 1,
                got: 2
            }
        );
    }

    #[test]
    fn test_plan_empty_sequence_rebases_forward() {
        let slots = HashMap::new();
        let plan = plan_append(
            LogKind::Commands,
            EventRange::empty_at(3),
            &[event(5, "a"), event(6, "b")],
            lookup(&slots),
        )
        .unwrap();

        assert_eq!(plan.next, 7);

        let err = plan_append(
            LogKind::Commands,
            EventRange::empty_at(3),
            &[event(5, "a"), event(7, "b")],
            lookup(&slots),
        )
        .unwrap_err();
        assert!(matches!(err, LogError::NonContiguous { expected: 6, .. }));
    }

    #[test]
    fn test_expected_ids_positional() {
        let found = vec![event(3, "a"), event(4, "b")];
        assert!(check_expected_ids(
            LogKind::Commands,
            3,
            &found,
            &[CommandId::new("a"), CommandId::new("b")]
        )
        .is_ok());

        let err = check_expected_ids(
            LogKind::Commands,
            3,
            &found,
            &[CommandId::new("b"), CommandId::new("a")],
        )
        .unwrap_err();
        assert!(matches!(err, LogError::Conflict { log_index: 3, .. }));

        let err = check_expected_ids(LogKind::Commands, 3, &found, &[CommandId::new("a")])
            .unwrap_err();
        assert!(matches!(err, LogError::ExpectedCountMismatch { .. }));
    }
}
