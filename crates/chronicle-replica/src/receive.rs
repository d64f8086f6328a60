//! The ordering gate: accepting truths and commands into the local log.

use std::sync::Arc;

use futures::future::try_join_all;
use tracing::{debug, warn};

use chronicle_core::{ContentHash, EventRange, LogEvent, LogIndex, LogKind, MediaChange};

use crate::error::ReplicaError;
use crate::media_sync::RetrieveMediaBuffer;
use crate::media_table::RefDeltas;
use crate::replica::{PartitionReplica, ReplicaStatus};
use crate::retry::RetryPolicy;

#[derive(Clone, Default)]
pub struct ReceiveOptions {
    /// Source for media content not yet stored locally. Falls back to the
    /// upstream, then to failing with `MediaUnavailable`.
    pub retrieve: Option<RetrieveMediaBuffer>,
    /// Retry policy for media retrieval. Defaults to the replica's.
    pub retry_policy: Option<Arc<dyn RetryPolicy>>,
}

impl PartitionReplica {
    /// Accept confirmed events.
    ///
    /// Each slot of the result holds the accepted event, or `None` for a
    /// redelivered duplicate. An index past the next expected one is an
    /// `OutOfOrder` error and nothing of the batch is written.
    pub async fn receive_truths(
        &self,
        events: Vec<LogEvent>,
        options: ReceiveOptions,
    ) -> Result<Vec<Option<LogEvent>>, ReplicaError> {
        let _gate = self.inner.truth_gate.lock().await;
        self.receive_locked(LogKind::Truths, events, options).await
    }

    /// Accept locally authored events into the command queue.
    pub async fn receive_commands(
        &self,
        events: Vec<LogEvent>,
        options: ReceiveOptions,
    ) -> Result<Vec<Option<LogEvent>>, ReplicaError> {
        let _gate = self.inner.command_gate.lock().await;
        self.receive_locked(LogKind::Commands, events, options).await
    }

    /// Receive with the sequence's gate already held.
    pub(crate) async fn receive_locked(
        &self,
        kind: LogKind,
        events: Vec<LogEvent>,
        options: ReceiveOptions,
    ) -> Result<Vec<Option<LogEvent>>, ReplicaError> {
        self.ensure_connected()?;
        let partition = &self.inner.partition;

        let mut results: Vec<Option<LogEvent>> = vec![None; events.len()];
        let mut positions = Vec::new();
        let mut accepted = Vec::new();
        let mut expected = self.ranges().expected_next(kind);

        for (position, event) in events.into_iter().enumerate() {
            if event.log_index < expected {
                debug!(
                    "Dropping duplicate {} event {} for {}",
                    kind, event.log_index, partition
                );
                continue;
            }
            if event.log_index > expected {
                return Err(ReplicaError::OutOfOrder {
                    partition: partition.clone(),
                    kind,
                    expected,
                    got: event.log_index,
                });
            }
            expected += 1;
            positions.push(position);
            accepted.push(event);
        }
        if accepted.is_empty() {
            return Ok(results);
        }

        let planned = {
            let state = self.inner.state.lock();
            state
                .media
                .plan_changes(&accepted, self.inner.config.media_flags())
        };

        if self.inner.config.locally_persisted {
            self.sync_media(&planned, &options).await?;
        } else {
            // Memory-only partitions forward first and fetch content behind
            self.forward(kind, &accepted).await;
            self.spawn_media_sync(&planned, &options);
        }

        let mut persist_deltas = Vec::new();
        let mut committed = 0;
        let mut failure = None;
        for (event, changes) in accepted.iter().zip(&planned) {
            match self.commit_event(kind, event, changes) {
                Ok(deltas) => persist_deltas.extend(deltas),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
            committed += 1;
        }

        // Earlier events of the batch stay committed even if a later one failed
        let committed_events = &accepted[..committed];
        if let Err(e) = self
            .inner
            .blobs
            .adjust_persist_ref_counts(&persist_deltas)
            .await
        {
            self.keep_first_failure(&mut failure, e.into());
        }
        if kind == LogKind::Truths {
            if let Some(last) = committed_events.last() {
                if let Err(e) = self.prune_confirmed_commands(last.log_index).await {
                    self.keep_first_failure(&mut failure, e);
                }
            }
            self.resolve_truth_watchers(committed_events);
        }
        if self.inner.config.locally_persisted {
            self.forward(kind, committed_events).await;
        }

        if let Some(e) = failure {
            return Err(e);
        }
        for (position, event) in positions.into_iter().zip(accepted) {
            results[position] = Some(event);
        }
        Ok(results)
    }

    fn keep_first_failure(&self, failure: &mut Option<ReplicaError>, error: ReplicaError) {
        match failure {
            Some(first) => warn!(
                "Receive on {} also failed with {} after {}",
                self.inner.partition, error, first
            ),
            None => *failure = Some(error),
        }
    }

    async fn sync_media(
        &self,
        planned: &[Vec<MediaChange>],
        options: &ReceiveOptions,
    ) -> Result<(), ReplicaError> {
        let syncs = planned.iter().flatten().filter_map(|change| match change {
            MediaChange::Upsert(entry) => Some(
                self.inner
                    .media_sync
                    .sync_media_content(entry, options.retrieve.clone(), options.retry_policy.clone()),
            ),
            MediaChange::Remove { .. } => None,
        });

        for synced in try_join_all(syncs).await? {
            if !synced.failures.is_empty() {
                warn!(
                    "Media content for {} synced after {} failed attempts",
                    self.inner.partition,
                    synced.failures.len()
                );
            }
        }
        Ok(())
    }

    fn spawn_media_sync(&self, planned: &[Vec<MediaChange>], options: &ReceiveOptions) {
        for change in planned.iter().flatten() {
            let MediaChange::Upsert(entry) = change else {
                continue;
            };
            if entry.media_info.content_hash.is_none() {
                continue;
            }
            let media_sync = self.inner.media_sync.clone();
            let entry = entry.clone();
            let options = options.clone();
            tokio::spawn(async move {
                if let Err(e) = media_sync
                    .sync_media_content(&entry, options.retrieve, options.retry_policy)
                    .await
                {
                    warn!("Background sync of media {} failed: {}", entry.media_id, e);
                }
            });
        }
    }

    /// Commit one event and fold it into the in-memory state.
    ///
    /// The state lock is held across the store write so a concurrent
    /// `disconnect` sees either none or all of the event's effects. Returns
    /// the persist ref-count deltas still to be applied.
    fn commit_event(
        &self,
        kind: LogKind,
        event: &LogEvent,
        changes: &[MediaChange],
    ) -> Result<Vec<(ContentHash, i64)>, ReplicaError> {
        let partition = &self.inner.partition;
        let mut state = self.inner.state.lock();
        if state.status == ReplicaStatus::Disconnected {
            return Err(ReplicaError::NotConnected(partition.clone()));
        }
        self.inner.store.commit(partition, kind, event, changes)?;
        state.ranges.get_mut(kind).record(event.log_index);

        let mut deltas = RefDeltas::default();
        for change in changes {
            let Some(applied) = state.media.apply(change) else {
                continue;
            };
            match &applied.current {
                Some(entry) => self.inner.persisted_media.publish(partition, entry),
                None => self.inner.persisted_media.retract(partition, change.media_id()),
            }
            deltas.extend(applied.ref_deltas());
        }
        self.inner.blobs.adjust_in_memory_ref_counts(&deltas.in_memory);
        Ok(deltas.persist)
    }

    async fn forward(&self, kind: LogKind, events: &[LogEvent]) {
        if events.is_empty() {
            return;
        }
        let partition = &self.inner.partition;
        let result = match kind {
            LogKind::Truths => self.inner.sink.receive_truths(partition, events).await,
            LogKind::Commands => self.inner.sink.receive_commands(partition, events).await,
        };
        if let Err(e) = result {
            warn!("Event sink rejected {} {} events for {}: {}", events.len(), kind, partition, e);
        }
    }

    /// Drop queued commands the truth log has caught up with.
    ///
    /// A pruned command whose slot was taken by a different truth is counted
    /// as displaced.
    async fn prune_confirmed_commands(&self, truth_index: LogIndex) -> Result<(), ReplicaError> {
        // Lock order is always truths then commands
        let _gate = self.inner.command_gate.lock().await;
        let partition = &self.inner.partition;
        let queued = self.ranges().commands;
        if queued.is_empty() || queued.first > truth_index {
            return Ok(());
        }
        let last = truth_index.min(queued.next - 1);

        let store = &self.inner.store;
        let commands = store.read_range(partition, LogKind::Commands, queued.first, last)?;
        let truths = store.read_range(partition, LogKind::Truths, queued.first, last)?;

        let mut displaced = 0;
        for command in &commands {
            let confirmed = truths
                .iter()
                .any(|t| t.log_index == command.log_index && t.command_id == command.command_id);
            if !confirmed {
                warn!(
                    "Command {} at {} in {} was displaced by another truth",
                    command.command_id, command.log_index, partition
                );
                displaced += 1;
            }
        }

        let expected: Vec<_> = commands.iter().map(|c| c.command_id.clone()).collect();
        store.delete_range(partition, LogKind::Commands, queued.first, last, Some(&expected))?;

        let mut state = self.inner.state.lock();
        state.displaced_commands += displaced;
        let next = state.ranges.commands.next;
        state.ranges.commands = if last + 1 >= next {
            EventRange::empty_at(next)
        } else {
            EventRange::new(last + 1, next)
        };
        Ok(())
    }

    fn resolve_truth_watchers(&self, truths: &[LogEvent]) {
        let mut state = self.inner.state.lock();
        for truth in truths {
            if let Some(watchers) = state.truth_watchers.remove(&truth.command_id) {
                for watcher in watchers {
                    let _ = watcher.send(Ok(truth.clone()));
                }
            }
        }
    }
}
