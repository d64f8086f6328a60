use std::sync::Arc;

use tracing::{debug, error};

use chronicle_core::{EventRange, LogEvent, LogIndex, LogKind};

use crate::error::ReplicaError;
use crate::media_sync::RetrieveMediaBuffer;
use crate::receive::ReceiveOptions;
use crate::replica::PartitionReplica;
use crate::retry::RetryPolicy;
use crate::upstream::{UpstreamConnection, UpstreamNarrateOptions};

#[derive(Clone)]
pub struct NarrateOptions {
    /// First log index to replay.
    pub first_event_id: LogIndex,
    /// Also narrate from the upstream, when connected.
    pub remote: bool,
    /// Wait for the upstream narration even if local events were replayed.
    pub full_narrate: bool,
    pub retrieve: Option<RetrieveMediaBuffer>,
    /// Retry policy for media of narrated truths. Defaults to the replica's.
    pub retry_policy: Option<Arc<dyn RetryPolicy>>,
}

impl Default for NarrateOptions {
    fn default() -> Self {
        Self {
            first_event_id: 0,
            remote: true,
            full_narrate: false,
            retrieve: None,
            retry_policy: None,
        }
    }
}

/// What happened to the upstream phase of a narration.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteNarration {
    /// No upstream, or remote narration was not asked for.
    Skipped,
    /// Running in the background.
    Detached,
    /// Truths newly received from the upstream.
    Completed(Vec<LogEvent>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NarrationResult {
    /// Locally stored truths replayed to the sink.
    pub truths: Vec<LogEvent>,
    /// Locally queued commands replayed to the sink.
    pub commands: Vec<LogEvent>,
    pub remote: RemoteNarration,
}

impl PartitionReplica {
    /// Replay the local logs to the sink, then catch up with the upstream.
    ///
    /// The upstream phase is awaited when nothing was replayed locally or
    /// `full_narrate` is set, and detached otherwise.
    pub async fn narrate(&self, options: NarrateOptions) -> Result<NarrationResult, ReplicaError> {
        self.ensure_connected()?;
        let partition = &self.inner.partition;
        let ranges = self.ranges();

        let truths = self.read_local(LogKind::Truths, ranges.truths, options.first_event_id)?;
        let commands = self.read_local(LogKind::Commands, ranges.commands, options.first_event_id)?;
        if !truths.is_empty() {
            self.inner.sink.receive_truths(partition, &truths).await?;
        }
        if !commands.is_empty() {
            self.inner.sink.receive_commands(partition, &commands).await?;
        }
        debug!(
            "Narrated {} truths and {} commands of {} locally",
            truths.len(),
            commands.len(),
            partition
        );

        let connection = match self.connection() {
            Some(connection) if options.remote => connection,
            _ => {
                return Ok(NarrationResult {
                    truths,
                    commands,
                    remote: RemoteNarration::Skipped,
                })
            }
        };

        self.rechronicle_queued(ranges.commands)?;

        let replayed_nothing = truths.is_empty() && commands.is_empty();
        let receive = ReceiveOptions {
            retrieve: options.retrieve,
            retry_policy: options.retry_policy,
        };
        let remote = if replayed_nothing || options.full_narrate {
            let received = self
                .narrate_upstream(connection, options.first_event_id, receive)
                .await?;
            RemoteNarration::Completed(received)
        } else {
            let replica = self.clone();
            tokio::spawn(async move {
                if let Err(e) = replica
                    .narrate_upstream(connection, options.first_event_id, receive)
                    .await
                {
                    error!("Upstream narration of {} failed: {}", replica.partition_id(), e);
                }
            });
            RemoteNarration::Detached
        };

        Ok(NarrationResult {
            truths,
            commands,
            remote,
        })
    }

    fn read_local(
        &self,
        kind: LogKind,
        range: EventRange,
        first_event_id: LogIndex,
    ) -> Result<Vec<LogEvent>, ReplicaError> {
        let first = first_event_id.max(range.first);
        match range.last() {
            Some(last) if first <= last => {
                Ok(self.inner.store.read_range(&self.inner.partition, kind, first, last)?)
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Send still-queued commands to the upstream again.
    fn rechronicle_queued(&self, queued: EventRange) -> Result<(), ReplicaError> {
        let Some(last) = queued.last() else {
            return Ok(());
        };
        let commands =
            self.inner
                .store
                .read_range(&self.inner.partition, LogKind::Commands, queued.first, last)?;
        let replica = self.clone();
        tokio::spawn(async move {
            replica.forward_upstream(commands).await;
        });
        Ok(())
    }

    async fn narrate_upstream(
        &self,
        connection: Arc<dyn UpstreamConnection>,
        first_event_id: LogIndex,
        receive: ReceiveOptions,
    ) -> Result<Vec<LogEvent>, ReplicaError> {
        let from = {
            let _gate = self.inner.truth_gate.lock().await;
            let mut state = self.inner.state.lock();
            let truths = state.ranges.truths;
            if truths.is_empty() && first_event_id > truths.next {
                // Nothing below the requested start is kept, so begin there
                state.ranges.truths = EventRange::empty_at(first_event_id);
                first_event_id
            } else {
                // Asking past the stored head would leave a gap
                truths.next
            }
        };

        let events = connection
            .narrate_event_log(UpstreamNarrateOptions { first_event_id: from })
            .await?;
        let received = self.receive_truths(events, receive).await?;
        Ok(received.into_iter().flatten().collect())
    }
}
