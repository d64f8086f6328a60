//! Authoring events: local command queueing and upstream confirmation.

use std::sync::Arc;

use futures::future::{self, BoxFuture, Shared};
use futures::FutureExt;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use chronicle_core::{LogEvent, LogKind};

use crate::error::{ReplicaError, UpstreamError};
use crate::media_sync::{throw_on_media_request, RetrieveMediaBuffer};
use crate::receive::ReceiveOptions;
use crate::replica::PartitionReplica;
use crate::retry::RetryPolicy;

type Outcome = Shared<BoxFuture<'static, Result<LogEvent, ReplicaError>>>;

#[derive(Clone, Default)]
pub struct ChronicleOptions {
    /// The events are already authoritative and go straight to the truth log.
    pub is_pre_authorized: bool,
    /// Media source. Pre-authorized events fail on media they would have to
    /// fetch unless one is given.
    pub retrieve: Option<RetrieveMediaBuffer>,
    pub retry_policy: Option<Arc<dyn RetryPolicy>>,
}

/// Progress of one chronicled event.
#[derive(Clone)]
pub struct EventResult {
    /// The event with its assigned log index.
    pub event: LogEvent,
    local: Outcome,
    truth: Outcome,
}

impl EventResult {
    /// Resolves once the event is stored locally.
    pub async fn local_event(&self) -> Result<LogEvent, ReplicaError> {
        self.local.clone().await
    }

    /// Resolves once the upstream confirmed the event as a truth.
    pub async fn truth_event(&self) -> Result<LogEvent, ReplicaError> {
        self.local_event().await?;
        self.truth.clone().await
    }
}

pub struct ChronicleResult {
    pub event_results: Vec<EventResult>,
}

impl std::fmt::Debug for ChronicleResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChronicleResult")
            .field("event_results", &self.event_results.len())
            .finish()
    }
}

fn ready(result: Result<LogEvent, ReplicaError>) -> Outcome {
    future::ready(result).boxed().shared()
}

fn settled(
    receiver: oneshot::Receiver<Result<LogEvent, ReplicaError>>,
    partition: chronicle_core::PartitionId,
) -> Outcome {
    async move {
        receiver
            .await
            .map_err(|_| ReplicaError::NotConnected(partition))?
    }
    .boxed()
    .shared()
}

impl PartitionReplica {
    /// Author events on this partition.
    ///
    /// Command indices are reserved before this returns; storing the commands
    /// and forwarding them upstream continue in the background.
    pub async fn chronicle_events(
        &self,
        events: Vec<LogEvent>,
        options: ChronicleOptions,
    ) -> Result<ChronicleResult, ReplicaError> {
        if options.is_pre_authorized {
            return self.chronicle_authorized(events, options).await;
        }

        let gate = self.inner.command_gate.clone().lock_owned().await;
        self.ensure_connected()?;
        let partition = self.inner.partition.clone();

        let mut next = self.ranges().expected_next(LogKind::Commands);
        let mut commands = Vec::with_capacity(events.len());
        let mut local_senders = Vec::with_capacity(events.len());
        let mut event_results = Vec::with_capacity(events.len());
        {
            let mut state = self.inner.state.lock();
            for mut command in events {
                command.log_index = next;
                next += 1;

                let (local_tx, local_rx) = oneshot::channel();
                let (truth_tx, truth_rx) = oneshot::channel();
                state
                    .truth_watchers
                    .entry(command.command_id.clone())
                    .or_default()
                    .push(truth_tx);

                event_results.push(EventResult {
                    event: command.clone(),
                    local: settled(local_rx, partition.clone()),
                    truth: settled(truth_rx, partition.clone()),
                });
                local_senders.push(local_tx);
                commands.push(command);
            }
        }

        let replica = self.clone();
        let receive = ReceiveOptions {
            retrieve: options.retrieve,
            retry_policy: options.retry_policy,
        };
        tokio::spawn(async move {
            let received = replica
                .receive_locked(LogKind::Commands, commands.clone(), receive)
                .await;
            drop(gate);

            if let Err(e) = received {
                warn!("Failed to queue {} commands for {}: {}", commands.len(), replica.partition_id(), e);
                for sender in local_senders {
                    let _ = sender.send(Err(e.clone()));
                }
                replica.fail_truth_watchers(&commands, &e);
                return;
            }
            for (sender, command) in local_senders.into_iter().zip(&commands) {
                let _ = sender.send(Ok(command.clone()));
            }
            replica.forward_upstream(commands).await;
        });

        Ok(ChronicleResult { event_results })
    }

    async fn chronicle_authorized(
        &self,
        events: Vec<LogEvent>,
        options: ChronicleOptions,
    ) -> Result<ChronicleResult, ReplicaError> {
        let receive = ReceiveOptions {
            retrieve: Some(options.retrieve.unwrap_or_else(throw_on_media_request)),
            retry_policy: options.retry_policy,
        };
        let received = self.receive_truths(events.clone(), receive).await?;

        let event_results = events
            .into_iter()
            .zip(received)
            .map(|(event, accepted)| {
                let outcome = ready(Ok(accepted.unwrap_or_else(|| event.clone())));
                EventResult {
                    event,
                    local: outcome.clone(),
                    truth: outcome,
                }
            })
            .collect();
        Ok(ChronicleResult { event_results })
    }

    /// Submit queued commands upstream and take in the resulting truths.
    ///
    /// Commands the upstream could not be reached for stay queued for the
    /// next narration; rejected ones fail their truth watchers.
    pub(crate) async fn forward_upstream(&self, commands: Vec<LogEvent>) {
        if commands.is_empty() {
            return;
        }
        let partition = self.partition_id();
        let Some(connection) = self.connection() else {
            debug!("{} commands of {} wait for an upstream", commands.len(), partition);
            return;
        };

        match connection.chronicle_events(commands.clone()).await {
            Ok(truths) => {
                if let Err(e) = self.receive_truths(truths, ReceiveOptions::default()).await {
                    warn!("Failed to receive confirmed truths for {}: {}", partition, e);
                }
            }
            Err(UpstreamError::Rejected(reason)) => {
                warn!("Upstream rejected {} commands of {}: {}", commands.len(), partition, reason);
                self.fail_truth_watchers(
                    &commands,
                    &ReplicaError::Upstream(UpstreamError::Rejected(reason)),
                );
            }
            Err(e) => {
                warn!("Commands of {} stay queued, upstream failed: {}", partition, e);
            }
        }
    }

    fn fail_truth_watchers(&self, commands: &[LogEvent], error: &ReplicaError) {
        let mut state = self.inner.state.lock();
        for command in commands {
            if let Some(watchers) = state.truth_watchers.remove(&command.command_id) {
                for watcher in watchers {
                    let _ = watcher.send(Err(error.clone()));
                }
            }
        }
    }
}
