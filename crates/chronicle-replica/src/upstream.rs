//! Boundary traits for the upstream authority and the downstream consumer.
//!
//! The wire protocol behind an upstream connection is not modelled here;
//! implementations adapt whatever transport they use to these calls.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use chronicle_core::{ContentHash, LogEvent, LogIndex, MediaInfo, PartitionId};

use crate::error::{ReplicaError, UpstreamError};

/// Events the upstream pushes without being asked.
pub type PushSender = mpsc::UnboundedSender<Vec<LogEvent>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpstreamNarrateOptions {
    pub first_event_id: LogIndex,
}

/// A request for media content addressed to the upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaRequest {
    pub media_info: MediaInfo,
    /// Ask for a URL instead of the buffer.
    pub as_url: bool,
}

/// Content returned by the upstream for a media request.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamContent {
    Buffer(Bytes),
    Url(String),
}

#[async_trait]
pub trait Upstream: Send + Sync {
    /// Open a connection for one partition. Events the upstream pushes later
    /// are delivered through `push`.
    async fn acquire_connection(
        &self,
        partition: &PartitionId,
        push: PushSender,
    ) -> Result<Arc<dyn UpstreamConnection>, UpstreamError>;
}

#[async_trait]
pub trait UpstreamConnection: Send + Sync {
    /// Truths from `options.first_event_id` onwards.
    async fn narrate_event_log(
        &self,
        options: UpstreamNarrateOptions,
    ) -> Result<Vec<LogEvent>, UpstreamError>;

    /// Submit commands; returns the truths they became.
    async fn chronicle_events(&self, events: Vec<LogEvent>) -> Result<Vec<LogEvent>, UpstreamError>;

    /// Make a blob available upstream.
    async fn prepare_bvob(
        &self,
        buffer: Bytes,
        media_info: &MediaInfo,
    ) -> Result<ContentHash, UpstreamError>;

    async fn request_media_contents(
        &self,
        requests: &[MediaRequest],
    ) -> Result<Vec<UpstreamContent>, UpstreamError>;
}

/// Downstream consumer of narrated and received events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn receive_truths(
        &self,
        partition: &PartitionId,
        events: &[LogEvent],
    ) -> Result<(), ReplicaError>;

    async fn receive_commands(
        &self,
        partition: &PartitionId,
        events: &[LogEvent],
    ) -> Result<(), ReplicaError>;
}

/// A sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn receive_truths(&self, _: &PartitionId, _: &[LogEvent]) -> Result<(), ReplicaError> {
        Ok(())
    }

    async fn receive_commands(&self, _: &PartitionId, _: &[LogEvent]) -> Result<(), ReplicaError> {
        Ok(())
    }
}
