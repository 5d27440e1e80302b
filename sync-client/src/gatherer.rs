//! Event gathering: merging the backlog with the live stream.
//!
//! One gathering session:
//! 1. bootstrap the checkpoint if the client never processed an event
//! 2. open the live stream (status `Pending`)
//! 3. on `Open`, fetch the backlog since the checkpoint (status
//!    `FetchingPendingEvents`), remembering each event in the buffer
//! 4. once the backlog is drained, status `Live`
//!
//! Live events that duplicate a buffered backlog event are dropped. The
//! buffer belongs to the session and is discarded with it.

use async_trait::async_trait;
use convsync_core::{ConnectionPolicy, IncrementalSyncStatus, PendingEventsBuffer};
use convsync_types::{Event, EventEnvelope};
use futures_util::StreamExt;
use std::sync::Arc;

use crate::error::SyncError;
use crate::persistence::CheckpointStore;
use crate::store::IncrementalSyncStatusStore;
use crate::transport::{LiveEvent, LiveEventsSource, PendingEventsSource};

/// Downstream of the gatherer.
#[async_trait]
pub trait EventConsumer: Send + Sync {
    /// Handle one deduplicated event. An error ends the session.
    async fn consume(&self, envelope: EventEnvelope) -> Result<(), SyncError>;
}

/// Why a gathering session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringEnd {
    /// The server closed the live stream normally.
    StreamClosed,
    /// The connection policy asked to stop after the backlog.
    PolicyDisconnect,
}

/// Runs gathering sessions.
pub struct EventGatherer {
    pending: Arc<dyn PendingEventsSource>,
    live: Arc<dyn LiveEventsSource>,
    checkpoint: Arc<dyn CheckpointStore>,
    status: Arc<IncrementalSyncStatusStore>,
}

impl EventGatherer {
    /// Create a gatherer over the two feeds.
    pub fn new(
        pending: Arc<dyn PendingEventsSource>,
        live: Arc<dyn LiveEventsSource>,
        checkpoint: Arc<dyn CheckpointStore>,
        status: Arc<IncrementalSyncStatusStore>,
    ) -> Self {
        Self {
            pending,
            live,
            checkpoint,
            status,
        }
    }

    /// Run one session, feeding every deduplicated event to `consumer`.
    pub async fn gather_events(
        &self,
        consumer: &dyn EventConsumer,
    ) -> Result<GatheringEnd, SyncError> {
        self.status.update(IncrementalSyncStatus::Pending);
        self.bootstrap_checkpoint().await?;

        let mut stream = self
            .live
            .open_live_stream()
            .await
            .map_err(|cause| SyncError::failure("opening live stream", cause))?;
        let mut buffer = PendingEventsBuffer::new();
        let mut policy = self.status.subscribe_connection_policy();
        let mut policy_open = true;
        let mut is_live = false;

        loop {
            let item = tokio::select! {
                item = stream.next() => item,
                changed = policy.changed(), if is_live && policy_open => {
                    if changed.is_err() {
                        policy_open = false;
                    } else if *policy.borrow_and_update()
                        == ConnectionPolicy::DisconnectAfterPendingEvents
                    {
                        tracing::info!("connection policy changed, closing live stream");
                        return Ok(GatheringEnd::PolicyDisconnect);
                    }
                    continue;
                }
            };

            match item {
                Some(LiveEvent::Open) => {
                    if is_live {
                        tracing::warn!("live stream reopened mid-session, ignoring");
                        continue;
                    }
                    self.on_open(&mut buffer, consumer).await?;
                    is_live = true;
                    self.status.update(IncrementalSyncStatus::Live);
                    let policy_now = *policy.borrow_and_update();
                    if policy_now == ConnectionPolicy::DisconnectAfterPendingEvents {
                        tracing::info!("pending events processed, disconnecting");
                        return Ok(GatheringEnd::PolicyDisconnect);
                    }
                }
                Some(LiveEvent::Event(event)) => {
                    if deduplicate(&mut buffer, &event) {
                        tracing::trace!(
                            event_id = %event.id,
                            "live event already delivered as pending"
                        );
                        continue;
                    }
                    consumer.consume(EventEnvelope::live(event)).await?;
                }
                Some(LiveEvent::Closed(Some(cause))) => {
                    tracing::warn!(%cause, "live stream closed with failure");
                    return Err(SyncError::failure("live stream closed", cause));
                }
                Some(LiveEvent::Closed(None)) | None => {
                    tracing::info!("live stream closed");
                    return Ok(GatheringEnd::StreamClosed);
                }
            }
        }
    }

    async fn bootstrap_checkpoint(&self) -> Result<(), SyncError> {
        let current = self
            .checkpoint
            .last_processed_event_id()
            .await
            .map_err(|cause| SyncError::failure("reading checkpoint", cause))?;
        if current.is_some() {
            return Ok(());
        }
        let newest = self
            .pending
            .most_recent_event_id()
            .await
            .map_err(|cause| {
                SyncError::failure(
                    "fetching most recent event id",
                    cause.into_pending_fetch_failure(),
                )
            })?;
        tracing::info!(event_id = %newest, "no checkpoint, starting from most recent event");
        self.checkpoint
            .set_last_processed_event_id(newest)
            .await
            .map_err(|cause| SyncError::failure("writing checkpoint", cause))
    }

    async fn on_open(
        &self,
        buffer: &mut PendingEventsBuffer,
        consumer: &dyn EventConsumer,
    ) -> Result<(), SyncError> {
        self.status.update(IncrementalSyncStatus::FetchingPendingEvents);
        let since = self
            .checkpoint
            .last_processed_event_id()
            .await
            .map_err(|cause| SyncError::failure("reading checkpoint", cause))?;
        tracing::debug!(?since, "fetching pending events");

        let mut pending = self.pending.fetch_pending_events(since);
        let mut count = 0usize;
        while let Some(next) = pending.next().await {
            let event = next.map_err(|cause| {
                SyncError::failure("fetching pending events", cause.into_pending_fetch_failure())
            })?;
            buffer.add(event.clone());
            consumer.consume(EventEnvelope::pending(event)).await?;
            count += 1;
        }
        tracing::info!(count, "pending events processed");
        Ok(())
    }
}

/// Drop a live event if the backlog already delivered it.
///
/// The buffer is cleared when the duplicate is the last backlog event, since
/// nothing older can follow it on the live stream.
fn deduplicate(buffer: &mut PendingEventsBuffer, event: &Event) -> bool {
    if !buffer.contains(event) {
        return false;
    }
    if !buffer.clear_if_last_event_equals(event) {
        buffer.remove(event);
    }
    true
}
