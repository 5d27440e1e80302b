//! Event dispatch.
//!
//! The [`EventProcessor`] is the consumer the gatherer feeds. For every
//! deduplicated event it:
//! 1. skips it if the checkpoint already covers its id
//! 2. matches the payload exhaustively and awaits the receiver for its
//!    category
//! 3. persists the checkpoint, unless the event is transient
//!
//! The checkpoint is written only after the receiver succeeded. Steps 2 and 3
//! run on their own task: once an event is accepted, cancelling the caller
//! does not interrupt it halfway.

use async_trait::async_trait;
use convsync_core::CheckpointTracker;
use convsync_types::{
    ConversationEvent, CoreFailure, DeliveryInfo, EventEnvelope, EventPayload, FeatureConfigEvent,
    TeamEvent, UserEvent, UserPropertyEvent,
};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::SyncError;
use crate::exception::flatten_join;
use crate::gatherer::EventConsumer;
use crate::persistence::CheckpointStore;

/// Applies events of one category to local state.
///
/// Receivers must be idempotent: an event whose checkpoint write failed is
/// delivered again on the next session.
#[async_trait]
pub trait EventReceiver<E>: Send + Sync {
    /// Apply one event.
    async fn on_event(&self, event: &E, delivery: DeliveryInfo) -> Result<(), CoreFailure>;
}

/// Receiver that accepts and ignores everything.
///
/// For categories a host does not handle yet.
#[derive(Debug, Default, Clone, Copy)]
pub struct IgnoringReceiver;

#[async_trait]
impl<E: Send + Sync + std::fmt::Debug> EventReceiver<E> for IgnoringReceiver {
    async fn on_event(&self, event: &E, _delivery: DeliveryInfo) -> Result<(), CoreFailure> {
        tracing::trace!(?event, "ignoring event");
        Ok(())
    }
}

/// One receiver per event category.
#[derive(Clone)]
pub struct EventReceivers {
    /// Conversation events.
    pub conversation: Arc<dyn EventReceiver<ConversationEvent>>,
    /// User events.
    pub user: Arc<dyn EventReceiver<UserEvent>>,
    /// User property events.
    pub user_property: Arc<dyn EventReceiver<UserPropertyEvent>>,
    /// Feature config events.
    pub feature_config: Arc<dyn EventReceiver<FeatureConfigEvent>>,
    /// Team events.
    pub team: Arc<dyn EventReceiver<TeamEvent>>,
}

impl Default for EventReceivers {
    fn default() -> Self {
        Self {
            conversation: Arc::new(IgnoringReceiver),
            user: Arc::new(IgnoringReceiver),
            user_property: Arc::new(IgnoringReceiver),
            feature_config: Arc::new(IgnoringReceiver),
            team: Arc::new(IgnoringReceiver),
        }
    }
}

/// Dispatches events and advances the checkpoint.
#[derive(Clone)]
pub struct EventProcessor {
    inner: Arc<ProcessorInner>,
}

struct ProcessorInner {
    receivers: EventReceivers,
    checkpoint_store: Arc<dyn CheckpointStore>,
    tracker: Mutex<CheckpointTracker>,
}

impl EventProcessor {
    /// Create a processor. Call [`EventProcessor::reload_checkpoint`] before
    /// each gathering session.
    pub fn new(receivers: EventReceivers, checkpoint_store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            inner: Arc::new(ProcessorInner {
                receivers,
                checkpoint_store,
                tracker: Mutex::new(CheckpointTracker::new()),
            }),
        }
    }

    /// Refresh the in-memory checkpoint from the store.
    ///
    /// Picks up bootstraps and recovery resets made outside the processor.
    pub async fn reload_checkpoint(&self) -> Result<(), CoreFailure> {
        let last = self.inner.checkpoint_store.last_processed_event_id().await?;
        self.inner.tracker().reset(last);
        Ok(())
    }

    /// Process one event to completion.
    ///
    /// Runs on a separate task; dropping the returned future does not
    /// interrupt an event that has started processing.
    pub async fn process_event(&self, envelope: EventEnvelope) -> Result<(), SyncError> {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.process(envelope).await });
        flatten_join(handle.await)
    }
}

#[async_trait]
impl EventConsumer for EventProcessor {
    async fn consume(&self, envelope: EventEnvelope) -> Result<(), SyncError> {
        self.process_event(envelope).await
    }
}

impl ProcessorInner {
    fn tracker(&self) -> MutexGuard<'_, CheckpointTracker> {
        self.tracker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn process(&self, envelope: EventEnvelope) -> Result<(), CoreFailure> {
        let EventEnvelope { event, delivery } = envelope;

        let already_processed = self.tracker().is_processed(event.id);
        if already_processed {
            tracing::debug!(event_id = %event.id, "event already processed, skipping");
            return Ok(());
        }

        tracing::debug!(
            event_id = %event.id,
            category = %event.category(),
            source = ?delivery.source,
            "dispatching event"
        );
        self.dispatch(&event.payload, delivery).await.map_err(|cause| {
            tracing::warn!(event_id = %event.id, %cause, "event receiver failed");
            cause
        })?;

        if event.transient {
            tracing::trace!(event_id = %event.id, "transient event, checkpoint unchanged");
            return Ok(());
        }

        let checked = self.tracker().check_advance(event.id);
        if let Err(e) = checked {
            tracing::warn!(error = %e, "not moving checkpoint backwards");
            return Ok(());
        }
        self.checkpoint_store
            .set_last_processed_event_id(event.id)
            .await?;
        let advanced = self.tracker().advance(event.id);
        if let Err(e) = advanced {
            tracing::warn!(error = %e, "checkpoint moved concurrently");
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        payload: &EventPayload,
        delivery: DeliveryInfo,
    ) -> Result<(), CoreFailure> {
        let receivers = &self.receivers;
        match payload {
            EventPayload::Conversation(event) => {
                receivers.conversation.on_event(event, delivery).await
            }
            EventPayload::User(event) => receivers.user.on_event(event, delivery).await,
            EventPayload::UserProperty(event) => {
                receivers.user_property.on_event(event, delivery).await
            }
            EventPayload::FeatureConfig(event) => {
                receivers.feature_config.on_event(event, delivery).await
            }
            EventPayload::Team(event) => receivers.team.on_event(event, delivery).await,
            EventPayload::Unknown { kind } => {
                tracing::warn!(kind = %kind, "unknown event type, skipping");
                Ok(())
            }
        }
    }
}
