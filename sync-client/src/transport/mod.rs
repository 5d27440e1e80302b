//! Event feed abstraction.
//!
//! The sync core consumes two feeds owned by the network layer:
//! - the **pending events** endpoint, a finite backlog of events after a
//!   given checkpoint
//! - the **live stream**, a long-lived push channel (WebSocket or similar)
//!
//! Both are traits so the wire transport stays outside this crate. The mock
//! implementation drives all tests.

mod mock;

pub use mock::MockEventSource;

use async_trait::async_trait;
use convsync_types::{CoreFailure, Event, EventId};
use futures_util::stream::BoxStream;

/// Lazy, finite sequence of backlog events.
pub type PendingEventStream = BoxStream<'static, Result<Event, CoreFailure>>;

/// Items of the live stream.
pub type LiveEventStream = BoxStream<'static, LiveEvent>;

/// One item of the live stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveEvent {
    /// The connection is established; backlog fetching may begin.
    Open,
    /// An event pushed by the server.
    Event(Event),
    /// The connection closed. `None` means a normal close.
    Closed(Option<CoreFailure>),
}

/// Source of backlog events.
#[async_trait]
pub trait PendingEventsSource: Send + Sync {
    /// Fetch all events after `since` (all retained events if `None`).
    ///
    /// The stream is lazy; errors are yielded in place and end the fetch.
    fn fetch_pending_events(&self, since: Option<EventId>) -> PendingEventStream;

    /// Id of the newest event the server knows for this client.
    ///
    /// Used to bootstrap the checkpoint of a client that never processed an
    /// event; a fresh slow sync already covers everything before it.
    async fn most_recent_event_id(&self) -> Result<EventId, CoreFailure>;
}

/// Source of live events.
#[async_trait]
pub trait LiveEventsSource: Send + Sync {
    /// Open the live stream.
    ///
    /// The stream yields [`LiveEvent::Open`] once connected. Ending without a
    /// [`LiveEvent::Closed`] is treated as a normal close.
    async fn open_live_stream(&self) -> Result<LiveEventStream, CoreFailure>;
}
