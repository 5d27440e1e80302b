//! Mock event feeds for testing.
//!
//! Allows scripting the backlog and live sessions and capturing the calls
//! made by the gatherer for verification.

use super::{
    LiveEvent, LiveEventStream, LiveEventsSource, PendingEventStream, PendingEventsSource,
};
use async_trait::async_trait;
use convsync_types::{CoreFailure, Event, EventId};
use futures_util::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Mock implementation of both event feeds.
///
/// Every `open_live_stream()` call starts a new live session. If a script
/// was queued with [`MockEventSource::script_next_session`], its items are
/// delivered first; otherwise the session starts with [`LiveEvent::Open`].
/// Further items can be pushed into the current session with
/// [`MockEventSource::push_live`].
#[derive(Debug, Default)]
pub struct MockEventSource {
    inner: Arc<Mutex<MockEventSourceInner>>,
}

#[derive(Debug, Default)]
struct MockEventSourceInner {
    backlog: Vec<Event>,
    most_recent: Option<EventId>,
    fetch_calls: Vec<Option<EventId>>,
    open_count: usize,
    scripted_sessions: VecDeque<Vec<LiveEvent>>,
    live_tx: Option<mpsc::UnboundedSender<LiveEvent>>,
    fail_next_fetch: Option<CoreFailure>,
    fail_next_open: Option<CoreFailure>,
    fail_next_most_recent: Option<CoreFailure>,
}

impl MockEventSource {
    /// Create a new mock source with an empty backlog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an event to the server backlog.
    pub fn add_backlog_event(&self, event: Event) {
        let mut inner = self.inner.lock().unwrap();
        inner.backlog.push(event);
    }

    /// Set the id returned by `most_recent_event_id()`.
    ///
    /// Defaults to the newest backlog event.
    pub fn set_most_recent_event_id(&self, id: EventId) {
        let mut inner = self.inner.lock().unwrap();
        inner.most_recent = Some(id);
    }

    /// Queue the items the next live session delivers on open.
    pub fn script_next_session(&self, items: Vec<LiveEvent>) {
        let mut inner = self.inner.lock().unwrap();
        inner.scripted_sessions.push_back(items);
    }

    /// Push an item into the current live session.
    ///
    /// Returns false if no session is open.
    pub fn push_live(&self, item: LiveEvent) -> bool {
        let inner = self.inner.lock().unwrap();
        match &inner.live_tx {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }

    /// Close the current live session, optionally with a failure.
    pub fn close_live(&self, cause: Option<CoreFailure>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.live_tx.take() {
            Some(tx) => tx.send(LiveEvent::Closed(cause)).is_ok(),
            None => false,
        }
    }

    /// The `since` argument of every backlog fetch so far.
    pub fn fetch_calls(&self) -> Vec<Option<EventId>> {
        let inner = self.inner.lock().unwrap();
        inner.fetch_calls.clone()
    }

    /// Number of live sessions opened so far.
    pub fn open_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.open_count
    }

    /// Cause the next backlog fetch to yield the given failure.
    pub fn fail_next_fetch(&self, failure: CoreFailure) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_fetch = Some(failure);
    }

    /// Cause the next `open_live_stream()` to fail.
    pub fn fail_next_open(&self, failure: CoreFailure) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_open = Some(failure);
    }

    /// Cause the next `most_recent_event_id()` to fail.
    pub fn fail_next_most_recent(&self, failure: CoreFailure) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_most_recent = Some(failure);
    }
}

impl Clone for MockEventSource {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[async_trait]
impl PendingEventsSource for MockEventSource {
    fn fetch_pending_events(&self, since: Option<EventId>) -> PendingEventStream {
        let mut inner = self.inner.lock().unwrap();
        inner.fetch_calls.push(since);

        // Check for forced failure
        if let Some(failure) = inner.fail_next_fetch.take() {
            return stream::iter(vec![Err(failure)]).boxed();
        }

        let events: Vec<Result<Event, CoreFailure>> = inner
            .backlog
            .iter()
            .filter(|event| since.map_or(true, |since| event.id > since))
            .cloned()
            .map(Ok)
            .collect();
        stream::iter(events).boxed()
    }

    async fn most_recent_event_id(&self) -> Result<EventId, CoreFailure> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(failure) = inner.fail_next_most_recent.take() {
            return Err(failure);
        }

        Ok(inner
            .most_recent
            .or_else(|| inner.backlog.iter().map(|e| e.id).max())
            .unwrap_or_default())
    }
}

#[async_trait]
impl LiveEventsSource for MockEventSource {
    async fn open_live_stream(&self) -> Result<LiveEventStream, CoreFailure> {
        let mut inner = self.inner.lock().unwrap();

        // Check for forced failure
        if let Some(failure) = inner.fail_next_open.take() {
            return Err(failure);
        }

        inner.open_count += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        let script = inner
            .scripted_sessions
            .pop_front()
            .unwrap_or_else(|| vec![LiveEvent::Open]);
        for item in script {
            let _ = tx.send(item);
        }
        inner.live_tx = Some(tx);

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }
}
