//! Pending events buffer.
//!
//! Holds the events delivered by the backlog fetch during one gathering
//! session so that the same events echoed by the live stream can be
//! suppressed. Matching uses full event equality, not just the id.
//!
//! The buffer is owned by a single gathering session and discarded when the
//! session ends.

use convsync_types::Event;

/// Ordered set of events seen during the pending phase.
#[derive(Debug, Default, Clone)]
pub struct PendingEventsBuffer {
    events: Vec<Event>,
}

impl PendingEventsBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    /// Record an event delivered by the backlog.
    ///
    /// Adding an event that is already present is a no-op.
    pub fn add(&mut self, event: Event) {
        if !self.contains(&event) {
            self.events.push(event);
        }
    }

    /// Whether the buffer holds this exact event.
    pub fn contains(&self, event: &Event) -> bool {
        self.events.iter().any(|e| e == event)
    }

    /// Remove an event. Returns whether it was present.
    pub fn remove(&mut self, event: &Event) -> bool {
        match self.events.iter().position(|e| e == event) {
            Some(index) => {
                self.events.remove(index);
                true
            }
            None => false,
        }
    }

    /// Clear the whole buffer if `event` is the last buffered event.
    ///
    /// Once the live stream echoes the newest backlog event, everything
    /// older has been echoed or will never be, so the buffer can go.
    pub fn clear_if_last_event_equals(&mut self, event: &Event) -> bool {
        if self.events.last() == Some(event) {
            self.events.clear();
            true
        } else {
            false
        }
    }

    /// The newest buffered event.
    pub fn last(&self) -> Option<&Event> {
        self.events.last()
    }

    /// Number of buffered events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Drop all buffered events.
    pub fn clear(&mut self) {
        self.events.clear();
    }
}
