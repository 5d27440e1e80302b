//! Envelope - an event plus how it reached the client.

use serde::{Deserialize, Serialize};

use crate::Event;

/// Which feed delivered an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    /// Backlog fetched over the pending-events endpoint.
    Pending,
    /// Pushed over the live stream.
    Live,
}

/// Delivery metadata handed to receivers alongside the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryInfo {
    /// Feed the event came from.
    pub source: EventSource,
}

/// An event as handed to the dispatch layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// The event itself.
    pub event: Event,
    /// How it was delivered.
    pub delivery: DeliveryInfo,
}

impl EventEnvelope {
    /// Wrap an event delivered by the backlog fetch.
    pub fn pending(event: Event) -> Self {
        Self {
            event,
            delivery: DeliveryInfo {
                source: EventSource::Pending,
            },
        }
    }

    /// Wrap an event delivered by the live stream.
    pub fn live(event: Event) -> Self {
        Self {
            event,
            delivery: DeliveryInfo {
                source: EventSource::Live,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventId, EventPayload};

    #[test]
    fn constructors_set_source() {
        let event = Event::new(EventId::new(1), EventPayload::Unknown { kind: "x".into() });
        assert_eq!(
            EventEnvelope::pending(event.clone()).delivery.source,
            EventSource::Pending
        );
        assert_eq!(EventEnvelope::live(event).delivery.source, EventSource::Live);
    }
}
