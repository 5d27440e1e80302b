//! # sync-types
//!
//! Event model for the conversation sync core.
//!
//! This crate provides the foundational types used across all convsync crates:
//! - [`EventId`], [`ConversationId`], [`UserId`], [`TeamId`] - Identity and ordering types
//! - [`Event`] and [`EventPayload`] - Server events, one payload variant per receiver category
//! - [`EventEnvelope`] - Event plus delivery metadata
//! - [`CoreFailure`] - Failure taxonomy

#![warn(missing_docs)]
#![warn(clippy::all)]

mod envelope;
mod error;
mod event;
mod ids;

pub use envelope::{DeliveryInfo, EventEnvelope, EventSource};
pub use error::{CoreFailure, FailureKind};
pub use event::{
    ConversationEvent, ConversationEventKind, Event, EventCategory, EventPayload, EventScope,
    FeatureConfigEvent, TeamEvent, UserEvent, UserPropertyEvent,
};
pub use ids::{ConversationId, EventId, TeamId, UserId};
