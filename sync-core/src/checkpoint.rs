//! Checkpoint tracking.
//!
//! The checkpoint is the id of the last event that was durably applied.
//! Event ids are assigned by the server and globally ordered, so the
//! checkpoint only ever moves forward. The single exception is an explicit
//! recovery reset.

use convsync_types::EventId;
use thiserror::Error;

/// Errors from checkpoint updates.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckpointError {
    /// Attempted to move the checkpoint backwards.
    #[error("checkpoint regression: current {current}, attempted {attempted}")]
    Regression {
        /// The checkpoint before the update.
        current: EventId,
        /// The rejected value.
        attempted: EventId,
    },
}

/// In-memory view of the persisted checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointTracker {
    last: Option<EventId>,
}

impl CheckpointTracker {
    /// A tracker with no checkpoint (nothing processed yet).
    pub fn new() -> Self {
        Self { last: None }
    }

    /// Resume from a persisted checkpoint.
    pub fn with_checkpoint(last: Option<EventId>) -> Self {
        Self { last }
    }

    /// The current checkpoint.
    pub fn last(&self) -> Option<EventId> {
        self.last
    }

    /// Whether an event with this id is already covered by the checkpoint.
    pub fn is_processed(&self, id: EventId) -> bool {
        self.last.is_some_and(|last| id <= last)
    }

    /// Check that `id` may become the new checkpoint without applying it.
    pub fn check_advance(&self, id: EventId) -> Result<(), CheckpointError> {
        match self.last {
            Some(current) if id < current => Err(CheckpointError::Regression {
                current,
                attempted: id,
            }),
            _ => Ok(()),
        }
    }

    /// Move the checkpoint to `id`.
    ///
    /// Advancing to the current value is a no-op.
    pub fn advance(&mut self, id: EventId) -> Result<(), CheckpointError> {
        self.check_advance(id)?;
        self.last = Some(id);
        Ok(())
    }

    /// Replace the checkpoint unconditionally (recovery and reload).
    pub fn reset(&mut self, last: Option<EventId>) {
        self.last = last;
    }
}
