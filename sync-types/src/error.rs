//! Failure taxonomy shared by every layer of the sync core.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a failure should be handled by the sync managers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Network or server trouble. Retried with backoff.
    Transport,
    /// The client is not in a state where sync can run (e.g. no registered
    /// client). Not retried until resolved externally.
    Precondition,
    /// A receiver or local storage rejected the work. The event is
    /// re-processed on the next session.
    Handler,
}

/// Typed failure reported by collaborators and surfaced through the status
/// streams.
///
/// Cloneable so it can live inside `Failed` statuses that are broadcast to
/// many observers.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum CoreFailure {
    /// The device has no usable network connection.
    #[error("no network connection: {0}")]
    NoNetworkConnection(String),

    /// The server answered with something unexpected.
    #[error("server miscommunication (status {status:?}): {message}")]
    ServerMiscommunication {
        /// HTTP-like status code, if the server sent one.
        status: Option<u16>,
        /// Human readable detail.
        message: String,
    },

    /// The current device has no registered client.
    #[error("missing client registration")]
    MissingClientRegistration,

    /// The session credentials expired.
    #[error("session expired")]
    SessionExpired,

    /// The server no longer knows the checkpoint event or the client.
    ///
    /// Recovery clears the checkpoint and forces a new slow sync.
    #[error("sync event or client not found")]
    SyncEventOrClientNotFound,

    /// Local persistence failed.
    #[error("storage failure: {0}")]
    Storage(String),

    /// An event receiver failed to apply an event.
    #[error("event handler failure: {0}")]
    Handler(String),

    /// Anything that could not be classified.
    #[error("unknown failure: {0}")]
    Unknown(String),
}

impl CoreFailure {
    /// HTTP status the server uses when a sync cursor or client is unknown.
    pub const NOT_FOUND_STATUS: u16 = 404;

    /// Classify this failure.
    pub fn kind(&self) -> FailureKind {
        match self {
            CoreFailure::NoNetworkConnection(_)
            | CoreFailure::ServerMiscommunication { .. }
            | CoreFailure::SyncEventOrClientNotFound
            | CoreFailure::Unknown(_) => FailureKind::Transport,
            CoreFailure::MissingClientRegistration | CoreFailure::SessionExpired => {
                FailureKind::Precondition
            }
            CoreFailure::Storage(_) | CoreFailure::Handler(_) => FailureKind::Handler,
        }
    }

    /// Whether the managers may retry automatically after a backoff delay.
    pub fn is_retryable(&self) -> bool {
        self.kind() != FailureKind::Precondition
    }

    /// Map a backlog-fetch failure to its sync meaning.
    ///
    /// A 404 on the notification endpoint means the checkpoint is unknown to
    /// the server.
    pub fn into_pending_fetch_failure(self) -> Self {
        match self {
            CoreFailure::ServerMiscommunication {
                status: Some(Self::NOT_FOUND_STATUS),
                ..
            } => CoreFailure::SyncEventOrClientNotFound,
            other => other,
        }
    }
}
