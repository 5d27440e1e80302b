//! Error type for sync tasks.

use convsync_types::CoreFailure;
use thiserror::Error;

/// How a sync task ended abnormally.
///
/// Every sync task result funnels through the
/// [`SyncExceptionHandler`](crate::SyncExceptionHandler), which maps these
/// variants onto its two callbacks.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A collaborator reported a typed failure.
    #[error("{context}: {cause}")]
    Failure {
        /// What the task was doing.
        context: String,
        /// The failure.
        #[source]
        cause: CoreFailure,
    },

    /// The task was cancelled by its scope.
    #[error("sync task cancelled")]
    Cancelled,

    /// The task panicked.
    #[error("sync task panicked: {0}")]
    Panicked(String),

    /// Internal invariant broken (e.g. a status store went away).
    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Wrap a failure with context.
    pub fn failure(context: impl Into<String>, cause: CoreFailure) -> Self {
        SyncError::Failure {
            context: context.into(),
            cause,
        }
    }

    /// The typed failure observers should see.
    ///
    /// `None` for cancellation, which is never surfaced as a failure.
    /// Untyped errors become [`CoreFailure::Unknown`].
    pub fn into_failure(self) -> Option<CoreFailure> {
        match self {
            SyncError::Failure { cause, .. } => Some(cause),
            SyncError::Cancelled => None,
            SyncError::Panicked(message) => Some(CoreFailure::Unknown(format!("panic: {message}"))),
            SyncError::Internal(message) => Some(CoreFailure::Unknown(message)),
        }
    }

    /// Whether this is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }
}

impl From<CoreFailure> for SyncError {
    fn from(cause: CoreFailure) -> Self {
        SyncError::failure("sync failure", cause)
    }
}
