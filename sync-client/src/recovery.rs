//! Recovery decisions for failed sync attempts.

use convsync_types::{CoreFailure, FailureKind};
use std::sync::Arc;
use tokio::sync::watch;

use crate::persistence::CheckpointStore;
use crate::store::SlowSyncStatusStore;

/// Manual retry signal shared by the managers.
///
/// Parked managers wake when it fires.
#[derive(Clone)]
pub struct RetryTrigger {
    tx: Arc<watch::Sender<u64>>,
}

impl RetryTrigger {
    /// Create a trigger that has never fired.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    /// Wake every parked manager.
    pub fn fire(&self) {
        self.tx.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    /// Receiver that reports each firing as a change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }
}

impl Default for RetryTrigger {
    fn default() -> Self {
        Self::new()
    }
}

/// What a manager does after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Retry automatically after the backoff delay.
    RetryAfterBackoff,
    /// Clear the checkpoint and force a new slow sync, then retry.
    ResetSlowSync,
    /// Park until the precondition is restored or a retry is requested.
    AwaitExternalRecovery,
}

impl RecoveryAction {
    /// Recovery for a failure.
    pub fn for_failure(failure: &CoreFailure) -> Self {
        match (failure, failure.kind()) {
            (CoreFailure::SyncEventOrClientNotFound, _) => RecoveryAction::ResetSlowSync,
            (_, FailureKind::Precondition) => RecoveryAction::AwaitExternalRecovery,
            _ => RecoveryAction::RetryAfterBackoff,
        }
    }
}

/// Performs the state resets recovery requires for incremental sync.
pub struct IncrementalSyncRecoveryHandler {
    slow_status: Arc<SlowSyncStatusStore>,
    checkpoint: Arc<dyn CheckpointStore>,
}

impl IncrementalSyncRecoveryHandler {
    /// Create a handler.
    pub fn new(
        slow_status: Arc<SlowSyncStatusStore>,
        checkpoint: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            slow_status,
            checkpoint,
        }
    }

    /// Apply the recovery for `failure` and report what the caller must do
    /// next.
    pub async fn recover(&self, failure: &CoreFailure) -> Result<RecoveryAction, CoreFailure> {
        let action = RecoveryAction::for_failure(failure);
        if action == RecoveryAction::ResetSlowSync {
            tracing::warn!(%failure, "checkpoint unknown to server, forcing slow sync");
            self.checkpoint.clear_last_processed_event_id().await?;
            self.slow_status.reset().await?;
        }
        Ok(action)
    }
}
