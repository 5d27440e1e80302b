//! Incremental sync manager.
//!
//! Runs gathering sessions back to back for as long as it is subscribed.
//! Failures are published as `Failed(cause, delay)` and retried after the
//! backoff delay; precondition failures park until a retry is requested.

use async_trait::async_trait;
use convsync_core::{BackoffPolicy, ConnectionPolicy, ExponentialBackoff, IncrementalSyncStatus};
use convsync_types::CoreFailure;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

use crate::error::SyncError;
use crate::executor::SyncWorker;
use crate::gatherer::{EventGatherer, GatheringEnd};
use crate::processor::EventProcessor;
use crate::recovery::{IncrementalSyncRecoveryHandler, RecoveryAction, RetryTrigger};
use crate::store::IncrementalSyncStatusStore;

/// Sole writer of [`IncrementalSyncStatus`].
pub struct IncrementalSyncManager {
    gatherer: EventGatherer,
    processor: EventProcessor,
    status: Arc<IncrementalSyncStatusStore>,
    recovery: IncrementalSyncRecoveryHandler,
    backoff: Mutex<ExponentialBackoff>,
    retry: RetryTrigger,
}

impl IncrementalSyncManager {
    /// Create a manager.
    pub fn new(
        gatherer: EventGatherer,
        processor: EventProcessor,
        status: Arc<IncrementalSyncStatusStore>,
        recovery: IncrementalSyncRecoveryHandler,
        backoff: BackoffPolicy,
        retry: RetryTrigger,
    ) -> Self {
        Self {
            gatherer,
            processor,
            status,
            recovery,
            backoff: Mutex::new(ExponentialBackoff::new(backoff)),
            retry,
        }
    }

    fn backoff(&self) -> MutexGuard<'_, ExponentialBackoff> {
        self.backoff
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// One gathering session. Resets the backoff if the session got live.
    async fn run_session(&self) -> Result<GatheringEnd, SyncError> {
        self.processor
            .reload_checkpoint()
            .await
            .map_err(|cause| SyncError::failure("loading checkpoint", cause))?;

        let result = self.gatherer.gather_events(&self.processor).await;
        if self.status.current() == IncrementalSyncStatus::Live {
            self.backoff().reset();
        }
        result
    }

    async fn handle_failure(
        &self,
        cause: CoreFailure,
        retry: &mut watch::Receiver<u64>,
    ) -> Result<(), SyncError> {
        let action = match self.recovery.recover(&cause).await {
            Ok(action) => action,
            Err(e) => {
                tracing::error!(error = %e, "incremental sync recovery failed");
                RecoveryAction::RetryAfterBackoff
            }
        };

        if action == RecoveryAction::AwaitExternalRecovery {
            tracing::warn!(%cause, "incremental sync parked until retry");
            self.status.update(IncrementalSyncStatus::Failed {
                cause,
                retry_delay: Duration::ZERO,
            });
            retry_fired(retry).await;
            self.backoff().reset();
            return Ok(());
        }

        let delay = self.backoff().next();
        tracing::warn!(
            %cause,
            delay_ms = delay.as_millis() as u64,
            "incremental sync failed, retrying"
        );
        self.status.update(IncrementalSyncStatus::Failed {
            cause,
            retry_delay: delay,
        });

        let mut policy = self.status.subscribe_connection_policy();
        policy.borrow_and_update();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = retry_fired(retry) => {
                tracing::info!("retry requested");
                self.backoff().reset();
            }
            _ = keep_alive_requested(&mut policy) => {
                tracing::info!("connection policy upgraded, retrying now");
                self.backoff().reset();
            }
        }
        Ok(())
    }

    async fn wait_for_keep_alive(&self) -> Result<(), SyncError> {
        let mut policy = self.status.subscribe_connection_policy();
        policy
            .wait_for(|policy| *policy == ConnectionPolicy::KeepAlive)
            .await
            .map(|_| ())
            .map_err(|_| SyncError::Internal("connection policy store dropped".into()))
    }
}

#[async_trait]
impl SyncWorker for IncrementalSyncManager {
    async fn sync(&self) -> Result<(), SyncError> {
        tracing::info!("incremental sync started");
        let mut retry = self.retry.subscribe();
        retry.borrow_and_update();

        loop {
            match self.run_session().await {
                Ok(end) => {
                    self.status.update(IncrementalSyncStatus::Pending);
                    let disconnect = end == GatheringEnd::PolicyDisconnect
                        || self.status.connection_policy()
                            == ConnectionPolicy::DisconnectAfterPendingEvents;
                    if disconnect {
                        tracing::info!("incremental sync disconnected until keep-alive");
                        self.wait_for_keep_alive().await?;
                    } else {
                        tracing::debug!("live stream closed cleanly, reconnecting");
                    }
                }
                Err(error) => match error.into_failure() {
                    Some(cause) => self.handle_failure(cause, &mut retry).await?,
                    None => return Err(SyncError::Cancelled),
                },
            }
        }
    }

    async fn on_cancelled(&self) {
        tracing::info!("incremental sync stopped");
        self.status.update(IncrementalSyncStatus::Pending);
    }

    async fn on_failure(&self, cause: CoreFailure) -> Duration {
        let delay = self.backoff().next();
        self.status.update(IncrementalSyncStatus::Failed {
            cause,
            retry_delay: delay,
        });
        delay
    }
}

async fn retry_fired(retry: &mut watch::Receiver<u64>) {
    if retry.changed().await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn keep_alive_requested(policy: &mut watch::Receiver<ConnectionPolicy>) {
    loop {
        if policy.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
        if *policy.borrow_and_update() == ConnectionPolicy::KeepAlive {
            return;
        }
    }
}
