//! Composition root.
//!
//! [`SyncEngine`] wires the stores, managers, observer and executor together
//! from a [`SyncConfig`] and the host's collaborators.

use convsync_core::{ConnectionPolicy, SyncCriteria};
use convsync_types::CoreFailure;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;
use crate::exception::SyncExceptionHandler;
use crate::executor::SyncExecutor;
use crate::gatherer::EventGatherer;
use crate::incremental::IncrementalSyncManager;
use crate::observer::SyncStateObserver;
use crate::persistence::{CheckpointStore, SlowSyncRecordStore};
use crate::processor::{EventProcessor, EventReceivers};
use crate::recovery::{IncrementalSyncRecoveryHandler, RetryTrigger};
use crate::slow::{SlowSyncManager, SlowSyncSettings, SlowSyncStepExecutor};
use crate::store::{IncrementalSyncStatusStore, SlowSyncStatusStore};
use crate::transport::{LiveEventsSource, PendingEventsSource};

/// Collaborators supplied by the host.
pub struct SyncDependencies {
    pending_source: Arc<dyn PendingEventsSource>,
    live_source: Arc<dyn LiveEventsSource>,
    checkpoint_store: Arc<dyn CheckpointStore>,
    slow_sync_store: Arc<dyn SlowSyncRecordStore>,
    slow_sync_steps: Vec<Arc<dyn SlowSyncStepExecutor>>,
    receivers: EventReceivers,
    exception_handler: SyncExceptionHandler,
}

impl SyncDependencies {
    /// Feeds and stores; no slow sync steps, ignoring receivers, logging
    /// exception handler.
    pub fn new(
        pending_source: Arc<dyn PendingEventsSource>,
        live_source: Arc<dyn LiveEventsSource>,
        checkpoint_store: Arc<dyn CheckpointStore>,
        slow_sync_store: Arc<dyn SlowSyncRecordStore>,
    ) -> Self {
        Self {
            pending_source,
            live_source,
            checkpoint_store,
            slow_sync_store,
            slow_sync_steps: Vec::new(),
            receivers: EventReceivers::default(),
            exception_handler: SyncExceptionHandler::logging("sync"),
        }
    }

    /// Set the slow sync step executors.
    pub fn with_slow_sync_steps(mut self, steps: Vec<Arc<dyn SlowSyncStepExecutor>>) -> Self {
        self.slow_sync_steps = steps;
        self
    }

    /// Set the event receivers.
    pub fn with_receivers(mut self, receivers: EventReceivers) -> Self {
        self.receivers = receivers;
        self
    }

    /// Set the handler sync task failures are reported to.
    pub fn with_exception_handler(mut self, handler: SyncExceptionHandler) -> Self {
        self.exception_handler = handler;
        self
    }
}

/// A running sync core.
pub struct SyncEngine {
    executor: SyncExecutor,
    observer: SyncStateObserver,
    slow_status: Arc<SlowSyncStatusStore>,
    incremental_status: Arc<IncrementalSyncStatusStore>,
    criteria: watch::Sender<SyncCriteria>,
    retry: RetryTrigger,
}

impl SyncEngine {
    /// Build the engine and start its executor inside `scope`.
    ///
    /// Sync criteria start as [`SyncCriteria::Ready`].
    pub async fn start(
        config: &SyncConfig,
        deps: SyncDependencies,
        scope: CancellationToken,
    ) -> Result<Self, CoreFailure> {
        let slow_status = Arc::new(SlowSyncStatusStore::load(deps.slow_sync_store).await?);
        let incremental_status = Arc::new(IncrementalSyncStatusStore::new(
            config.incremental.connection_policy,
        ));
        let observer =
            SyncStateObserver::new(slow_status.subscribe(), incremental_status.subscribe());
        let (criteria, criteria_rx) = watch::channel(SyncCriteria::Ready);
        let retry = RetryTrigger::new();
        let backoff = config.backoff.policy();

        let processor = EventProcessor::new(deps.receivers, deps.checkpoint_store.clone());
        let gatherer = EventGatherer::new(
            deps.pending_source,
            deps.live_source,
            deps.checkpoint_store.clone(),
            incremental_status.clone(),
        );
        let recovery =
            IncrementalSyncRecoveryHandler::new(slow_status.clone(), deps.checkpoint_store);
        let incremental = IncrementalSyncManager::new(
            gatherer,
            processor,
            incremental_status.clone(),
            recovery,
            backoff,
            retry.clone(),
        );
        let slow = SlowSyncManager::new(
            deps.slow_sync_steps,
            slow_status.clone(),
            criteria_rx,
            SlowSyncSettings {
                version: config.slow_sync.version,
                max_age: config.slow_sync.max_age(),
                backoff,
            },
            retry.clone(),
        );

        let executor = SyncExecutor::new(
            observer.clone(),
            Arc::new(slow),
            Arc::new(incremental),
            scope,
            deps.exception_handler,
        );
        executor.start_and_stop_sync_as_needed();
        tracing::info!(
            slow_sync_version = config.slow_sync.version,
            policy = ?config.incremental.connection_policy,
            "sync engine started"
        );

        Ok(Self {
            executor,
            observer,
            slow_status,
            incremental_status,
            criteria,
            retry,
        })
    }

    /// The executor consumers request sync through.
    pub fn executor(&self) -> &SyncExecutor {
        &self.executor
    }

    /// Read-only sync state.
    pub fn observer(&self) -> &SyncStateObserver {
        &self.observer
    }

    /// Update whether slow sync may run.
    pub fn set_sync_criteria(&self, criteria: SyncCriteria) {
        tracing::info!(?criteria, "sync criteria updated");
        self.criteria.send_replace(criteria);
    }

    /// Change the connection policy of incremental sync.
    pub fn set_connection_policy(&self, policy: ConnectionPolicy) {
        self.incremental_status.set_connection_policy(policy);
    }

    /// Wake managers parked on a failure and retry immediately.
    pub fn retry_now(&self) {
        tracing::info!("manual retry requested");
        self.retry.fire();
    }

    /// Force a full slow sync.
    pub async fn reset_slow_sync(&self) -> Result<(), CoreFailure> {
        self.slow_status.reset().await
    }

    /// Cancel every sync task and wait for them to finish.
    pub async fn shutdown(&self) {
        tracing::info!("sync engine shutting down");
        self.executor.shutdown().await;
    }
}
