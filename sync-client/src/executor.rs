//! Demand-driven subscription of the sync managers.
//!
//! Consumers register interest with [`SyncExecutor::request`] (or a raw
//! [`SyncRequestGuard`]). A single supervisor task feeds demand and slow sync
//! status changes into the pure [`ExecutorState`] machine and interprets the
//! actions it returns by spawning or cancelling manager subscriptions.
//!
//! Each manager has at most one subscription at a time, however many
//! requests are outstanding. A subscription whose `sync()` fails or panics
//! publishes the failure through [`SyncWorker::on_failure`] and runs again
//! after the returned delay.

use async_trait::async_trait;
use convsync_core::{ExecutorAction, ExecutorEvent, ExecutorState, SlowSyncStatus, SyncState};
use convsync_types::CoreFailure;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::SyncError;
use crate::exception::{SyncExceptionHandler, TaskOutcome};
use crate::observer::SyncStateObserver;

/// A long-running sync loop the executor can subscribe.
///
/// `sync()` runs until its subscription is cancelled; it is called again on
/// the next subscription and must resume from persisted state.
#[async_trait]
pub trait SyncWorker: Send + Sync {
    /// Run until cancelled.
    async fn sync(&self) -> Result<(), SyncError>;

    /// Called after the subscription was cancelled and `sync()` dropped.
    async fn on_cancelled(&self) {}

    /// Publish a failure that escaped `sync()` (including a panic).
    ///
    /// Returns how long to wait before `sync()` runs again.
    async fn on_failure(&self, cause: CoreFailure) -> Duration;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Demand {
    requests: usize,
    always_on: bool,
}

impl Demand {
    fn needed(&self) -> bool {
        self.requests > 0 || self.always_on
    }
}

/// Starts and stops the sync managers based on consumer demand.
#[derive(Clone)]
pub struct SyncExecutor {
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    observer: SyncStateObserver,
    slow: Arc<dyn SyncWorker>,
    incremental: Arc<dyn SyncWorker>,
    scope: CancellationToken,
    demand: watch::Sender<Demand>,
    started: AtomicBool,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    exception_handler: SyncExceptionHandler,
}

impl SyncExecutor {
    /// Create an executor. Nothing runs until
    /// [`SyncExecutor::start_and_stop_sync_as_needed`] is called.
    pub fn new(
        observer: SyncStateObserver,
        slow: Arc<dyn SyncWorker>,
        incremental: Arc<dyn SyncWorker>,
        scope: CancellationToken,
        exception_handler: SyncExceptionHandler,
    ) -> Self {
        let (demand, _) = watch::channel(Demand::default());
        Self {
            inner: Arc::new(ExecutorInner {
                observer,
                slow,
                incremental,
                scope,
                demand,
                started: AtomicBool::new(false),
                supervisor: Mutex::new(None),
                exception_handler,
            }),
        }
    }

    /// Spawn the supervisor. Calling it again has no effect.
    pub fn start_and_stop_sync_as_needed(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("starting sync supervisor");
        let handle = tokio::spawn(supervise(Arc::clone(&self.inner)));
        *self.inner.supervisor_slot() = Some(handle);
    }

    /// Run `body` with sync running.
    ///
    /// Sync is demanded from before `body` starts until it finishes, fails,
    /// panics or is dropped.
    pub async fn request<F, Fut, T>(&self, body: F) -> T
    where
        F: FnOnce(SyncRequest) -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.acquire();
        let request = SyncRequest {
            executor: self.clone(),
        };
        let output = body(request).await;
        drop(guard);
        output
    }

    /// Demand sync for as long as the returned guard is alive.
    pub fn acquire(&self) -> SyncRequestGuard {
        self.inner.demand.send_modify(|demand| demand.requests += 1);
        SyncRequestGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Observer of the sync state.
    pub fn observer(&self) -> &SyncStateObserver {
        &self.inner.observer
    }

    /// Cancel the scope and wait until every subscription has finished.
    pub async fn shutdown(&self) {
        self.inner.scope.cancel();
        let handle = self.inner.supervisor_slot().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "sync supervisor ended abnormally");
            }
        }
    }
}

impl ExecutorInner {
    fn supervisor_slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.supervisor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Releases its demand when dropped.
#[must_use = "sync is only demanded while the guard is alive"]
pub struct SyncRequestGuard {
    inner: Arc<ExecutorInner>,
}

impl Drop for SyncRequestGuard {
    fn drop(&mut self) {
        self.inner
            .demand
            .send_modify(|demand| demand.requests = demand.requests.saturating_sub(1));
    }
}

/// Handle passed to the body of [`SyncExecutor::request`].
#[derive(Clone)]
pub struct SyncRequest {
    executor: SyncExecutor,
}

impl SyncRequest {
    /// Keep sync running after every request has finished, until the scope
    /// is cancelled.
    pub fn keep_sync_always_on(&self) {
        self.executor.inner.demand.send_if_modified(|demand| {
            if demand.always_on {
                false
            } else {
                tracing::info!("sync pinned always-on");
                demand.always_on = true;
                true
            }
        });
    }

    /// See [`SyncStateObserver::wait_until_live_or_failure`].
    pub async fn wait_until_live_or_failure(&self) -> Result<(), CoreFailure> {
        self.executor.observer().wait_until_live_or_failure().await
    }

    /// See [`SyncStateObserver::wait_until_started_or_failure`].
    pub async fn wait_until_started_or_failure(&self) -> Result<(), CoreFailure> {
        self.executor.observer().wait_until_started_or_failure().await
    }

    /// See [`SyncStateObserver::wait_until_or_failure`].
    pub async fn wait_until_or_failure(&self, target: SyncState) -> Result<(), CoreFailure> {
        self.executor.observer().wait_until_or_failure(target).await
    }
}

struct Subscription {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Subscription {
    async fn stop(self, name: &'static str) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!(task = name, error = %e, "subscription ended abnormally");
        }
    }
}

#[derive(Default)]
struct Subscriptions {
    slow: Option<Subscription>,
    incremental: Option<Subscription>,
}

async fn supervise(inner: Arc<ExecutorInner>) {
    let mut demand = inner.demand.subscribe();
    let mut slow_status = inner.observer.slow_sync_status();
    let mut state = ExecutorState::new();
    let mut subscriptions = Subscriptions::default();

    let complete = slow_status.borrow_and_update().is_complete();
    let needed = demand.borrow_and_update().needed();
    for event in [
        ExecutorEvent::SlowSyncStatusChanged { complete },
        ExecutorEvent::DemandChanged { needed },
    ] {
        state = step(&inner, state, event, &mut subscriptions).await;
    }

    loop {
        let event = tokio::select! {
            _ = inner.scope.cancelled() => ExecutorEvent::ShutdownRequested,
            changed = demand.changed() => match changed {
                Ok(()) => ExecutorEvent::DemandChanged {
                    needed: demand.borrow_and_update().needed(),
                },
                Err(_) => ExecutorEvent::ShutdownRequested,
            },
            changed = slow_status.changed() => match changed {
                Ok(()) => ExecutorEvent::SlowSyncStatusChanged {
                    complete: slow_status.borrow_and_update().is_complete(),
                },
                Err(_) => ExecutorEvent::ShutdownRequested,
            },
        };
        state = step(&inner, state, event, &mut subscriptions).await;
        if event == ExecutorEvent::ShutdownRequested {
            tracing::debug!("sync supervisor stopped");
            return;
        }
    }
}

async fn step(
    inner: &ExecutorInner,
    state: ExecutorState,
    event: ExecutorEvent,
    subscriptions: &mut Subscriptions,
) -> ExecutorState {
    let (next, actions) = state.on_event(event);
    if next != state {
        tracing::debug!(from = ?state, to = ?next, ?event, "executor state changed");
    }
    for action in actions {
        apply(inner, action, subscriptions).await;
    }
    next
}

async fn apply(inner: &ExecutorInner, action: ExecutorAction, subscriptions: &mut Subscriptions) {
    match action {
        ExecutorAction::StartSlowSync => {
            if subscriptions.slow.is_none() {
                subscriptions.slow = Some(subscribe(inner, "slow_sync", &inner.slow));
            }
        }
        ExecutorAction::StartIncrementalSync => {
            if subscriptions.incremental.is_none() {
                subscriptions.incremental =
                    Some(subscribe(inner, "incremental_sync", &inner.incremental));
            }
        }
        ExecutorAction::StopSlowSync => {
            if let Some(subscription) = subscriptions.slow.take() {
                subscription.stop("slow_sync").await;
            }
        }
        ExecutorAction::StopIncrementalSync => {
            if let Some(subscription) = subscriptions.incremental.take() {
                subscription.stop("incremental_sync").await;
            }
        }
    }
}

fn subscribe(
    inner: &ExecutorInner,
    name: &'static str,
    worker: &Arc<dyn SyncWorker>,
) -> Subscription {
    tracing::info!(task = name, "subscribing");
    let token = inner.scope.child_token();
    let handle = tokio::spawn(run_subscription(
        inner.exception_handler.clone(),
        name,
        token.clone(),
        Arc::clone(worker),
    ));
    Subscription { token, handle }
}

async fn run_subscription(
    handler: SyncExceptionHandler,
    name: &'static str,
    token: CancellationToken,
    worker: Arc<dyn SyncWorker>,
) {
    loop {
        let attempt = Arc::clone(&worker);
        let outcome = handler
            .run(name, token.clone(), async move { attempt.sync().await })
            .await;
        match outcome {
            TaskOutcome::Finished => {
                tracing::debug!(task = name, "sync task returned");
                return;
            }
            TaskOutcome::Cancelled => break,
            TaskOutcome::Failed(cause) => {
                let delay = worker.on_failure(cause).await;
                tracing::warn!(
                    task = name,
                    delay_ms = delay.as_millis() as u64,
                    "sync task failed, running it again"
                );
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    worker.on_cancelled().await;
}
