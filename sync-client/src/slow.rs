//! Slow sync manager.
//!
//! Runs the injected step executors in step order, persisting
//! `Ongoing(step)` before each one so a restart resumes where it stopped.
//! A completed slow sync stays `Complete` until it is reset, its version is
//! outdated, or it is older than the configured maximum age.

use async_trait::async_trait;
use convsync_core::{BackoffPolicy, ExponentialBackoff, SlowSyncStatus, SlowSyncStep, SyncCriteria};
use convsync_types::CoreFailure;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;

use crate::error::SyncError;
use crate::executor::SyncWorker;
use crate::persistence::SlowSyncRecord;
use crate::recovery::{RecoveryAction, RetryTrigger};
use crate::store::SlowSyncStatusStore;

/// Executes one slow sync step.
#[async_trait]
pub trait SlowSyncStepExecutor: Send + Sync {
    /// The step this executor implements.
    fn step(&self) -> SlowSyncStep;

    /// Run the step to completion.
    async fn execute(&self) -> Result<(), CoreFailure>;
}

/// Slow sync tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlowSyncSettings {
    /// Version of the step set; a completion recorded with another version
    /// triggers a full re-run.
    pub version: u32,
    /// Completions older than this are re-run.
    pub max_age: Option<Duration>,
    /// Retry pacing.
    pub backoff: BackoffPolicy,
}

enum RunOutcome {
    Completed,
    CriteriaLost { index: usize },
    Failed { index: usize, cause: CoreFailure },
}

enum Freshness {
    Current { stale_in: Option<Duration> },
    Outdated(&'static str),
}

/// Sole writer of [`SlowSyncStatus`].
pub struct SlowSyncManager {
    steps: Vec<Arc<dyn SlowSyncStepExecutor>>,
    status: Arc<SlowSyncStatusStore>,
    criteria: watch::Receiver<SyncCriteria>,
    settings: SlowSyncSettings,
    backoff: Mutex<ExponentialBackoff>,
    interrupted: Mutex<Option<usize>>,
    retry: RetryTrigger,
}

impl SlowSyncManager {
    /// Create a manager. Steps are sorted into execution order.
    pub fn new(
        mut steps: Vec<Arc<dyn SlowSyncStepExecutor>>,
        status: Arc<SlowSyncStatusStore>,
        criteria: watch::Receiver<SyncCriteria>,
        settings: SlowSyncSettings,
        retry: RetryTrigger,
    ) -> Self {
        steps.sort_by_key(|executor| executor.step());
        Self {
            steps,
            status,
            criteria,
            backoff: Mutex::new(ExponentialBackoff::new(settings.backoff)),
            interrupted: Mutex::new(None),
            settings,
            retry,
        }
    }

    fn backoff(&self) -> MutexGuard<'_, ExponentialBackoff> {
        self.backoff
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Step index a crashed run stopped at.
    fn interrupted(&self) -> MutexGuard<'_, Option<usize>> {
        self.interrupted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn freshness(&self, record: &SlowSyncRecord) -> Freshness {
        if !record.status.is_complete() {
            return Freshness::Outdated("not complete");
        }
        if record.version != Some(self.settings.version) {
            return Freshness::Outdated("version changed");
        }
        let Some(max_age) = self.settings.max_age else {
            return Freshness::Current { stale_in: None };
        };
        let completed_at = record.last_completed_at.unwrap_or(0);
        let age = Duration::from_secs(unix_now().saturating_sub(completed_at));
        match max_age.checked_sub(age) {
            Some(remaining) if !remaining.is_zero() => Freshness::Current {
                stale_in: Some(remaining),
            },
            _ => Freshness::Outdated("completion too old"),
        }
    }

    /// Index of the first step to run.
    fn resume_index(&self, resume: Option<usize>) -> usize {
        if let Some(index) = resume {
            return index;
        }
        match self.status.current() {
            SlowSyncStatus::Ongoing { step } => self
                .steps
                .iter()
                .position(|executor| executor.step() >= step)
                .unwrap_or(self.steps.len()),
            _ => 0,
        }
    }

    async fn run_steps(
        &self,
        start: usize,
        criteria: &mut watch::Receiver<SyncCriteria>,
    ) -> RunOutcome {
        criteria.borrow_and_update();
        for (index, executor) in self.steps.iter().enumerate().skip(start) {
            let step = executor.step();
            if let Err(cause) = self.status.update(SlowSyncStatus::Ongoing { step }).await {
                return RunOutcome::Failed { index, cause };
            }
            tracing::info!(step = step.name(), "running slow sync step");

            let result = tokio::select! {
                result = executor.execute() => result,
                _ = criteria_lost(criteria) => {
                    tracing::warn!(
                        step = step.name(),
                        "sync criteria no longer met, aborting slow sync"
                    );
                    return RunOutcome::CriteriaLost { index };
                }
            };
            if let Err(cause) = result {
                tracing::warn!(step = step.name(), %cause, "slow sync step failed");
                return RunOutcome::Failed { index, cause };
            }
        }

        match self.status.mark_complete(self.settings.version).await {
            Ok(()) => RunOutcome::Completed,
            Err(cause) => RunOutcome::Failed {
                index: self.steps.len(),
                cause,
            },
        }
    }

    async fn publish(&self, status: SlowSyncStatus) {
        if let Err(e) = self.status.update(status).await {
            tracing::error!(error = %e, "failed to persist slow sync status");
        }
    }

    async fn wait_while_complete(
        &self,
        stale_in: Option<Duration>,
        criteria: &mut watch::Receiver<SyncCriteria>,
    ) -> Result<(), SyncError> {
        let mut status = self.status.subscribe();
        status.borrow_and_update();
        let stale = async {
            match stale_in {
                Some(delay) => tokio::time::sleep(delay).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            changed = status.changed() => changed
                .map_err(|_| SyncError::Internal("slow sync status store dropped".into())),
            changed = criteria.changed() => changed
                .map_err(|_| SyncError::Internal("sync criteria dropped".into())),
            _ = stale => Ok(()),
        }
    }
}

#[async_trait]
impl SyncWorker for SlowSyncManager {
    async fn sync(&self) -> Result<(), SyncError> {
        let mut criteria = self.criteria.clone();
        let mut retry = self.retry.subscribe();
        retry.borrow_and_update();
        let mut resume = self.interrupted().take();

        loop {
            if !criteria.borrow_and_update().is_ready() {
                tracing::info!("waiting for sync criteria");
                criteria
                    .wait_for(|c| c.is_ready())
                    .await
                    .map_err(|_| SyncError::Internal("sync criteria dropped".into()))?;
            }

            let record = self.status.record().await;
            match self.freshness(&record) {
                Freshness::Current { stale_in } => {
                    tracing::debug!("slow sync up to date");
                    self.wait_while_complete(stale_in, &mut criteria).await?;
                    continue;
                }
                Freshness::Outdated(reason) if record.status.is_complete() => {
                    tracing::info!(reason, "re-running slow sync");
                    resume = None;
                    self.publish(SlowSyncStatus::Pending).await;
                }
                Freshness::Outdated(_) => {}
            }

            let start = self.resume_index(resume);
            match self.run_steps(start, &mut criteria).await {
                RunOutcome::Completed => {
                    tracing::info!(version = self.settings.version, "slow sync complete");
                    self.backoff().reset();
                    resume = None;
                }
                RunOutcome::CriteriaLost { index } => {
                    resume = Some(index);
                    self.publish(SlowSyncStatus::Pending).await;
                }
                RunOutcome::Failed { index, cause } => {
                    resume = Some(index);
                    let action = RecoveryAction::for_failure(&cause);
                    if action == RecoveryAction::AwaitExternalRecovery {
                        tracing::warn!(%cause, "slow sync parked until retry or criteria change");
                        self.publish(SlowSyncStatus::Failed {
                            cause,
                            retry_delay: Duration::ZERO,
                        })
                        .await;
                        tokio::select! {
                            _ = retry_fired(&mut retry) => {}
                            _ = criteria.changed() => {}
                        }
                        self.backoff().reset();
                    } else {
                        let delay = self.backoff().next();
                        tracing::warn!(
                            %cause,
                            delay_ms = delay.as_millis() as u64,
                            "slow sync failed, retrying"
                        );
                        self.publish(SlowSyncStatus::Failed {
                            cause,
                            retry_delay: delay,
                        })
                        .await;
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = retry_fired(&mut retry) => self.backoff().reset(),
                        }
                    }
                }
            }
        }
    }

    async fn on_failure(&self, cause: CoreFailure) -> Duration {
        if let SlowSyncStatus::Ongoing { step } = self.status.current() {
            tracing::warn!(step = step.name(), "slow sync crashed during step");
            let index = self.resume_index(None);
            *self.interrupted() = Some(index);
        }
        let delay = self.backoff().next();
        self.publish(SlowSyncStatus::Failed {
            cause,
            retry_delay: delay,
        })
        .await;
        delay
    }
}

async fn criteria_lost(criteria: &mut watch::Receiver<SyncCriteria>) {
    loop {
        if criteria.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
        if !criteria.borrow_and_update().is_ready() {
            return;
        }
    }
}

async fn retry_fired(retry: &mut watch::Receiver<u64>) {
    if retry.changed().await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
