//! Observation of the combined sync state.
//!
//! [`SyncStateObserver`] derives [`SyncState`] from the two status streams.
//! A single combiner task owns the derived `watch` channel; waits read the
//! source statuses directly so they never lag behind the combiner.

use convsync_core::{IncrementalSyncStatus, SlowSyncStatus, SyncState};
use convsync_types::CoreFailure;
use tokio::sync::watch;

/// Read-only view of sync progress.
#[derive(Clone)]
pub struct SyncStateObserver {
    slow: watch::Receiver<SlowSyncStatus>,
    incremental: watch::Receiver<IncrementalSyncStatus>,
    state: watch::Receiver<SyncState>,
}

impl SyncStateObserver {
    /// Start observing the two status streams.
    ///
    /// Spawns the combiner task, so this must be called from within a Tokio
    /// runtime. The task exits once every clone of the observer is dropped or
    /// a status store goes away.
    pub fn new(
        slow: watch::Receiver<SlowSyncStatus>,
        incremental: watch::Receiver<IncrementalSyncStatus>,
    ) -> Self {
        let initial = SyncState::derive(&slow.borrow(), &incremental.borrow());
        let (state_tx, state) = watch::channel(initial);
        tokio::spawn(combine(slow.clone(), incremental.clone(), state_tx));
        Self {
            slow,
            incremental,
            state,
        }
    }

    /// Hot stream of the derived state, emitting only on change.
    pub fn sync_state(&self) -> watch::Receiver<SyncState> {
        self.state.clone()
    }

    /// The derived state right now.
    pub fn current_sync_state(&self) -> SyncState {
        SyncState::derive(&self.slow.borrow(), &self.incremental.borrow())
    }

    /// Wait until sync is live, or fail with the first failure seen.
    ///
    /// Returns immediately if slow sync has already failed.
    pub async fn wait_until_live_or_failure(&self) -> Result<(), CoreFailure> {
        self.wait_until_or_failure(SyncState::Live).await
    }

    /// Wait until slow sync has started (left `Pending`).
    ///
    /// Fails on slow-sync failure; incremental sync is never waited on.
    pub async fn wait_until_started_or_failure(&self) -> Result<(), CoreFailure> {
        self.wait_for(|slow, _| match slow {
            SlowSyncStatus::Pending => None,
            SlowSyncStatus::Failed { cause, .. } => Some(Err(cause.clone())),
            _ => Some(Ok(())),
        })
        .await
    }

    /// Wait until the derived state has the same variant as `target`, or a
    /// failure is derived.
    pub async fn wait_until_or_failure(&self, target: SyncState) -> Result<(), CoreFailure> {
        self.wait_for(move |slow, incremental| {
            let state = SyncState::derive(slow, incremental);
            if state.same_kind(&target) {
                return Some(Ok(()));
            }
            state.failure().cloned().map(Err)
        })
        .await
    }

    /// Whether a slow sync is running (snapshot).
    pub fn is_slow_sync_ongoing(&self) -> bool {
        matches!(*self.slow.borrow(), SlowSyncStatus::Ongoing { .. })
    }

    /// Whether slow sync has completed (snapshot).
    pub fn is_slow_sync_completed(&self) -> bool {
        self.slow.borrow().is_complete()
    }

    /// Read-only handle on the slow sync status.
    pub(crate) fn slow_sync_status(&self) -> watch::Receiver<SlowSyncStatus> {
        self.slow.clone()
    }

    async fn wait_for<F>(&self, mut check: F) -> Result<(), CoreFailure>
    where
        F: FnMut(&SlowSyncStatus, &IncrementalSyncStatus) -> Option<Result<(), CoreFailure>>,
    {
        let mut slow = self.slow.clone();
        let mut incremental = self.incremental.clone();
        loop {
            let verdict = {
                let slow_now = slow.borrow_and_update();
                let incremental_now = incremental.borrow_and_update();
                check(&*slow_now, &*incremental_now)
            };
            if let Some(result) = verdict {
                return result;
            }
            let changed = tokio::select! {
                changed = slow.changed() => changed,
                changed = incremental.changed() => changed,
            };
            if changed.is_err() {
                return Err(CoreFailure::Unknown("sync status store dropped".into()));
            }
        }
    }
}

async fn combine(
    mut slow: watch::Receiver<SlowSyncStatus>,
    mut incremental: watch::Receiver<IncrementalSyncStatus>,
    state_tx: watch::Sender<SyncState>,
) {
    loop {
        let changed = tokio::select! {
            changed = slow.changed() => changed,
            changed = incremental.changed() => changed,
            _ = state_tx.closed() => return,
        };
        if changed.is_err() {
            tracing::debug!("status store dropped, stopping sync state combiner");
            return;
        }
        let derived =
            SyncState::derive(&slow.borrow_and_update(), &incremental.borrow_and_update());
        state_tx.send_if_modified(|current| {
            if *current == derived {
                false
            } else {
                tracing::debug!(from = ?current, to = ?derived, "sync state changed");
                *current = derived;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convsync_core::SlowSyncStep;
    use std::time::Duration;

    struct Harness {
        slow: watch::Sender<SlowSyncStatus>,
        incremental: watch::Sender<IncrementalSyncStatus>,
        observer: SyncStateObserver,
    }

    fn harness() -> Harness {
        let (slow, slow_rx) = watch::channel(SlowSyncStatus::Pending);
        let (incremental, incremental_rx) = watch::channel(IncrementalSyncStatus::Pending);
        Harness {
            observer: SyncStateObserver::new(slow_rx, incremental_rx),
            slow,
            incremental,
        }
    }

    fn failed(cause: CoreFailure) -> SlowSyncStatus {
        SlowSyncStatus::Failed {
            cause,
            retry_delay: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn initial_state_is_waiting() {
        let h = harness();
        assert_eq!(*h.observer.sync_state().borrow(), SyncState::Waiting);
        assert_eq!(h.observer.current_sync_state(), SyncState::Waiting);
    }

    #[tokio::test]
    async fn sync_state_stream_follows_statuses() {
        let h = harness();
        let mut states = h.observer.sync_state();

        h.slow.send_replace(SlowSyncStatus::Ongoing {
            step: SlowSyncStep::SelfUser,
        });
        states.changed().await.unwrap();
        assert_eq!(*states.borrow_and_update(), SyncState::SlowSync);

        h.slow.send_replace(SlowSyncStatus::Complete);
        states.changed().await.unwrap();
        assert_eq!(
            *states.borrow_and_update(),
            SyncState::GatheringPendingEvents
        );

        h.incremental.send_replace(IncrementalSyncStatus::Live);
        states.changed().await.unwrap();
        assert_eq!(*states.borrow_and_update(), SyncState::Live);
    }

    #[tokio::test]
    async fn wait_until_live_fails_immediately_on_slow_failure() {
        let h = harness();
        h.slow
            .send_replace(failed(CoreFailure::MissingClientRegistration));

        let result = h.observer.wait_until_live_or_failure().await;

        assert_eq!(result, Err(CoreFailure::MissingClientRegistration));
    }

    #[tokio::test]
    async fn wait_until_live_completes_when_live() {
        let h = harness();
        let observer = h.observer.clone();
        let waiter = tokio::spawn(async move { observer.wait_until_live_or_failure().await });

        h.slow.send_replace(SlowSyncStatus::Complete);
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        h.incremental.send_replace(IncrementalSyncStatus::Live);
        assert_eq!(waiter.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn wait_until_live_fails_on_incremental_failure() {
        let h = harness();
        h.slow.send_replace(SlowSyncStatus::Complete);
        h.incremental.send_replace(IncrementalSyncStatus::Failed {
            cause: CoreFailure::NoNetworkConnection("offline".into()),
            retry_delay: Duration::from_secs(2),
        });

        let result = h.observer.wait_until_live_or_failure().await;

        assert!(matches!(result, Err(CoreFailure::NoNetworkConnection(_))));
    }

    #[tokio::test]
    async fn wait_until_started_succeeds_on_ongoing_or_complete() {
        let h = harness();
        h.slow.send_replace(SlowSyncStatus::Ongoing {
            step: SlowSyncStep::FeatureFlags,
        });
        assert_eq!(h.observer.wait_until_started_or_failure().await, Ok(()));

        h.slow.send_replace(SlowSyncStatus::Complete);
        assert_eq!(h.observer.wait_until_started_or_failure().await, Ok(()));
    }

    #[tokio::test]
    async fn wait_until_started_ignores_incremental_failure() {
        let h = harness();
        h.incremental.send_replace(IncrementalSyncStatus::Failed {
            cause: CoreFailure::Unknown("x".into()),
            retry_delay: Duration::ZERO,
        });
        let observer = h.observer.clone();
        let waiter = tokio::spawn(async move { observer.wait_until_started_or_failure().await });

        tokio::task::yield_now().await;
        h.slow.send_replace(SlowSyncStatus::Ongoing {
            step: SlowSyncStep::SelfUser,
        });

        assert_eq!(waiter.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn wait_until_started_fails_on_slow_failure() {
        let h = harness();
        h.slow.send_replace(failed(CoreFailure::SessionExpired));
        assert_eq!(
            h.observer.wait_until_started_or_failure().await,
            Err(CoreFailure::SessionExpired)
        );
    }

    #[tokio::test]
    async fn wait_until_or_failure_matches_variant() {
        let h = harness();
        h.slow.send_replace(SlowSyncStatus::Complete);
        assert_eq!(
            h.observer
                .wait_until_or_failure(SyncState::GatheringPendingEvents)
                .await,
            Ok(())
        );
    }

    #[tokio::test]
    async fn dropping_a_wait_has_no_side_effects() {
        let h = harness();
        let pending = tokio::time::timeout(
            Duration::from_millis(20),
            h.observer.wait_until_live_or_failure(),
        )
        .await;
        assert!(pending.is_err());

        h.slow.send_replace(SlowSyncStatus::Complete);
        h.incremental.send_replace(IncrementalSyncStatus::Live);
        assert_eq!(h.observer.wait_until_live_or_failure().await, Ok(()));
    }

    #[tokio::test]
    async fn snapshot_reads() {
        let h = harness();
        assert!(!h.observer.is_slow_sync_ongoing());
        assert!(!h.observer.is_slow_sync_completed());

        h.slow.send_replace(SlowSyncStatus::Ongoing {
            step: SlowSyncStep::Contacts,
        });
        assert!(h.observer.is_slow_sync_ongoing());

        h.slow.send_replace(SlowSyncStatus::Complete);
        assert!(h.observer.is_slow_sync_completed());
        assert!(!h.observer.is_slow_sync_ongoing());
    }
}
