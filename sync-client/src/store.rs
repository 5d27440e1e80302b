//! Status stores.
//!
//! Each status has exactly one writer: the slow sync store is owned by the
//! [`SlowSyncManager`](crate::SlowSyncManager) and the incremental store by
//! the [`IncrementalSyncManager`](crate::IncrementalSyncManager). Every other
//! component gets a `watch::Receiver`, which is read-only by construction.
//!
//! Both stores emit only on change.

use convsync_core::{ConnectionPolicy, IncrementalSyncStatus, SlowSyncStatus};
use convsync_types::CoreFailure;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{watch, Mutex};

use crate::persistence::{InMemoryMetadataStore, SlowSyncRecord, SlowSyncRecordStore};

/// Persisted slow sync status plus completion metadata.
pub struct SlowSyncStatusStore {
    backend: Arc<dyn SlowSyncRecordStore>,
    record: Mutex<SlowSyncRecord>,
    status_tx: watch::Sender<SlowSyncStatus>,
}

impl SlowSyncStatusStore {
    /// Load the persisted record from `backend`.
    pub async fn load(backend: Arc<dyn SlowSyncRecordStore>) -> Result<Self, CoreFailure> {
        let record = backend.load_slow_sync_record().await?;
        tracing::debug!(status = ?record.status, "loaded slow sync record");
        let (status_tx, _) = watch::channel(record.status.clone());
        Ok(Self {
            backend,
            record: Mutex::new(record),
            status_tx,
        })
    }

    /// A store without durable persistence.
    pub fn in_memory() -> Self {
        let (status_tx, _) = watch::channel(SlowSyncStatus::Pending);
        Self {
            backend: Arc::new(InMemoryMetadataStore::new()),
            record: Mutex::new(SlowSyncRecord::default()),
            status_tx,
        }
    }

    /// Read-only handle on the status stream.
    pub fn subscribe(&self) -> watch::Receiver<SlowSyncStatus> {
        self.status_tx.subscribe()
    }

    /// Current status (snapshot).
    pub fn current(&self) -> SlowSyncStatus {
        self.status_tx.borrow().clone()
    }

    /// Persist and publish a new status.
    pub async fn update(&self, status: SlowSyncStatus) -> Result<(), CoreFailure> {
        let mut record = self.record.lock().await;
        if record.status == status {
            return Ok(());
        }
        let mut next = record.clone();
        next.status = status;
        self.persist(&mut record, next).await
    }

    /// Mark slow sync complete and record when and with which version.
    pub async fn mark_complete(&self, version: u32) -> Result<(), CoreFailure> {
        let mut record = self.record.lock().await;
        let next = SlowSyncRecord {
            status: SlowSyncStatus::Complete,
            last_completed_at: Some(unix_now()),
            version: Some(version),
        };
        self.persist(&mut record, next).await
    }

    /// Explicit reset: back to `Pending`, forgetting the last completion.
    ///
    /// Forces a full slow sync on the next subscription.
    pub async fn reset(&self) -> Result<(), CoreFailure> {
        let mut record = self.record.lock().await;
        let next = SlowSyncRecord {
            status: SlowSyncStatus::Pending,
            last_completed_at: None,
            version: record.version,
        };
        tracing::info!("slow sync reset requested");
        self.persist(&mut record, next).await
    }

    /// Snapshot of the persisted record.
    pub async fn record(&self) -> SlowSyncRecord {
        self.record.lock().await.clone()
    }

    async fn persist(
        &self,
        record: &mut SlowSyncRecord,
        next: SlowSyncRecord,
    ) -> Result<(), CoreFailure> {
        self.backend.save_slow_sync_record(&next).await?;
        let status = next.status.clone();
        *record = next;
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        Ok(())
    }
}

/// In-memory incremental sync status and connection policy.
pub struct IncrementalSyncStatusStore {
    status_tx: watch::Sender<IncrementalSyncStatus>,
    policy_tx: watch::Sender<ConnectionPolicy>,
}

impl IncrementalSyncStatusStore {
    /// Create a store in `Pending` with the given policy.
    pub fn new(policy: ConnectionPolicy) -> Self {
        let (status_tx, _) = watch::channel(IncrementalSyncStatus::Pending);
        let (policy_tx, _) = watch::channel(policy);
        Self {
            status_tx,
            policy_tx,
        }
    }

    /// Read-only handle on the status stream.
    pub fn subscribe(&self) -> watch::Receiver<IncrementalSyncStatus> {
        self.status_tx.subscribe()
    }

    /// Current status (snapshot).
    pub fn current(&self) -> IncrementalSyncStatus {
        self.status_tx.borrow().clone()
    }

    /// Publish a new status. No-op if unchanged.
    pub fn update(&self, status: IncrementalSyncStatus) {
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                tracing::debug!(from = ?current, to = ?status, "incremental sync status changed");
                *current = status;
                true
            }
        });
    }

    /// Change the connection policy.
    pub fn set_connection_policy(&self, policy: ConnectionPolicy) {
        self.policy_tx.send_if_modified(|current| {
            if *current == policy {
                false
            } else {
                tracing::info!(?policy, "connection policy changed");
                *current = policy;
                true
            }
        });
    }

    /// Current connection policy.
    pub fn connection_policy(&self) -> ConnectionPolicy {
        *self.policy_tx.borrow()
    }

    /// Read-only handle on the connection policy.
    pub fn subscribe_connection_policy(&self) -> watch::Receiver<ConnectionPolicy> {
        self.policy_tx.subscribe()
    }
}

impl Default for IncrementalSyncStatusStore {
    fn default() -> Self {
        Self::new(ConnectionPolicy::KeepAlive)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
