//! Persistence of sync metadata.
//!
//! Two pieces of state survive restarts: the event checkpoint
//! (`LastProcessedEventId`) and the slow sync record (status, completion
//! time, version). The storage schema belongs to the host application, so
//! both are traits; an in-memory and a JSON file implementation ship here.

use async_trait::async_trait;
use convsync_core::SlowSyncStatus;
use convsync_types::{CoreFailure, EventId};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Durable checkpoint of processed events.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// The id of the last durably applied event.
    async fn last_processed_event_id(&self) -> Result<Option<EventId>, CoreFailure>;

    /// Record `id` as the last durably applied event.
    async fn set_last_processed_event_id(&self, id: EventId) -> Result<(), CoreFailure>;

    /// Forget the checkpoint (recovery only).
    async fn clear_last_processed_event_id(&self) -> Result<(), CoreFailure>;
}

/// Persisted state of the slow sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlowSyncRecord {
    /// Last known status.
    #[serde(default)]
    pub status: SlowSyncStatus,
    /// Unix timestamp (seconds) of the last completed slow sync.
    #[serde(default)]
    pub last_completed_at: Option<u64>,
    /// Slow sync version of the last completed slow sync.
    #[serde(default)]
    pub version: Option<u32>,
}

/// Durable slow sync record.
#[async_trait]
pub trait SlowSyncRecordStore: Send + Sync {
    /// Load the record; a store that never saved one returns the default.
    async fn load_slow_sync_record(&self) -> Result<SlowSyncRecord, CoreFailure>;

    /// Replace the record.
    async fn save_slow_sync_record(&self, record: &SlowSyncRecord) -> Result<(), CoreFailure>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Metadata {
    #[serde(default)]
    slow_sync: SlowSyncRecord,
    #[serde(default)]
    last_processed_event_id: Option<EventId>,
}

/// In-memory metadata store.
///
/// Used when the host has no persistence and by tests, which can inject
/// write failures.
#[derive(Debug, Default, Clone)]
pub struct InMemoryMetadataStore {
    inner: Arc<Mutex<InMemoryInner>>,
}

#[derive(Debug, Default)]
struct InMemoryInner {
    metadata: Metadata,
    checkpoint_writes: Vec<EventId>,
    fail_next_checkpoint_write: Option<CoreFailure>,
}

impl InMemoryMetadataStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with a checkpoint already recorded.
    pub fn with_checkpoint(id: EventId) -> Self {
        let store = Self::default();
        store.lock().metadata.last_processed_event_id = Some(id);
        store
    }

    /// Create a store with a slow sync record already saved.
    pub fn with_slow_sync_record(record: SlowSyncRecord) -> Self {
        let store = Self::default();
        store.lock().metadata.slow_sync = record;
        store
    }

    /// Current checkpoint (snapshot).
    pub fn checkpoint(&self) -> Option<EventId> {
        self.lock().metadata.last_processed_event_id
    }

    /// Every checkpoint value written so far.
    pub fn checkpoint_writes(&self) -> Vec<EventId> {
        self.lock().checkpoint_writes.clone()
    }

    /// Current slow sync record (snapshot).
    pub fn slow_sync_record(&self) -> SlowSyncRecord {
        self.lock().metadata.slow_sync.clone()
    }

    /// Cause the next checkpoint write to fail.
    pub fn fail_next_checkpoint_write(&self, failure: CoreFailure) {
        self.lock().fail_next_checkpoint_write = Some(failure);
    }

    fn lock(&self) -> MutexGuard<'_, InMemoryInner> {
        // A panicking holder cannot leave the metadata half-updated.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl CheckpointStore for InMemoryMetadataStore {
    async fn last_processed_event_id(&self) -> Result<Option<EventId>, CoreFailure> {
        Ok(self.checkpoint())
    }

    async fn set_last_processed_event_id(&self, id: EventId) -> Result<(), CoreFailure> {
        let mut inner = self.lock();
        if let Some(failure) = inner.fail_next_checkpoint_write.take() {
            return Err(failure);
        }
        inner.metadata.last_processed_event_id = Some(id);
        inner.checkpoint_writes.push(id);
        Ok(())
    }

    async fn clear_last_processed_event_id(&self) -> Result<(), CoreFailure> {
        self.lock().metadata.last_processed_event_id = None;
        Ok(())
    }
}

#[async_trait]
impl SlowSyncRecordStore for InMemoryMetadataStore {
    async fn load_slow_sync_record(&self) -> Result<SlowSyncRecord, CoreFailure> {
        Ok(self.slow_sync_record())
    }

    async fn save_slow_sync_record(&self, record: &SlowSyncRecord) -> Result<(), CoreFailure> {
        self.lock().metadata.slow_sync = record.clone();
        Ok(())
    }
}

/// Metadata store backed by a single JSON document.
///
/// Writes go to a sibling temporary file which is then renamed over the
/// document, so a crash never leaves a half-written file behind.
#[derive(Debug)]
pub struct JsonFileMetadataStore {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl JsonFileMetadataStore {
    /// Use the document at `path`. The file is created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Location of the document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<Metadata, CoreFailure> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                CoreFailure::Storage(format!("corrupt metadata {}: {e}", self.path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Metadata::default()),
            Err(e) => Err(CoreFailure::Storage(format!(
                "failed to read {}: {e}",
                self.path.display()
            ))),
        }
    }

    async fn write(&self, metadata: &Metadata) -> Result<(), CoreFailure> {
        let bytes = serde_json::to_vec_pretty(metadata)
            .map_err(|e| CoreFailure::Storage(format!("failed to encode metadata: {e}")))?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await.map_err(|e| {
            CoreFailure::Storage(format!("failed to write {}: {e}", tmp.display()))
        })?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            CoreFailure::Storage(format!("failed to replace {}: {e}", self.path.display()))
        })
    }

    async fn update(&self, apply: impl FnOnce(&mut Metadata) + Send) -> Result<(), CoreFailure> {
        let _guard = self.lock.lock().await;
        let mut metadata = self.read().await?;
        apply(&mut metadata);
        self.write(&metadata).await
    }
}

#[async_trait]
impl CheckpointStore for JsonFileMetadataStore {
    async fn last_processed_event_id(&self) -> Result<Option<EventId>, CoreFailure> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.last_processed_event_id)
    }

    async fn set_last_processed_event_id(&self, id: EventId) -> Result<(), CoreFailure> {
        self.update(|m| m.last_processed_event_id = Some(id)).await
    }

    async fn clear_last_processed_event_id(&self) -> Result<(), CoreFailure> {
        self.update(|m| m.last_processed_event_id = None).await
    }
}

#[async_trait]
impl SlowSyncRecordStore for JsonFileMetadataStore {
    async fn load_slow_sync_record(&self) -> Result<SlowSyncRecord, CoreFailure> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.slow_sync)
    }

    async fn save_slow_sync_record(&self, record: &SlowSyncRecord) -> Result<(), CoreFailure> {
        let record = record.clone();
        self.update(move |m| m.slow_sync = record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convsync_core::SlowSyncStep;
    use std::time::Duration;

    #[tokio::test]
    async fn in_memory_checkpoint_roundtrip() {
        let store = InMemoryMetadataStore::new();
        assert_eq!(store.last_processed_event_id().await.unwrap(), None);

        store.set_last_processed_event_id(EventId::new(5)).await.unwrap();
        assert_eq!(
            store.last_processed_event_id().await.unwrap(),
            Some(EventId::new(5))
        );

        store.clear_last_processed_event_id().await.unwrap();
        assert_eq!(store.checkpoint(), None);
        assert_eq!(store.checkpoint_writes(), vec![EventId::new(5)]);
    }

    #[tokio::test]
    async fn in_memory_write_failure_is_one_shot() {
        let store = InMemoryMetadataStore::with_checkpoint(EventId::new(1));
        store.fail_next_checkpoint_write(CoreFailure::Storage("disk full".into()));

        assert!(store.set_last_processed_event_id(EventId::new(2)).await.is_err());
        assert_eq!(store.checkpoint(), Some(EventId::new(1)));

        store.set_last_processed_event_id(EventId::new(2)).await.unwrap();
        assert_eq!(store.checkpoint(), Some(EventId::new(2)));
    }

    #[tokio::test]
    async fn json_store_starts_empty_when_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileMetadataStore::new(dir.path().join("sync.json"));

        assert_eq!(store.last_processed_event_id().await.unwrap(), None);
        assert_eq!(
            store.load_slow_sync_record().await.unwrap(),
            SlowSyncRecord::default()
        );
    }

    #[tokio::test]
    async fn json_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.json");

        let record = SlowSyncRecord {
            status: SlowSyncStatus::Failed {
                cause: CoreFailure::NoNetworkConnection("offline".into()),
                retry_delay: Duration::from_secs(4),
            },
            last_completed_at: Some(1_700_000_000),
            version: Some(2),
        };
        {
            let store = JsonFileMetadataStore::new(&path);
            store.set_last_processed_event_id(EventId::new(77)).await.unwrap();
            store.save_slow_sync_record(&record).await.unwrap();
        }

        let reopened = JsonFileMetadataStore::new(&path);
        assert_eq!(
            reopened.last_processed_event_id().await.unwrap(),
            Some(EventId::new(77))
        );
        assert_eq!(reopened.load_slow_sync_record().await.unwrap(), record);
    }

    #[tokio::test]
    async fn json_store_updates_fields_independently() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileMetadataStore::new(dir.path().join("sync.json"));

        store.set_last_processed_event_id(EventId::new(3)).await.unwrap();
        store
            .save_slow_sync_record(&SlowSyncRecord {
                status: SlowSyncStatus::Ongoing {
                    step: SlowSyncStep::Contacts,
                },
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(
            store.last_processed_event_id().await.unwrap(),
            Some(EventId::new(3))
        );
    }

    #[tokio::test]
    async fn json_store_reports_corrupt_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.json");
        std::fs::write(&path, b"{not json").unwrap();

        let store = JsonFileMetadataStore::new(&path);
        let err = store.last_processed_event_id().await.unwrap_err();
        assert!(matches!(err, CoreFailure::Storage(_)));
    }
}
