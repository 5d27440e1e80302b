//! # sync-client
//!
//! Runtime of the conversation sync core.
//!
//! This crate drives the pure logic of `convsync-core` with Tokio tasks:
//!
//! - **Slow sync**: ordered, resumable full download ([`SlowSyncManager`])
//! - **Incremental sync**: backlog plus live stream with deduplication
//!   ([`IncrementalSyncManager`], [`EventGatherer`])
//! - **Dispatch**: typed receivers and a durable checkpoint ([`EventProcessor`])
//! - **Demand**: request-scoped subscriptions ([`SyncExecutor`])
//! - **Observation**: derived [`SyncState`](convsync_core::SyncState)
//!   ([`SyncStateObserver`])
//!
//! ## Example
//!
//! ```ignore
//! use convsync_client::{SyncConfig, SyncDependencies, SyncEngine};
//!
//! let deps = SyncDependencies::new(feed.clone(), feed, store.clone(), store)
//!     .with_slow_sync_steps(steps)
//!     .with_receivers(receivers);
//! let engine = SyncEngine::start(&SyncConfig::default(), deps, scope).await?;
//!
//! engine
//!     .executor()
//!     .request(|sync| async move { sync.wait_until_live_or_failure().await })
//!     .await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod engine;
pub mod error;
pub mod exception;
pub mod executor;
pub mod gatherer;
pub mod incremental;
pub mod observer;
pub mod persistence;
pub mod processor;
pub mod recovery;
pub mod slow;
pub mod store;
pub mod transport;

pub use config::{ConfigError, SyncConfig, SLOW_SYNC_VERSION};
pub use engine::{SyncDependencies, SyncEngine};
pub use error::SyncError;
pub use exception::{SyncExceptionHandler, TaskOutcome};
pub use executor::{SyncExecutor, SyncRequest, SyncRequestGuard, SyncWorker};
pub use gatherer::{EventConsumer, EventGatherer, GatheringEnd};
pub use incremental::IncrementalSyncManager;
pub use observer::SyncStateObserver;
pub use persistence::{
    CheckpointStore, InMemoryMetadataStore, JsonFileMetadataStore, SlowSyncRecord,
    SlowSyncRecordStore,
};
pub use processor::{EventProcessor, EventReceiver, EventReceivers, IgnoringReceiver};
pub use recovery::{IncrementalSyncRecoveryHandler, RecoveryAction, RetryTrigger};
pub use slow::{SlowSyncManager, SlowSyncSettings, SlowSyncStepExecutor};
pub use store::{IncrementalSyncStatusStore, SlowSyncStatusStore};
pub use transport::{
    LiveEvent, LiveEventStream, LiveEventsSource, MockEventSource, PendingEventStream,
    PendingEventsSource,
};
