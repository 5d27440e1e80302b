//! # sync-core
//!
//! Pure logic for the conversation sync core (no I/O, instant tests).
//!
//! This crate implements the state machines and algorithms for sync
//! without any network or disk I/O, enabling fast unit tests.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about state transitions
//!
//! The actual I/O (network, disk, tasks) is performed by `sync-client`, which
//! interprets the actions produced by these state machines.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod buffer;
pub mod checkpoint;
pub mod state;
pub mod status;

pub use backoff::{BackoffPolicy, ExponentialBackoff};
pub use buffer::PendingEventsBuffer;
pub use checkpoint::{CheckpointError, CheckpointTracker};
pub use state::{ExecutorAction, ExecutorEvent, ExecutorState};
pub use status::{
    ConnectionPolicy, IncrementalSyncStatus, SlowSyncStatus, SlowSyncStep, SyncCriteria,
    SyncState,
};
