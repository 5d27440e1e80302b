//! Sync executor state machine.
//!
//! This module provides a pure, side-effect-free state machine deciding when
//! the slow and incremental sync managers must be subscribed. It takes events
//! as input and produces a new state plus a list of actions to execute.
//!
//! The actual task spawning and cancellation is performed by sync-client,
//! not by this module. This enables instant unit testing without a runtime.

/// Executor lifecycle - NO I/O, just state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    /// No consumer needs sync; nothing is subscribed.
    Idle {
        /// Last known slow-sync completeness, kept so a new demand can go
        /// straight to `Running`.
        slow_sync_complete: bool,
    },
    /// Slow sync subscribed, waiting for it to complete.
    Starting,
    /// Slow and incremental sync both subscribed.
    Running,
}

/// Inputs of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorEvent {
    /// Consumer demand changed (outstanding requests or always-on pin).
    DemandChanged {
        /// Whether at least one consumer needs sync.
        needed: bool,
    },
    /// The slow sync status changed.
    SlowSyncStatusChanged {
        /// Whether the new status is `Complete`.
        complete: bool,
    },
    /// The enclosing scope was cancelled.
    ShutdownRequested,
}

/// Actions the executor must perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorAction {
    /// Subscribe the slow sync manager.
    StartSlowSync,
    /// Cancel the slow sync subscription.
    StopSlowSync,
    /// Subscribe the incremental sync manager.
    StartIncrementalSync,
    /// Cancel the incremental sync subscription.
    StopIncrementalSync,
}

impl ExecutorState {
    /// Create a new state machine in the Idle state.
    pub fn new() -> Self {
        Self::Idle {
            slow_sync_complete: false,
        }
    }

    /// Process an event and return the new state plus actions to execute.
    ///
    /// This is a pure function - no side effects. The caller (sync-client)
    /// is responsible for executing the returned actions, in order.
    pub fn on_event(self, event: ExecutorEvent) -> (Self, Vec<ExecutorAction>) {
        use ExecutorAction::*;

        match (self, event) {
            // From Idle
            (Self::Idle { slow_sync_complete }, ExecutorEvent::DemandChanged { needed: true }) => {
                if slow_sync_complete {
                    (Self::Running, vec![StartSlowSync, StartIncrementalSync])
                } else {
                    (Self::Starting, vec![StartSlowSync])
                }
            }
            (Self::Idle { .. }, ExecutorEvent::SlowSyncStatusChanged { complete }) => (
                Self::Idle {
                    slow_sync_complete: complete,
                },
                vec![],
            ),
            (state @ Self::Idle { .. }, _) => (state, vec![]),

            // From Starting
            (Self::Starting, ExecutorEvent::SlowSyncStatusChanged { complete: true }) => {
                (Self::Running, vec![StartIncrementalSync])
            }
            (Self::Starting, ExecutorEvent::DemandChanged { needed: false })
            | (Self::Starting, ExecutorEvent::ShutdownRequested) => (
                Self::Idle {
                    slow_sync_complete: false,
                },
                vec![StopSlowSync],
            ),
            (Self::Starting, _) => (Self::Starting, vec![]),

            // From Running
            (Self::Running, ExecutorEvent::SlowSyncStatusChanged { complete: false }) => {
                (Self::Starting, vec![StopIncrementalSync])
            }
            (Self::Running, ExecutorEvent::DemandChanged { needed: false })
            | (Self::Running, ExecutorEvent::ShutdownRequested) => (
                Self::Idle {
                    slow_sync_complete: true,
                },
                vec![StopIncrementalSync, StopSlowSync],
            ),
            (Self::Running, _) => (Self::Running, vec![]),
        }
    }

    /// Whether the slow sync manager is subscribed in this state.
    pub fn slow_sync_active(&self) -> bool {
        !matches!(self, Self::Idle { .. })
    }

    /// Whether the incremental sync manager is subscribed in this state.
    pub fn incremental_sync_active(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl Default for ExecutorState {
    fn default() -> Self {
        Self::new()
    }
}
