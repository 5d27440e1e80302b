//! Sync status types and the derived [`SyncState`].
//!
//! Two statuses are owned by the managers: [`SlowSyncStatus`] (persisted) and
//! [`IncrementalSyncStatus`] (in memory). [`SyncState`] is never stored; it is
//! always recomputed from the pair with [`SyncState::derive`].

use convsync_types::CoreFailure;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Ordered stages of a slow sync.
///
/// Only the ordering matters to the core; each stage is executed by an
/// injected step executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlowSyncStep {
    /// Fetch the self user.
    SelfUser,
    /// Fetch feature flags.
    FeatureFlags,
    /// Update the protocols this client supports.
    UpdateSupportedProtocols,
    /// Fetch all conversations.
    Conversations,
    /// Fetch connections.
    Connections,
    /// Fetch the self team.
    SelfTeam,
    /// Fetch contacts.
    Contacts,
    /// Join MLS conversations the client is not yet part of.
    JoiningMlsConversations,
    /// Resolve the protocol of one-on-one conversations.
    ResolveOneOnOneProtocols,
}

impl SlowSyncStep {
    /// All steps in execution order.
    pub const ALL: [SlowSyncStep; 9] = [
        SlowSyncStep::SelfUser,
        SlowSyncStep::FeatureFlags,
        SlowSyncStep::UpdateSupportedProtocols,
        SlowSyncStep::Conversations,
        SlowSyncStep::Connections,
        SlowSyncStep::SelfTeam,
        SlowSyncStep::Contacts,
        SlowSyncStep::JoiningMlsConversations,
        SlowSyncStep::ResolveOneOnOneProtocols,
    ];

    /// Stable name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            SlowSyncStep::SelfUser => "self_user",
            SlowSyncStep::FeatureFlags => "feature_flags",
            SlowSyncStep::UpdateSupportedProtocols => "update_supported_protocols",
            SlowSyncStep::Conversations => "conversations",
            SlowSyncStep::Connections => "connections",
            SlowSyncStep::SelfTeam => "self_team",
            SlowSyncStep::Contacts => "contacts",
            SlowSyncStep::JoiningMlsConversations => "joining_mls_conversations",
            SlowSyncStep::ResolveOneOnOneProtocols => "resolve_one_on_one_protocols",
        }
    }
}

/// Status of the slow (full) sync.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SlowSyncStatus {
    /// Not started.
    #[default]
    Pending,
    /// Running the given step.
    Ongoing {
        /// Step currently executing.
        step: SlowSyncStep,
    },
    /// All steps finished.
    Complete,
    /// A step failed; retried after `retry_delay`.
    Failed {
        /// Why it failed.
        cause: CoreFailure,
        /// Delay before the next attempt.
        retry_delay: Duration,
    },
}

impl SlowSyncStatus {
    /// Whether slow sync has completed.
    pub fn is_complete(&self) -> bool {
        matches!(self, SlowSyncStatus::Complete)
    }
}

/// Status of the incremental sync (event gathering).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum IncrementalSyncStatus {
    /// Not gathering, or connecting to the live stream.
    #[default]
    Pending,
    /// Live stream open, draining the backlog.
    FetchingPendingEvents,
    /// Backlog drained; events flow from the live stream.
    Live,
    /// Gathering failed; retried after `retry_delay`.
    Failed {
        /// Why it failed.
        cause: CoreFailure,
        /// Delay before the next attempt.
        retry_delay: Duration,
    },
}

/// Externally visible sync state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    /// Slow sync has not started.
    Waiting,
    /// Slow sync is running.
    SlowSync,
    /// Slow sync done, incremental sync connecting or draining the backlog.
    GatheringPendingEvents,
    /// Fully caught up and receiving live events.
    Live,
    /// One of the two syncs failed.
    Failed {
        /// Why it failed.
        cause: CoreFailure,
        /// Delay before the next attempt.
        retry_delay: Duration,
    },
}

impl SyncState {
    /// Derive the sync state from both statuses.
    ///
    /// A slow-sync failure wins over an incremental one. Without failures,
    /// the slow status decides until it is complete; after that the
    /// incremental status does.
    pub fn derive(slow: &SlowSyncStatus, incremental: &IncrementalSyncStatus) -> SyncState {
        if let SlowSyncStatus::Failed { cause, retry_delay } = slow {
            return SyncState::Failed {
                cause: cause.clone(),
                retry_delay: *retry_delay,
            };
        }
        if let IncrementalSyncStatus::Failed { cause, retry_delay } = incremental {
            return SyncState::Failed {
                cause: cause.clone(),
                retry_delay: *retry_delay,
            };
        }
        match slow {
            SlowSyncStatus::Pending => SyncState::Waiting,
            SlowSyncStatus::Ongoing { .. } => SyncState::SlowSync,
            _ => match incremental {
                IncrementalSyncStatus::Live => SyncState::Live,
                _ => SyncState::GatheringPendingEvents,
            },
        }
    }

    /// Same variant, ignoring failure details.
    pub fn same_kind(&self, other: &SyncState) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// The failure carried by this state, if any.
    pub fn failure(&self) -> Option<&CoreFailure> {
        match self {
            SyncState::Failed { cause, .. } => Some(cause),
            _ => None,
        }
    }
}

/// Whether the live stream stays open after the backlog is drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPolicy {
    /// Keep receiving live events.
    #[default]
    KeepAlive,
    /// Stop once pending events are processed (background fetch).
    DisconnectAfterPendingEvents,
}

/// Whether slow sync is allowed to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncCriteria {
    /// All requirements met.
    Ready,
    /// Something is missing, e.g. no registered client.
    MissingRequirement(String),
}

impl SyncCriteria {
    /// Whether slow sync may run.
    pub fn is_ready(&self) -> bool {
        matches!(self, SyncCriteria::Ready)
    }
}
