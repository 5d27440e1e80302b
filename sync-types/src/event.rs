//! Server-originated events.
//!
//! An [`Event`] is immutable once received. Full-value equality is what the
//! pending buffer uses for deduplication; the [`EventId`] is what the
//! checkpoint records.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{ConversationId, EventId, TeamId, UserId};

/// A single server event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Globally ordered server id.
    pub id: EventId,
    /// Unix timestamp (milliseconds) of delivery by the server.
    pub timestamp: u64,
    /// Transient events are dispatched but never advance the checkpoint.
    #[serde(default)]
    pub transient: bool,
    /// What happened.
    pub payload: EventPayload,
}

impl Event {
    /// Create a non-transient event stamped with the current time.
    pub fn new(id: EventId, payload: EventPayload) -> Self {
        Self {
            id,
            timestamp: now_millis(),
            transient: false,
            payload,
        }
    }

    /// Override the delivery timestamp.
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Mark the event as transient.
    pub fn into_transient(mut self) -> Self {
        self.transient = true;
        self
    }

    /// Receiver category of the payload.
    pub fn category(&self) -> EventCategory {
        self.payload.category()
    }

    /// What local state the event applies to.
    pub fn scope(&self) -> EventScope {
        match &self.payload {
            EventPayload::Conversation(event) => EventScope::Conversation(event.conversation_id),
            _ => EventScope::SelfUser,
        }
    }
}

/// Event payload, one variant per receiver category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum EventPayload {
    /// Conversation lifecycle and message events.
    Conversation(ConversationEvent),
    /// Self user and connection events.
    User(UserEvent),
    /// Account property changes.
    UserProperty(UserPropertyEvent),
    /// Backend feature configuration changes.
    FeatureConfig(FeatureConfigEvent),
    /// Team membership and metadata changes.
    Team(TeamEvent),
    /// An event type this client does not understand.
    Unknown {
        /// Server type tag, kept for logging.
        kind: String,
    },
}

impl EventPayload {
    /// Receiver category of this payload.
    pub fn category(&self) -> EventCategory {
        match self {
            EventPayload::Conversation(_) => EventCategory::Conversation,
            EventPayload::User(_) => EventCategory::User,
            EventPayload::UserProperty(_) => EventCategory::UserProperty,
            EventPayload::FeatureConfig(_) => EventCategory::FeatureConfig,
            EventPayload::Team(_) => EventCategory::Team,
            EventPayload::Unknown { .. } => EventCategory::Unknown,
        }
    }
}

/// Receiver categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    /// Conversation receiver.
    Conversation,
    /// User receiver.
    User,
    /// User property receiver.
    UserProperty,
    /// Feature config receiver.
    FeatureConfig,
    /// Team receiver.
    Team,
    /// No receiver; logged and skipped.
    Unknown,
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventCategory::Conversation => "conversation",
            EventCategory::User => "user",
            EventCategory::UserProperty => "user_property",
            EventCategory::FeatureConfig => "feature_config",
            EventCategory::Team => "team",
            EventCategory::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// The local state an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventScope {
    /// A single conversation.
    Conversation(ConversationId),
    /// The self user's account.
    SelfUser,
}

/// A conversation event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationEvent {
    /// Conversation the event belongs to.
    pub conversation_id: ConversationId,
    /// User that caused the event.
    pub sender: UserId,
    /// What happened in the conversation.
    pub kind: ConversationEventKind,
}

/// Kinds of conversation events.
///
/// Encrypted payloads are opaque bytes here; decryption belongs to the
/// receivers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationEventKind {
    /// Proteus-encrypted message.
    NewMessage {
        /// Sender client.
        sender_client: String,
        /// Ciphertext.
        content: Vec<u8>,
    },
    /// MLS application or commit message.
    NewMlsMessage {
        /// Ciphertext.
        content: Vec<u8>,
    },
    /// The conversation was created.
    NewConversation,
    /// Users joined.
    MemberJoin {
        /// Joined members.
        members: Vec<UserId>,
    },
    /// Users left or were removed.
    MemberLeave {
        /// Removed members.
        members: Vec<UserId>,
    },
    /// The conversation was renamed.
    Renamed {
        /// New name.
        name: String,
    },
    /// MLS welcome for a group the self client was added to.
    MlsWelcome {
        /// Welcome message bytes.
        message: Vec<u8>,
    },
    /// The conversation was deleted.
    Deleted,
    /// Read receipt mode changed.
    ReceiptModeChanged {
        /// Whether receipts are enabled.
        enabled: bool,
    },
    /// Self-deleting message timer changed.
    MessageTimerChanged {
        /// Timer in milliseconds; `None` disables it.
        timer_ms: Option<u64>,
    },
}

/// Self user and connection events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserEvent {
    /// Profile update of a known user.
    Update {
        /// Updated user.
        user_id: UserId,
        /// New display name, if changed.
        name: Option<String>,
    },
    /// A connection request or status change.
    NewConnection {
        /// Other side of the connection.
        user_id: UserId,
    },
    /// A client was registered for the self user.
    NewClient {
        /// Client id.
        client_id: String,
    },
    /// A client of the self user was removed.
    ClientRemove {
        /// Client id.
        client_id: String,
    },
    /// A user account was deleted.
    UserDelete {
        /// Deleted user.
        user_id: UserId,
    },
}

/// Account property events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserPropertyEvent {
    /// Read receipts toggled for the account.
    ReadReceiptModeSet {
        /// New value.
        enabled: bool,
    },
    /// Typing indicators toggled for the account.
    TypingIndicatorModeSet {
        /// New value.
        enabled: bool,
    },
}

/// Backend feature configuration events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeatureConfigEvent {
    /// File sharing toggled.
    FileSharingUpdated {
        /// New value.
        enabled: bool,
    },
    /// MLS toggled.
    MlsUpdated {
        /// New value.
        enabled: bool,
    },
    /// Conference calling toggled.
    ConferenceCallingUpdated {
        /// New value.
        enabled: bool,
    },
    /// A feature this client does not know.
    Unknown {
        /// Feature name.
        name: String,
    },
}

/// Team events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TeamEvent {
    /// Team metadata changed.
    Update {
        /// Team.
        team_id: TeamId,
        /// New name.
        name: String,
    },
    /// A member joined the team.
    MemberJoin {
        /// Team.
        team_id: TeamId,
        /// New member.
        user_id: UserId,
    },
    /// A member left the team.
    MemberLeave {
        /// Team.
        team_id: TeamId,
        /// Former member.
        user_id: UserId,
    },
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
