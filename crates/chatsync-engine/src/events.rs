//! Events broadcast to subscribers of the synchronization manager

use chatsync_wire::Usage;
use serde::{Deserialize, Serialize};

use crate::message::{DisplayId, MessageRecord, MessageSnapshot};

/// Chat-level change notifications
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// A conversation was seen for the first time
    ConversationCreated { conversation_id: String },

    /// A turn began with the user's message
    TurnStarted {
        conversation_id: String,
        user_message: MessageRecord,
    },

    /// An in-flight message was created or changed
    SnapshotUpdated { snapshot: MessageSnapshot },

    /// A record was inserted or replaced in the conversation history
    MessagePlaced { record: MessageRecord },

    /// Cumulative usage changed
    UsageUpdated {
        conversation_id: String,
        usage: Usage,
    },

    /// The turn ended; `finalized` lists messages closed without a completion
    TurnFinished {
        conversation_id: String,
        finalized: Vec<DisplayId>,
    },

    /// Streaming stopped on request; partial content stays visible
    StreamingStopped { conversation_id: String },

    /// Error reported by the backend, a handler or the transport
    Error {
        conversation_id: String,
        display_id: Option<DisplayId>,
        message: String,
    },
}

impl SyncEvent {
    /// Conversation the event belongs to
    pub fn conversation_id(&self) -> &str {
        match self {
            SyncEvent::ConversationCreated { conversation_id }
            | SyncEvent::TurnStarted {
                conversation_id, ..
            }
            | SyncEvent::UsageUpdated {
                conversation_id, ..
            }
            | SyncEvent::TurnFinished {
                conversation_id, ..
            }
            | SyncEvent::StreamingStopped { conversation_id }
            | SyncEvent::Error {
                conversation_id, ..
            } => conversation_id,
            SyncEvent::SnapshotUpdated { snapshot } => &snapshot.conversation_id,
            SyncEvent::MessagePlaced { record } => &record.conversation_id,
        }
    }

    /// Check if this event ends a turn
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncEvent::TurnFinished { .. } | SyncEvent::StreamingStopped { .. }
        )
    }
}
