//! Conversation state: ordered messages, streaming status, error slot and usage.

use chatsync_wire::Usage;
use serde::{Deserialize, Serialize};

use crate::message::{DisplayId, MessageRecord};

/// Where a conversation is in its turn lifecycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    #[default]
    Idle,
    TurnActive,
}

/// Last error reported for a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationError {
    pub message: String,
    pub code: Option<String>,
    /// Milliseconds since the epoch
    pub timestamp: i64,
}

/// A conversation as the UI sees it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    /// Records ordered by sequence number; ties keep arrival order
    pub messages: Vec<MessageRecord>,
    /// Milliseconds since the epoch of the last change
    pub updated_at: i64,
    /// Whether a turn is currently streaming
    pub streaming: bool,
    pub phase: TurnPhase,
    pub error: Option<ConversationError>,
    /// Cumulative usage across turns
    pub usage: Usage,
}

impl Conversation {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            updated_at: chrono::Utc::now().timestamp_millis(),
            ..Default::default()
        }
    }

    /// Whether a record with this id exists
    pub fn contains(&self, id: &DisplayId) -> bool {
        self.messages.iter().any(|m| m.id == *id)
    }

    /// Record by id
    pub fn message(&self, id: &DisplayId) -> Option<&MessageRecord> {
        self.messages.iter().find(|m| m.id == *id)
    }

    /// Insert a record, or replace the record with the same id.
    ///
    /// A replacement that keeps its sequence number stays in place. Otherwise
    /// the record moves after every record with a sequence number less than or
    /// equal to its own, which keeps equal numbers in arrival order.
    pub fn upsert(&mut self, record: MessageRecord) {
        self.updated_at = chrono::Utc::now().timestamp_millis();

        if let Some(pos) = self.messages.iter().position(|m| m.id == record.id) {
            if self.messages[pos].sequence_number == record.sequence_number {
                self.messages[pos] = record;
                return;
            }
            self.messages.remove(pos);
        }

        let at = self
            .messages
            .partition_point(|m| m.sequence_number <= record.sequence_number);
        self.messages.insert(at, record);
    }

    /// Highest sequence number among the records
    pub fn max_sequence(&self) -> Option<u64> {
        self.messages.iter().map(|m| m.sequence_number).max()
    }

    /// Record an error and stop streaming
    pub fn set_error(&mut self, message: impl Into<String>, code: Option<String>) {
        let now = chrono::Utc::now().timestamp_millis();
        self.error = Some(ConversationError {
            message: message.into(),
            code,
            timestamp: now,
        });
        self.streaming = false;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{RecordContent, Role};

    fn record(id: &str, seq: u64, text: &str) -> MessageRecord {
        MessageRecord {
            id: DisplayId::new(id),
            conversation_id: "c1".into(),
            role: Role::Assistant,
            timestamp: 0,
            sequence_number: seq,
            content: RecordContent::Text { text: text.into() },
        }
    }

    fn ids(conversation: &Conversation) -> Vec<&str> {
        conversation.messages.iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn test_upsert_orders_by_sequence() {
        let mut conversation = Conversation::new("c1");
        conversation.upsert(record("b", 2, ""));
        conversation.upsert(record("a", 1, ""));
        conversation.upsert(record("c", 3, ""));
        assert_eq!(ids(&conversation), ["a", "b", "c"]);
    }

    #[test]
    fn test_upsert_ties_keep_arrival_order() {
        let mut conversation = Conversation::new("c1");
        conversation.upsert(record("x", 5, ""));
        conversation.upsert(record("y", 5, ""));
        conversation.upsert(record("z", 5, ""));
        assert_eq!(ids(&conversation), ["x", "y", "z"]);
    }

    #[test]
    fn test_upsert_replaces_in_place() {
        let mut conversation = Conversation::new("c1");
        conversation.upsert(record("a", 1, "old"));
        conversation.upsert(record("b", 1, ""));
        conversation.upsert(record("a", 1, "new"));
        assert_eq!(ids(&conversation), ["a", "b"]);
        assert_eq!(conversation.messages[0].text(), Some("new"));
    }

    #[test]
    fn test_upsert_repositions_on_new_sequence() {
        let mut conversation = Conversation::new("c1");
        conversation.upsert(record("a", 4, ""));
        conversation.upsert(record("b", 5, ""));
        conversation.upsert(record("c", 6, ""));
        conversation.upsert(record("a", 7, ""));
        assert_eq!(ids(&conversation), ["b", "c", "a"]);
        assert_eq!(conversation.max_sequence(), Some(7));
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let mut conversation = Conversation::new("c1");
        conversation.upsert(record("a", 1, "hi"));
        let before = conversation.messages.clone();
        conversation.upsert(record("a", 1, "hi"));
        assert_eq!(conversation.messages, before);
    }

    #[test]
    fn test_set_error_stops_streaming() {
        let mut conversation = Conversation::new("c1");
        conversation.streaming = true;
        conversation.set_error("boom", Some("500".into()));
        assert!(!conversation.streaming);
        assert_eq!(conversation.error.as_ref().unwrap().message, "boom");
    }
}
