//! Conversion of fetched history into message records

use async_trait::async_trait;
use chatsync_wire::{ChunkKind, HistoryMessage, RetrievalClient};
use parking_lot::Mutex;

use crate::error::Result;
use crate::handler::tools_aggregate::pair_calls;
use crate::manager::SyncManager;
use crate::message::{DisplayId, MessageRecord, RecordContent, Role};

/// Something that can fetch the stored history of a conversation
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn fetch_messages(&self, conversation_id: &str) -> chatsync_wire::Result<Vec<HistoryMessage>>;
}

#[async_trait]
impl HistorySource for RetrievalClient {
    async fn fetch_messages(&self, conversation_id: &str) -> chatsync_wire::Result<Vec<HistoryMessage>> {
        self.fetch_history(conversation_id).await
    }
}

/// Convert one stored message.
///
/// Assistant records get the same display id a live stream would give them,
/// so a history reload replaces streamed records instead of duplicating them.
pub fn to_record(conversation_id: &str, message: HistoryMessage) -> MessageRecord {
    match message {
        HistoryMessage::User {
            id,
            text,
            timestamp,
            sequence_number,
        } => MessageRecord::user(id, conversation_id, text, timestamp, sequence_number),
        HistoryMessage::Text {
            id,
            text,
            timestamp,
            sequence_number,
        } => assistant(
            DisplayId::derive(&id, ChunkKind::Text),
            conversation_id,
            timestamp,
            sequence_number,
            RecordContent::Text { text },
        ),
        HistoryMessage::Reasoning {
            id,
            reasoning,
            visible,
            timestamp,
            sequence_number,
        } => assistant(
            DisplayId::derive(&id, ChunkKind::Reasoning),
            conversation_id,
            timestamp,
            sequence_number,
            RecordContent::Reasoning {
                text: reasoning,
                visible,
            },
        ),
        HistoryMessage::ToolCall {
            id,
            tool_calls,
            timestamp,
            sequence_number,
        } => assistant(
            DisplayId::derive(&id, ChunkKind::ToolCall),
            conversation_id,
            timestamp,
            sequence_number,
            RecordContent::ToolCall { tool_calls },
        ),
        HistoryMessage::Tools {
            id,
            tool_calls,
            tool_results,
            timestamp,
            sequence_number,
        } => assistant(
            DisplayId::derive(&id, ChunkKind::ToolResult),
            conversation_id,
            timestamp,
            sequence_number,
            RecordContent::ToolsAggregate {
                pairs: pair_calls(tool_calls, tool_results),
            },
        ),
    }
}

fn assistant(
    id: DisplayId,
    conversation_id: &str,
    timestamp: i64,
    sequence_number: u64,
    content: RecordContent,
) -> MessageRecord {
    MessageRecord {
        id,
        conversation_id: conversation_id.to_string(),
        role: Role::Assistant,
        timestamp,
        sequence_number,
        content,
    }
}

/// Convert a whole history, keeping the stored order
pub fn to_records(conversation_id: &str, messages: Vec<HistoryMessage>) -> Vec<MessageRecord> {
    messages
        .into_iter()
        .map(|message| to_record(conversation_id, message))
        .collect()
}

/// Fetch a conversation's history and merge it into the manager.
///
/// The lock is only taken after the fetch completes. Returns the number of
/// records merged.
pub async fn sync_history(
    source: &dyn HistorySource,
    manager: &Mutex<SyncManager>,
    conversation_id: &str,
) -> Result<usize> {
    let messages = source.fetch_messages(conversation_id).await?;
    let records = to_records(conversation_id, messages);
    let count = records.len();
    tracing::debug!(conversation_id, count, "Loaded history");
    manager.lock().load_history(conversation_id, records);
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatsync_wire::{ToolCall, ToolResult};
    use serde_json::json;

    fn call(id: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: "search".to_string(),
            arguments: json!({"q": "rust"}),
        }
    }

    fn result(id: &str) -> ToolResult {
        ToolResult {
            tool_call_id: id.to_string(),
            tool_name: Some("search".to_string()),
            content: json!("found"),
            is_error: false,
        }
    }

    #[test]
    fn test_user_keeps_raw_id() {
        let record = to_record(
            "c1",
            HistoryMessage::User {
                id: "u1".to_string(),
                text: "hi".to_string(),
                timestamp: 5,
                sequence_number: 1,
            },
        );
        assert_eq!(record.id.as_str(), "u1");
        assert_eq!(record.role, Role::User);
        assert_eq!(record.text(), Some("hi"));
    }

    #[test]
    fn test_assistant_ids_match_streamed_ids() {
        let text = to_record(
            "c1",
            HistoryMessage::Text {
                id: "m1".to_string(),
                text: "Hello".to_string(),
                timestamp: 0,
                sequence_number: 2,
            },
        );
        assert_eq!(text.id, DisplayId::derive("m1", ChunkKind::Text));
        assert_eq!(text.role, Role::Assistant);

        let tools = to_record(
            "c1",
            HistoryMessage::Tools {
                id: "m1".to_string(),
                tool_calls: vec![call("t1")],
                tool_results: vec![result("t1")],
                timestamp: 0,
                sequence_number: 3,
            },
        );
        assert_eq!(tools.id, DisplayId::derive("m1", ChunkKind::ToolCallUpdate));
    }

    #[test]
    fn test_tools_pair_results_with_calls() {
        let record = to_record(
            "c1",
            HistoryMessage::Tools {
                id: "m2".to_string(),
                tool_calls: vec![call("t1"), call("t2")],
                tool_results: vec![result("t2"), result("t9")],
                timestamp: 0,
                sequence_number: 4,
            },
        );
        let RecordContent::ToolsAggregate { pairs } = record.content else {
            panic!("expected tools aggregate");
        };
        assert_eq!(pairs.len(), 3);
        assert!(pairs[0].result.is_none());
        assert_eq!(pairs[1].result.as_ref().unwrap().tool_call_id, "t2");
        // Orphan result keeps a placeholder call
        assert_eq!(pairs[2].call.id, "t9");
        assert!(pairs[2].call.arguments.is_null());
    }

    struct FixedHistory(Vec<HistoryMessage>);

    #[async_trait]
    impl HistorySource for FixedHistory {
        async fn fetch_messages(&self, _conversation_id: &str) -> chatsync_wire::Result<Vec<HistoryMessage>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_sync_history_merges_into_manager() {
        let source = FixedHistory(vec![
            HistoryMessage::Text {
                id: "m1".to_string(),
                text: "Hello".to_string(),
                timestamp: 0,
                sequence_number: 2,
            },
            HistoryMessage::User {
                id: "u1".to_string(),
                text: "hi".to_string(),
                timestamp: 0,
                sequence_number: 1,
            },
        ]);
        let manager = Mutex::new(SyncManager::default());

        let count = sync_history(&source, &manager, "c1").await.unwrap();
        assert_eq!(count, 2);

        // Loading twice replaces records in place
        sync_history(&source, &manager, "c1").await.unwrap();
        let manager = manager.lock();
        let conversation = manager.conversation("c1").unwrap();
        assert_eq!(conversation.messages.len(), 2);
        assert_eq!(conversation.messages[0].id.as_str(), "u1");
        assert_eq!(conversation.messages[1].text(), Some("Hello"));
    }
}
