//! Tool-call messages: the model asking for one or more tools to run

use chatsync_wire::{MessageComplete, StreamChunk, ToolCall, ToolCallUpdate};

use super::{
    HandlerContext, HandlerError, HandlerEvent, MessageHandler, SnapshotStore, record_for,
};
use crate::message::{
    DisplayId, MessageKind, MessageRecord, MessageSnapshot, RecordContent, SnapshotContent,
    ToolCallDraft, locate_draft,
};

fn empty() -> SnapshotContent {
    SnapshotContent::ToolCall { calls: Vec::new() }
}

fn merge_update(drafts: &mut Vec<ToolCallDraft>, update: &ToolCallUpdate) {
    match locate_draft(drafts.iter(), |d| d, update) {
        Some(pos) => drafts[pos].apply(update),
        None => {
            let mut draft = ToolCallDraft::new(update.index.unwrap_or(drafts.len()));
            draft.apply(update);
            drafts.push(draft);
        }
    }
}

/// Finish every draft, collecting argument parse errors
fn finish_drafts(drafts: &[ToolCallDraft]) -> (Vec<ToolCall>, Vec<String>) {
    let mut errors = Vec::new();
    let calls = drafts
        .iter()
        .map(|draft| {
            let (call, error) = draft.finish();
            errors.extend(error);
            call
        })
        .collect();
    (calls, errors)
}

/// Builds tool calls from streamed argument fragments.
///
/// Tool-call messages may be seen for the first time through a chunk, so the
/// handler initializes lazily.
#[derive(Debug, Default)]
pub struct ToolCallHandler {
    store: SnapshotStore,
}

impl ToolCallHandler {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(
        &mut self,
        display_id: &DisplayId,
        calls: Vec<ToolCall>,
        errors: Vec<String>,
        sequence_number: Option<u64>,
    ) -> Option<MessageRecord> {
        let snapshot = self.store.get(display_id)?.clone();
        for error in errors {
            tracing::warn!(message_id = %display_id, "{}", error);
            self.store.error(&snapshot, error);
        }
        let record = record_for(
            &snapshot,
            sequence_number.unwrap_or(snapshot.sequence_number),
            RecordContent::ToolCall { tool_calls: calls },
        );
        Some(self.store.completed(record))
    }
}

impl MessageHandler for ToolCallHandler {
    fn kind(&self) -> MessageKind {
        MessageKind::ToolCall
    }

    fn supports_lazy_init(&self) -> bool {
        true
    }

    fn initialize(&mut self, display_id: &DisplayId, ctx: &HandlerContext) -> MessageSnapshot {
        self.store.create(display_id, ctx, empty())
    }

    fn process_chunk(
        &mut self,
        display_id: &DisplayId,
        chunk: &StreamChunk,
        ctx: &HandlerContext,
    ) -> Result<MessageSnapshot, HandlerError> {
        let snapshot = self.store.for_chunk(display_id, ctx, Some(empty))?;
        if let (SnapshotContent::ToolCall { calls }, Some(update)) =
            (&mut snapshot.content, &chunk.payload.tool_call_update)
        {
            merge_update(calls, update);
        }
        self.store
            .updated(display_id)
            .ok_or_else(|| HandlerError::NotInitialized(display_id.clone()))
    }

    fn complete_message(
        &mut self,
        display_id: &DisplayId,
        complete: &MessageComplete,
        ctx: &HandlerContext,
    ) -> Result<MessageRecord, HandlerError> {
        let snapshot = self.store.for_completion(display_id, ctx, empty);
        let (calls, errors) = match &complete.final_payload.tool_calls {
            Some(calls) => (calls.clone(), Vec::new()),
            None => match &snapshot.content {
                SnapshotContent::ToolCall { calls } => finish_drafts(calls),
                _ => (Vec::new(), Vec::new()),
            },
        };
        snapshot.content = SnapshotContent::ToolCall {
            calls: calls
                .iter()
                .enumerate()
                .map(|(i, call)| ToolCallDraft::from_call(i, call))
                .collect(),
        };
        self.record(display_id, calls, errors, Some(complete.sequence_id))
            .ok_or_else(|| HandlerError::NotInitialized(display_id.clone()))
    }

    fn finalize_message(&mut self, display_id: &DisplayId) -> Option<MessageRecord> {
        let (calls, errors) = match &self.store.for_finalize(display_id)?.content {
            SnapshotContent::ToolCall { calls } => finish_drafts(calls),
            _ => (Vec::new(), Vec::new()),
        };
        self.record(display_id, calls, errors, None)
    }

    fn snapshot(&self, display_id: &DisplayId) -> Option<&MessageSnapshot> {
        self.store.get(display_id)
    }

    fn release(&mut self, conversation_id: &str) {
        self.store.release(conversation_id);
    }

    fn drain_events(&mut self) -> Vec<HandlerEvent> {
        self.store.drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::test_support::{chunk, complete, ctx};
    use chatsync_wire::{ChunkKind, ChunkPayload, FinalPayload};
    use serde_json::json;

    fn id() -> DisplayId {
        DisplayId::derive("m2", ChunkKind::ToolCall)
    }

    fn update(index: usize, id: Option<&str>, name: Option<&str>, args: &str) -> StreamChunk {
        chunk(
            "m2",
            ChunkKind::ToolCall,
            ChunkPayload {
                tool_call_update: Some(ToolCallUpdate {
                    index: Some(index),
                    id: id.map(str::to_string),
                    name: name.map(str::to_string),
                    arguments_delta: Some(args.to_string()),
                }),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_lazy_init_on_first_chunk() {
        let mut handler = ToolCallHandler::new();
        assert!(handler.supports_lazy_init());
        let snapshot = handler
            .process_chunk(&id(), &update(0, Some("t1"), Some("search"), "{\"q\""), &ctx(4))
            .unwrap();
        assert_eq!(snapshot.sequence_number, 4);

        let events = handler.drain_events();
        assert!(matches!(events[0], HandlerEvent::Created(_)));
        assert!(matches!(events[1], HandlerEvent::Updated(_)));
    }

    #[test]
    fn test_fragments_complete_into_calls() {
        let mut handler = ToolCallHandler::new();
        handler
            .process_chunk(&id(), &update(0, Some("t1"), Some("search"), "{\"q\":"), &ctx(1))
            .unwrap();
        handler
            .process_chunk(&id(), &update(1, Some("t2"), Some("read"), "{}"), &ctx(1))
            .unwrap();
        handler
            .process_chunk(&id(), &update(0, None, None, "\"rust\"}"), &ctx(1))
            .unwrap();

        let record = handler
            .complete_message(
                &id(),
                &complete("m2", ChunkKind::ToolCall, 6, FinalPayload::default()),
                &ctx(6),
            )
            .unwrap();
        match record.content {
            RecordContent::ToolCall { tool_calls } => {
                assert_eq!(tool_calls.len(), 2);
                assert_eq!(tool_calls[0].arguments, json!({"q": "rust"}));
                assert_eq!(tool_calls[1].name, "read");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_final_calls_win() {
        let mut handler = ToolCallHandler::new();
        handler
            .process_chunk(&id(), &update(0, Some("t1"), Some("search"), "{\"q\":"), &ctx(1))
            .unwrap();
        let final_calls = vec![ToolCall {
            id: "t1".into(),
            name: "search".into(),
            arguments: json!({"q": "final"}),
        }];
        let record = handler
            .complete_message(
                &id(),
                &complete(
                    "m2",
                    ChunkKind::ToolCall,
                    2,
                    FinalPayload {
                        tool_calls: Some(final_calls.clone()),
                        ..Default::default()
                    },
                ),
                &ctx(2),
            )
            .unwrap();
        assert_eq!(
            record.content,
            RecordContent::ToolCall {
                tool_calls: final_calls
            }
        );
        assert!(
            !handler
                .drain_events()
                .iter()
                .any(|e| matches!(e, HandlerEvent::Error { .. }))
        );
    }

    #[test]
    fn test_unparseable_arguments_emit_error() {
        let mut handler = ToolCallHandler::new();
        handler
            .process_chunk(&id(), &update(0, Some("t1"), Some("search"), "{\"q\": tru"), &ctx(1))
            .unwrap();
        handler.drain_events();

        let record = handler.finalize_message(&id()).unwrap();
        match &record.content {
            RecordContent::ToolCall { tool_calls } => {
                assert_eq!(tool_calls[0].arguments, json!("{\"q\": tru"));
            }
            other => panic!("unexpected {:?}", other),
        }
        let events = handler.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            HandlerEvent::Error { display_id, .. } if *display_id == id()
        )));
        assert!(matches!(events.last(), Some(HandlerEvent::Completed(_))));
    }

    #[test]
    fn test_partial_arguments_while_streaming() {
        let mut handler = ToolCallHandler::new();
        let snapshot = handler
            .process_chunk(&id(), &update(0, Some("t1"), Some("search"), "{\"q\": \"ru"), &ctx(1))
            .unwrap();
        match snapshot.content {
            SnapshotContent::ToolCall { calls } => {
                assert_eq!(calls[0].partial_arguments(), json!({"q": "ru"}));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
