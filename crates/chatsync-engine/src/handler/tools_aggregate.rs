//! Aggregate tool message: streamed call updates paired with their results
//!
//! Tool-call updates and tool results of one raw message share a display id
//! and converge here. Results can arrive before the call they answer; those
//! wait in `pending_results` until a call with the matching id shows up.

use chatsync_wire::{MessageComplete, StreamChunk, ToolCall, ToolResult};

use super::{
    HandlerContext, HandlerError, HandlerEvent, MessageHandler, SnapshotStore, record_for,
};
use crate::message::{
    DisplayId, MessageKind, MessageRecord, MessageSnapshot, RecordContent, SnapshotContent,
    ToolCallDraft, ToolPair, ToolPairDraft, locate_draft,
};

fn empty() -> SnapshotContent {
    SnapshotContent::ToolsAggregate {
        pairs: Vec::new(),
        pending_results: Vec::new(),
    }
}

/// Insert or replace a result by tool-call id
fn upsert_result(results: &mut Vec<ToolResult>, result: ToolResult) {
    match results
        .iter_mut()
        .find(|r| r.tool_call_id == result.tool_call_id)
    {
        Some(existing) => *existing = result,
        None => results.push(result),
    }
}

/// Attach buffered results to any call that now exists
fn repair(pairs: &mut [ToolPairDraft], pending: &mut Vec<ToolResult>) {
    pending.retain(|result| {
        match pairs
            .iter_mut()
            .find(|p| p.call.id.as_deref() == Some(result.tool_call_id.as_str()))
        {
            Some(pair) => {
                pair.result = Some(result.clone());
                false
            }
            None => true,
        }
    });
}

/// Pair finished calls with results by tool-call id.
///
/// Calls without a result keep `None`. Results without a call are kept behind
/// a placeholder call so nothing the backend reported is lost.
pub(crate) fn pair_calls(calls: Vec<ToolCall>, results: Vec<ToolResult>) -> Vec<ToolPair> {
    let mut results = results;
    let mut pairs: Vec<ToolPair> = calls
        .into_iter()
        .map(|call| {
            let result = results
                .iter()
                .position(|r| r.tool_call_id == call.id)
                .map(|pos| results.remove(pos));
            ToolPair { call, result }
        })
        .collect();
    pairs.extend(results.into_iter().map(|result| ToolPair {
        call: ToolCall {
            id: result.tool_call_id.clone(),
            name: result.tool_name.clone().unwrap_or_default(),
            arguments: serde_json::Value::Null,
        },
        result: Some(result),
    }));
    pairs
}

/// Handler for the aggregate tool message; initializes lazily
#[derive(Debug, Default)]
pub struct ToolsAggregateHandler {
    store: SnapshotStore,
}

impl ToolsAggregateHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finish streamed drafts and collect every streamed result
    fn streamed(content: &SnapshotContent) -> (Vec<ToolCall>, Vec<ToolResult>, Vec<String>) {
        let SnapshotContent::ToolsAggregate {
            pairs,
            pending_results,
        } = content
        else {
            return (Vec::new(), Vec::new(), Vec::new());
        };

        let mut errors = Vec::new();
        let mut results = Vec::new();
        let calls = pairs
            .iter()
            .map(|pair| {
                let (call, error) = pair.call.finish();
                errors.extend(error);
                results.extend(pair.result.clone());
                call
            })
            .collect();
        for result in pending_results {
            upsert_result(&mut results, result.clone());
        }
        (calls, results, errors)
    }

    /// Attach a result that arrived after the call list was completed and
    /// place the record again. `None` when the message is still open.
    fn late_result(&mut self, display_id: &DisplayId, result: &ToolResult) -> Option<MessageSnapshot> {
        let snapshot = self.store.completed_mut(display_id)?;
        let SnapshotContent::ToolsAggregate { pairs, .. } = &mut snapshot.content else {
            return None;
        };
        match pairs
            .iter_mut()
            .find(|p| p.call.id.as_deref() == Some(result.tool_call_id.as_str()))
        {
            Some(pair) => pair.result = Some(result.clone()),
            None => {
                let call = ToolCall {
                    id: result.tool_call_id.clone(),
                    name: result.tool_name.clone().unwrap_or_default(),
                    arguments: serde_json::Value::Null,
                };
                pairs.push(ToolPairDraft {
                    call: ToolCallDraft::from_call(pairs.len(), &call),
                    result: Some(result.clone()),
                });
            }
        }
        let placed: Vec<ToolPair> = pairs
            .iter()
            .map(|pair| ToolPair {
                call: pair.call.finish().0,
                result: pair.result.clone(),
            })
            .collect();
        let snapshot = snapshot.clone();

        let updated = self.store.refreshed(display_id)?;
        self.store.completed(record_for(
            &snapshot,
            snapshot.sequence_number,
            RecordContent::ToolsAggregate { pairs: placed },
        ));
        Some(updated)
    }

    fn record(
        &mut self,
        display_id: &DisplayId,
        pairs: Vec<ToolPair>,
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
            RecordContent::ToolsAggregate { pairs },
        );
        Some(self.store.completed(record))
    }
}

impl MessageHandler for ToolsAggregateHandler {
    fn kind(&self) -> MessageKind {
        MessageKind::ToolsAggregate
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
        // Results keep arriving after the call list completes
        if let (Some(result), None) = (&chunk.payload.tool_result, &chunk.payload.tool_call_update) {
            if let Some(snapshot) = self.late_result(display_id, result) {
                return Ok(snapshot);
            }
        }

        let snapshot = self.store.for_chunk(display_id, ctx, Some(empty))?;
        if let SnapshotContent::ToolsAggregate {
            pairs,
            pending_results,
        } = &mut snapshot.content
        {
            if let Some(update) = &chunk.payload.tool_call_update {
                match locate_draft(pairs.iter(), |p| &p.call, update) {
                    Some(pos) => pairs[pos].call.apply(update),
                    None => {
                        let mut call = ToolCallDraft::new(update.index.unwrap_or(pairs.len()));
                        call.apply(update);
                        pairs.push(ToolPairDraft { call, result: None });
                    }
                }
            }
            if let Some(result) = &chunk.payload.tool_result {
                upsert_result(pending_results, result.clone());
            }
            repair(pairs, pending_results);
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
        let (streamed_calls, mut results, mut errors) = Self::streamed(&snapshot.content);
        let calls = match &complete.final_payload.tool_calls {
            Some(calls) => {
                errors.clear();
                calls.clone()
            }
            None => streamed_calls,
        };
        // Final results win over streamed ones
        for result in &complete.final_payload.tool_results {
            upsert_result(&mut results, result.clone());
        }

        let pairs = pair_calls(calls, results);
        snapshot.content = SnapshotContent::ToolsAggregate {
            pairs: pairs
                .iter()
                .enumerate()
                .map(|(i, pair)| ToolPairDraft {
                    call: ToolCallDraft::from_call(i, &pair.call),
                    result: pair.result.clone(),
                })
                .collect(),
            pending_results: Vec::new(),
        };
        self.record(display_id, pairs, errors, Some(complete.sequence_id))
            .ok_or_else(|| HandlerError::NotInitialized(display_id.clone()))
    }

    fn finalize_message(&mut self, display_id: &DisplayId) -> Option<MessageRecord> {
        let snapshot = self.store.for_finalize(display_id)?;
        let (calls, results, errors) = Self::streamed(&snapshot.content);
        self.record(display_id, pair_calls(calls, results), errors, None)
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
    use chatsync_wire::{ChunkKind, ChunkPayload, FinalPayload, ToolCallUpdate};
    use serde_json::json;

    fn id() -> DisplayId {
        DisplayId::derive("m3", ChunkKind::ToolCallUpdate)
    }

    fn call_update(index: usize, call_id: &str, args: &str) -> StreamChunk {
        chunk(
            "m3",
            ChunkKind::ToolCallUpdate,
            ChunkPayload {
                tool_call_update: Some(ToolCallUpdate {
                    index: Some(index),
                    id: Some(call_id.to_string()),
                    name: Some("search".to_string()),
                    arguments_delta: Some(args.to_string()),
                }),
                ..Default::default()
            },
        )
    }

    fn result(call_id: &str, content: &str) -> ToolResult {
        ToolResult {
            tool_call_id: call_id.to_string(),
            tool_name: Some("search".to_string()),
            content: json!(content),
            is_error: false,
        }
    }

    fn result_chunk(call_id: &str, content: &str) -> StreamChunk {
        chunk(
            "m3",
            ChunkKind::ToolResult,
            ChunkPayload {
                tool_result: Some(result(call_id, content)),
                ..Default::default()
            },
        )
    }

    fn pairs_of(snapshot: &MessageSnapshot) -> (&[ToolPairDraft], &[ToolResult]) {
        match &snapshot.content {
            SnapshotContent::ToolsAggregate {
                pairs,
                pending_results,
            } => (pairs, pending_results),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_pairs_result_with_call() {
        let mut handler = ToolsAggregateHandler::new();
        handler
            .process_chunk(&id(), &call_update(0, "t1", "{}"), &ctx(2))
            .unwrap();
        let snapshot = handler
            .process_chunk(&id(), &result_chunk("t1", "found"), &ctx(2))
            .unwrap();
        let (pairs, pending) = pairs_of(&snapshot);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].result.as_ref().unwrap().content, json!("found"));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_result_before_call_is_buffered() {
        let mut handler = ToolsAggregateHandler::new();
        let snapshot = handler
            .process_chunk(&id(), &result_chunk("t1", "early"), &ctx(2))
            .unwrap();
        let (pairs, pending) = pairs_of(&snapshot);
        assert!(pairs.is_empty());
        assert_eq!(pending.len(), 1);

        let snapshot = handler
            .process_chunk(&id(), &call_update(0, "t1", "{}"), &ctx(2))
            .unwrap();
        let (pairs, pending) = pairs_of(&snapshot);
        assert_eq!(pairs[0].result.as_ref().unwrap().content, json!("early"));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_unmatched_call_has_no_result() {
        let mut handler = ToolsAggregateHandler::new();
        handler
            .process_chunk(&id(), &call_update(0, "t1", "{\"q\":1}"), &ctx(2))
            .unwrap();
        handler
            .process_chunk(&id(), &call_update(1, "t2", "{}"), &ctx(2))
            .unwrap();
        handler
            .process_chunk(&id(), &result_chunk("t2", "ok"), &ctx(2))
            .unwrap();

        let record = handler.finalize_message(&id()).unwrap();
        match record.content {
            RecordContent::ToolsAggregate { pairs } => {
                assert_eq!(pairs.len(), 2);
                assert_eq!(pairs[0].call.arguments, json!({"q": 1}));
                assert!(pairs[0].result.is_none());
                assert_eq!(pairs[1].result.as_ref().unwrap().content, json!("ok"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_completion_final_results_win() {
        let mut handler = ToolsAggregateHandler::new();
        handler
            .process_chunk(&id(), &call_update(0, "t1", "{}"), &ctx(2))
            .unwrap();
        handler
            .process_chunk(&id(), &result_chunk("t1", "streamed"), &ctx(2))
            .unwrap();

        let record = handler
            .complete_message(
                &id(),
                &complete(
                    "m3",
                    ChunkKind::ToolResult,
                    8,
                    FinalPayload {
                        tool_results: vec![result("t1", "final")],
                        ..Default::default()
                    },
                ),
                &ctx(8),
            )
            .unwrap();
        assert_eq!(record.sequence_number, 8);
        match record.content {
            RecordContent::ToolsAggregate { pairs } => {
                assert_eq!(pairs.len(), 1);
                assert_eq!(pairs[0].call.id, "t1");
                assert_eq!(pairs[0].result.as_ref().unwrap().content, json!("final"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_completion_repairs_pending_results() {
        let mut handler = ToolsAggregateHandler::new();
        handler
            .process_chunk(&id(), &result_chunk("t9", "orphan"), &ctx(2))
            .unwrap();
        let record = handler
            .complete_message(
                &id(),
                &complete(
                    "m3",
                    ChunkKind::ToolCallUpdate,
                    3,
                    FinalPayload {
                        tool_calls: Some(vec![ToolCall {
                            id: "t9".into(),
                            name: "search".into(),
                            arguments: json!({}),
                        }]),
                        ..Default::default()
                    },
                ),
                &ctx(3),
            )
            .unwrap();
        match record.content {
            RecordContent::ToolsAggregate { pairs } => {
                assert_eq!(pairs.len(), 1);
                assert_eq!(pairs[0].result.as_ref().unwrap().content, json!("orphan"));
            }
            other => panic!("unexpected {:?}", other),
        }
        let (_, pending) = pairs_of(handler.snapshot(&id()).unwrap());
        assert!(pending.is_empty());
    }

    #[test]
    fn test_result_after_completion_updates_record() {
        let mut handler = ToolsAggregateHandler::new();
        handler
            .process_chunk(&id(), &call_update(0, "t1", "{\"q\":\"rust\"}"), &ctx(2))
            .unwrap();
        handler
            .complete_message(
                &id(),
                &complete(
                    "m3",
                    ChunkKind::ToolCallUpdate,
                    5,
                    FinalPayload {
                        tool_calls: Some(vec![ToolCall {
                            id: "t1".into(),
                            name: "search".into(),
                            arguments: json!({"q": "rust"}),
                        }]),
                        ..Default::default()
                    },
                ),
                &ctx(5),
            )
            .unwrap();
        handler.drain_events();

        let snapshot = handler
            .process_chunk(&id(), &result_chunk("t1", "found"), &ctx(2))
            .unwrap();
        assert!(snapshot.is_complete());
        let (pairs, _) = pairs_of(&snapshot);
        assert_eq!(pairs[0].result.as_ref().unwrap().content, json!("found"));

        let events = handler.drain_events();
        let record = events
            .iter()
            .find_map(|event| match event {
                HandlerEvent::Completed(record) => Some(record.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(record.sequence_number, 5);
        match record.content {
            RecordContent::ToolsAggregate { pairs } => {
                assert_eq!(pairs.len(), 1);
                assert_eq!(pairs[0].call.arguments, json!({"q": "rust"}));
                assert_eq!(pairs[0].result.as_ref().unwrap().content, json!("found"));
            }
            other => panic!("unexpected {:?}", other),
        }

        // Call updates for a completed message are still rejected
        let err = handler
            .process_chunk(&id(), &call_update(1, "t2", "{}"), &ctx(2))
            .unwrap_err();
        assert!(matches!(err, HandlerError::AlreadyComplete(_)));
    }

    #[test]
    fn test_pair_calls_keeps_orphan_results() {
        let pairs = pair_calls(Vec::new(), vec![result("t5", "lonely")]);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].call.id, "t5");
        assert_eq!(pairs[0].call.name, "search");
        assert_eq!(pairs[0].call.arguments, serde_json::Value::Null);
    }
}
