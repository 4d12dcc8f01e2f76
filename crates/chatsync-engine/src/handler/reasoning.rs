//! Model reasoning ("thinking") messages

use chatsync_wire::{MessageComplete, StreamChunk};

use super::{
    HandlerContext, HandlerError, HandlerEvent, MessageHandler, SnapshotStore, record_for,
};
use crate::message::{
    DisplayId, MessageKind, MessageRecord, MessageSnapshot, RecordContent, SnapshotContent,
};

fn empty() -> SnapshotContent {
    SnapshotContent::Reasoning {
        text: String::new(),
        visible: true,
    }
}

fn accumulated(snapshot: &MessageSnapshot) -> (String, bool) {
    match &snapshot.content {
        SnapshotContent::Reasoning { text, visible } => (text.clone(), *visible),
        _ => (String::new(), true),
    }
}

/// Accumulates reasoning deltas and tracks whether the reasoning should be
/// shown. Like text, reasoning requires an explicit initialization.
#[derive(Debug, Default)]
pub struct ReasoningHandler {
    store: SnapshotStore,
}

impl ReasoningHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageHandler for ReasoningHandler {
    fn kind(&self) -> MessageKind {
        MessageKind::Reasoning
    }

    fn supports_lazy_init(&self) -> bool {
        false
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
        let snapshot = self.store.for_chunk(display_id, ctx, None)?;
        if let SnapshotContent::Reasoning { text, visible } = &mut snapshot.content {
            if let Some(delta) = &chunk.payload.delta {
                text.push_str(delta);
            }
            if let Some(flag) = chunk.payload.visible {
                *visible = flag;
            }
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
        let (streamed, streamed_visible) = accumulated(snapshot);
        let payload = &complete.final_payload;
        // Some backends send the final reasoning under `text`
        let text = payload
            .reasoning
            .clone()
            .or_else(|| payload.text.clone())
            .unwrap_or(streamed);
        let visible = payload.visible.unwrap_or(streamed_visible);

        snapshot.content = SnapshotContent::Reasoning {
            text: text.clone(),
            visible,
        };
        let record = record_for(
            snapshot,
            complete.sequence_id,
            RecordContent::Reasoning { text, visible },
        );
        Ok(self.store.completed(record))
    }

    fn finalize_message(&mut self, display_id: &DisplayId) -> Option<MessageRecord> {
        let snapshot = self.store.for_finalize(display_id)?;
        let (text, visible) = accumulated(snapshot);
        let record = record_for(
            snapshot,
            snapshot.sequence_number,
            RecordContent::Reasoning { text, visible },
        );
        Some(self.store.completed(record))
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
