//! Plain assistant text

use chatsync_wire::{MessageComplete, StreamChunk};

use super::{
    HandlerContext, HandlerError, HandlerEvent, MessageHandler, SnapshotStore, record_for,
};
use crate::message::{
    DisplayId, MessageKind, MessageRecord, MessageSnapshot, RecordContent, SnapshotContent,
};

fn empty() -> SnapshotContent {
    SnapshotContent::Text {
        text: String::new(),
    }
}

fn accumulated(snapshot: &MessageSnapshot) -> String {
    match &snapshot.content {
        SnapshotContent::Text { text } => text.clone(),
        _ => String::new(),
    }
}

/// Accumulates text deltas. Text always starts with an explicit
/// initialization, so chunks for unknown ids are rejected.
#[derive(Debug, Default)]
pub struct TextHandler {
    store: SnapshotStore,
}

impl TextHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageHandler for TextHandler {
    fn kind(&self) -> MessageKind {
        MessageKind::Text
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
        if let (SnapshotContent::Text { text }, Some(delta)) =
            (&mut snapshot.content, &chunk.payload.delta)
        {
            text.push_str(delta);
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
        let text = complete
            .final_payload
            .text
            .clone()
            .unwrap_or_else(|| accumulated(snapshot));
        snapshot.content = SnapshotContent::Text { text: text.clone() };
        let record = record_for(snapshot, complete.sequence_id, RecordContent::Text { text });
        Ok(self.store.completed(record))
    }

    fn finalize_message(&mut self, display_id: &DisplayId) -> Option<MessageRecord> {
        let snapshot = self.store.for_finalize(display_id)?;
        let text = accumulated(snapshot);
        let record = record_for(snapshot, snapshot.sequence_number, RecordContent::Text { text });
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
