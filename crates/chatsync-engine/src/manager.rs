//! Chat synchronization: routes envelopes to handlers and maintains
//! conversation state

use std::collections::{HashMap, HashSet};

use chatsync_wire::{
    ChunkKind, EnvelopeBody, ErrorEvent, EventEnvelope, MessageComplete, StreamChunk,
    TaskOperation, TurnStart,
};
use tokio::sync::broadcast;

use crate::conversation::{Conversation, TurnPhase};
use crate::error::{Error, Result};
use crate::events::SyncEvent;
use crate::handler::{HandlerContext, HandlerEvent};
use crate::message::{DisplayId, MessageKind, MessageRecord, MessageSnapshot, Phase};
use crate::registry::HandlerRegistry;
use crate::sequence::SequenceTracker;
use crate::tasks::TaskOperationBridge;

/// In-flight state of one conversation's turn
#[derive(Debug, Default)]
struct StreamState {
    snapshots: HashMap<DisplayId, MessageSnapshot>,
    sequences: SequenceTracker,
    /// Usage completions already folded into the totals
    usage_applied: HashSet<DisplayId>,
}

/// Applies decoded envelopes to conversation state.
///
/// The manager is synchronous: every call applies one change completely and
/// broadcasts the resulting [`SyncEvent`]s. Stream controllers share it
/// behind a mutex.
pub struct SyncManager {
    registry: HandlerRegistry,
    conversations: HashMap<String, Conversation>,
    streams: HashMap<String, StreamState>,
    tasks: Option<TaskOperationBridge>,
    event_tx: broadcast::Sender<SyncEvent>,
}

impl Default for SyncManager {
    fn default() -> Self {
        Self::new(HandlerRegistry::with_default_handlers())
    }
}

impl SyncManager {
    /// Create a manager around a handler registry
    pub fn new(registry: HandlerRegistry) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            registry,
            conversations: HashMap::new(),
            streams: HashMap::new(),
            tasks: None,
            event_tx,
        }
    }

    /// Forward task operations to a bridge
    pub fn with_task_bridge(mut self, bridge: TaskOperationBridge) -> Self {
        self.tasks = Some(bridge);
        self
    }

    /// Subscribe to change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_tx.subscribe()
    }

    /// Mutable registry, e.g. to replace a handler at runtime
    pub fn registry_mut(&mut self) -> &mut HandlerRegistry {
        &mut self.registry
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<&Conversation> {
        self.conversations.get(conversation_id)
    }

    pub fn conversations(&self) -> impl Iterator<Item = &Conversation> {
        self.conversations.values()
    }

    /// Whether a conversation is currently streaming
    pub fn is_streaming(&self, conversation_id: &str) -> bool {
        self.conversations
            .get(conversation_id)
            .is_some_and(|c| c.streaming)
    }

    /// In-flight snapshots of a conversation, ordered by sequence number
    pub fn snapshots(&self, conversation_id: &str) -> Vec<&MessageSnapshot> {
        let mut snapshots: Vec<&MessageSnapshot> = self
            .streams
            .get(conversation_id)
            .map(|state| state.snapshots.values().collect())
            .unwrap_or_default();
        snapshots.sort_by_key(|s| s.sequence_number);
        snapshots
    }

    pub fn snapshot(&self, conversation_id: &str, display_id: &DisplayId) -> Option<&MessageSnapshot> {
        self.streams
            .get(conversation_id)
            .and_then(|state| state.snapshots.get(display_id))
    }

    /// Apply one envelope.
    ///
    /// Errors concern this envelope only; the caller logs them and keeps
    /// feeding later envelopes.
    pub fn apply(&mut self, envelope: &EventEnvelope) -> Result<()> {
        let conversation_id = envelope.conversation_id.as_str();
        let timestamp = envelope
            .server_timestamp
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

        match &envelope.body {
            EnvelopeBody::TurnStart(turn) => {
                self.start_turn(conversation_id, turn);
                Ok(())
            }
            EnvelopeBody::StreamChunk(chunk) => self.apply_chunk(conversation_id, chunk, timestamp),
            EnvelopeBody::MessageComplete(complete) => {
                self.apply_complete(conversation_id, complete, timestamp)
            }
            EnvelopeBody::StreamComplete => {
                self.finish_turn(conversation_id);
                Ok(())
            }
            EnvelopeBody::TaskOperation(op) => {
                self.apply_task_operation(conversation_id, op);
                Ok(())
            }
            EnvelopeBody::Error(error) => {
                self.apply_server_error(conversation_id, error);
                Ok(())
            }
        }
    }

    fn start_turn(&mut self, conversation_id: &str, turn: &TurnStart) {
        let user_message = MessageRecord::user(
            turn.user_message_id.as_str(),
            conversation_id,
            turn.user_content.clone().unwrap_or_default(),
            turn.user_timestamp,
            turn.user_sequence_number,
        );

        let conversation = self.ensure_conversation(conversation_id);
        let placed = if conversation.contains(&user_message.id) {
            false
        } else {
            conversation.upsert(user_message.clone());
            true
        };
        conversation.phase = TurnPhase::TurnActive;
        conversation.streaming = true;
        conversation.error = None;

        tracing::debug!(conversation_id, user_message_id = %user_message.id, "Turn started");
        if placed {
            self.emit(SyncEvent::MessagePlaced {
                record: user_message.clone(),
            });
        }
        self.emit(SyncEvent::TurnStarted {
            conversation_id: conversation_id.to_string(),
            user_message,
        });
    }

    fn apply_chunk(&mut self, conversation_id: &str, chunk: &StreamChunk, timestamp: i64) -> Result<()> {
        let Some(kind) = MessageKind::for_chunk(chunk.chunk_kind) else {
            tracing::debug!(kind = %chunk.chunk_kind, "Ignoring chunk without a message kind");
            return Ok(());
        };
        let display_id = DisplayId::derive(&chunk.raw_message_id, chunk.chunk_kind);

        let conversation = self.ensure_conversation(conversation_id);
        conversation.streaming = true;
        // Past every placed record, so a reply never sorts before its prompt
        let floor = (conversation.messages.len() as u64)
            .max(conversation.max_sequence().map_or(0, |seq| seq + 1));

        let state = self.streams.entry(conversation_id.to_string()).or_default();
        let (sequence_number, first_sight) = state.sequences.provisional_for(&display_id, floor);
        let ctx = HandlerContext {
            conversation_id: conversation_id.to_string(),
            timestamp,
            sequence_number,
        };

        let handler = self
            .registry
            .get_mut(kind)
            .ok_or_else(|| Error::Other(format!("no handler registered for {:?}", kind)))?;
        if first_sight && !handler.supports_lazy_init() && handler.snapshot(&display_id).is_none() {
            handler.initialize(&display_id, &ctx);
        }
        let result = handler.process_chunk(&display_id, chunk, &ctx);
        let events = handler.drain_events();
        self.apply_handler_events(events);
        result?;

        // Only the message receiving chunks shows as streaming
        if let Some(state) = self.streams.get_mut(conversation_id) {
            for (id, snapshot) in state.snapshots.iter_mut() {
                snapshot.streaming = *id == display_id && !snapshot.is_complete();
            }
        }
        Ok(())
    }

    fn apply_complete(
        &mut self,
        conversation_id: &str,
        complete: &MessageComplete,
        timestamp: i64,
    ) -> Result<()> {
        let display_id = DisplayId::derive(&complete.raw_message_id, complete.chunk_kind);
        self.ensure_conversation(conversation_id);

        if let Some(usage) = &complete.final_payload.usage {
            let state = self.streams.entry(conversation_id.to_string()).or_default();
            if state.usage_applied.insert(display_id.clone()) {
                if let Some(conversation) = self.conversations.get_mut(conversation_id) {
                    conversation.usage.add(usage);
                    let usage = conversation.usage;
                    self.emit(SyncEvent::UsageUpdated {
                        conversation_id: conversation_id.to_string(),
                        usage,
                    });
                }
            }
        }

        let Some(kind) = MessageKind::for_chunk(complete.chunk_kind) else {
            return Ok(());
        };

        self.streams
            .entry(conversation_id.to_string())
            .or_default()
            .sequences
            .record_final(&display_id, complete.sequence_id);
        let ctx = HandlerContext {
            conversation_id: conversation_id.to_string(),
            timestamp,
            sequence_number: complete.sequence_id,
        };

        let handler = self
            .registry
            .get_mut(kind)
            .ok_or_else(|| Error::Other(format!("no handler registered for {:?}", kind)))?;
        let result = handler.complete_message(&display_id, complete, &ctx);
        let events = handler.drain_events();
        self.apply_handler_events(events);
        result?;
        Ok(())
    }

    fn apply_task_operation(&mut self, conversation_id: &str, op: &TaskOperation) {
        match &self.tasks {
            // Malformed task state is logged by the bridge
            Some(bridge) => {
                let _ = bridge.apply(conversation_id, op);
            }
            None => tracing::debug!(conversation_id, "No task bridge attached, ignoring operation"),
        }
    }

    fn apply_server_error(&mut self, conversation_id: &str, error: &ErrorEvent) {
        tracing::warn!(conversation_id, code = ?error.code, "Server error: {}", error.message);
        self.ensure_conversation(conversation_id)
            .set_error(error.message.clone(), error.code.clone());
        self.stop_snapshots(conversation_id);

        self.emit(SyncEvent::Error {
            conversation_id: conversation_id.to_string(),
            display_id: error
                .raw_message_id
                .as_deref()
                .map(|raw| DisplayId::derive(raw, ChunkKind::Error)),
            message: error.message.clone(),
        });
    }

    /// End the active turn of a conversation.
    ///
    /// Open snapshots are finalized from what they accumulated, handler state
    /// for the conversation is released and the conversation goes idle.
    /// Returns the ids of the finalized messages. Calling this on an idle
    /// conversation does nothing.
    pub fn finish_turn(&mut self, conversation_id: &str) -> Vec<DisplayId> {
        let active = self
            .conversations
            .get(conversation_id)
            .is_some_and(|c| c.streaming || c.phase == TurnPhase::TurnActive);
        if !active && !self.streams.contains_key(conversation_id) {
            return Vec::new();
        }

        let mut open: Vec<(DisplayId, MessageKind, u64)> = self
            .streams
            .get(conversation_id)
            .map(|state| {
                state
                    .snapshots
                    .values()
                    .filter(|s| !s.is_complete())
                    .map(|s| (s.display_id.clone(), s.message_kind(), s.sequence_number))
                    .collect()
            })
            .unwrap_or_default();
        open.sort_by_key(|(_, _, seq)| *seq);

        let mut finalized = Vec::new();
        for (display_id, kind, provisional) in open {
            let Some(handler) = self.registry.get_mut(kind) else {
                continue;
            };
            if handler.finalize_message(&display_id).is_none() {
                continue;
            }
            let mut events = handler.drain_events();

            let sequence_number = self
                .streams
                .get(conversation_id)
                .and_then(|state| state.sequences.resolve(&display_id))
                .unwrap_or(provisional);
            for event in events.iter_mut() {
                if let HandlerEvent::Completed(record) = event {
                    record.sequence_number = sequence_number;
                }
            }
            self.apply_handler_events(events);
            finalized.push(display_id);
        }

        for handler in self.registry.handlers_mut() {
            handler.release(conversation_id);
            handler.drain_events();
        }
        self.streams.remove(conversation_id);

        let conversation = self.ensure_conversation(conversation_id);
        conversation.streaming = false;
        conversation.phase = TurnPhase::Idle;
        conversation.updated_at = chrono::Utc::now().timestamp_millis();

        tracing::debug!(conversation_id, finalized = finalized.len(), "Turn finished");
        self.emit(SyncEvent::TurnFinished {
            conversation_id: conversation_id.to_string(),
            finalized: finalized.clone(),
        });
        finalized
    }

    /// Stop streaming without finishing the turn. Partial content stays in
    /// place until the next turn end.
    pub fn cancel_streaming(&mut self, conversation_id: &str) {
        let Some(conversation) = self.conversations.get_mut(conversation_id) else {
            return;
        };
        conversation.streaming = false;
        conversation.phase = TurnPhase::Idle;
        self.stop_snapshots(conversation_id);
        self.emit(SyncEvent::StreamingStopped {
            conversation_id: conversation_id.to_string(),
        });
    }

    /// Record a failure of the stream itself
    pub fn fail_turn(&mut self, conversation_id: &str, message: impl Into<String>) {
        let message = message.into();
        let conversation = self.ensure_conversation(conversation_id);
        conversation.set_error(message.clone(), None);
        conversation.phase = TurnPhase::Idle;
        self.stop_snapshots(conversation_id);
        self.emit(SyncEvent::Error {
            conversation_id: conversation_id.to_string(),
            display_id: None,
            message,
        });
    }

    /// Merge records fetched from the history endpoint
    pub fn load_history(&mut self, conversation_id: &str, records: Vec<MessageRecord>) {
        let conversation = self.ensure_conversation(conversation_id);
        for record in &records {
            conversation.upsert(record.clone());
        }
        for record in records {
            self.emit(SyncEvent::MessagePlaced { record });
        }
    }

    fn apply_handler_events(&mut self, events: Vec<HandlerEvent>) {
        for event in events {
            match event {
                HandlerEvent::Created(snapshot) | HandlerEvent::Updated(snapshot) => {
                    self.streams
                        .entry(snapshot.conversation_id.clone())
                        .or_default()
                        .snapshots
                        .insert(snapshot.display_id.clone(), snapshot.clone());
                    self.emit(SyncEvent::SnapshotUpdated { snapshot });
                }
                HandlerEvent::Completed(record) => {
                    if let Some(snapshot) = self
                        .streams
                        .get_mut(&record.conversation_id)
                        .and_then(|state| state.snapshots.get_mut(&record.id))
                    {
                        snapshot.phase = Phase::Complete;
                        snapshot.streaming = false;
                        snapshot.sequence_number = record.sequence_number;
                    }
                    self.ensure_conversation(&record.conversation_id)
                        .upsert(record.clone());
                    self.emit(SyncEvent::MessagePlaced { record });
                }
                HandlerEvent::Error {
                    conversation_id,
                    display_id,
                    message,
                } => {
                    self.emit(SyncEvent::Error {
                        conversation_id,
                        display_id: Some(display_id),
                        message,
                    });
                }
            }
        }
    }

    fn stop_snapshots(&mut self, conversation_id: &str) {
        if let Some(state) = self.streams.get_mut(conversation_id) {
            for snapshot in state.snapshots.values_mut() {
                snapshot.streaming = false;
            }
        }
    }

    fn ensure_conversation(&mut self, conversation_id: &str) -> &mut Conversation {
        let event_tx = &self.event_tx;
        self.conversations
            .entry(conversation_id.to_string())
            .or_insert_with(|| {
                let _ = event_tx.send(SyncEvent::ConversationCreated {
                    conversation_id: conversation_id.to_string(),
                });
                Conversation::new(conversation_id)
            })
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::TextHandler;
    use crate::message::{RecordContent, Role, SnapshotContent};
    use crate::tasks::{InMemoryTaskStore, TaskOperationBridge};
    use chatsync_wire::{ChunkPayload, FinalPayload, TaskOperationType, Usage, try_decode};
    use serde_json::json;
    use std::sync::Arc;

    fn envelope(body: EnvelopeBody) -> EventEnvelope {
        EventEnvelope {
            conversation_id: "c1".into(),
            version: None,
            server_timestamp: Some(1_700_000_000_000),
            body,
        }
    }

    fn turn_start(user_id: &str, seq: u64) -> EventEnvelope {
        envelope(EnvelopeBody::TurnStart(TurnStart {
            user_message_id: user_id.into(),
            user_timestamp: 1_699_999_999_000,
            user_sequence_number: seq,
            user_content: Some("Hi".into()),
        }))
    }

    fn delta(raw: &str, kind: ChunkKind, text: &str) -> EventEnvelope {
        envelope(EnvelopeBody::StreamChunk(StreamChunk {
            raw_message_id: raw.into(),
            sequence_id: 0,
            chunk_kind: kind,
            payload: ChunkPayload {
                delta: Some(text.into()),
                ..Default::default()
            },
        }))
    }

    fn complete(raw: &str, kind: ChunkKind, seq: u64, payload: FinalPayload) -> EventEnvelope {
        envelope(EnvelopeBody::MessageComplete(MessageComplete {
            raw_message_id: raw.into(),
            sequence_id: seq,
            chunk_kind: kind,
            final_payload: payload,
        }))
    }

    fn text_payload(text: &str) -> FinalPayload {
        FinalPayload {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    fn stream_complete() -> EventEnvelope {
        envelope(EnvelopeBody::StreamComplete)
    }

    #[test]
    fn test_text_scenario() {
        let mut manager = SyncManager::default();
        manager.apply(&turn_start("u1", 6)).unwrap();
        manager.apply(&delta("m1", ChunkKind::Text, "Hel")).unwrap();
        manager.apply(&delta("m1", ChunkKind::Text, "lo")).unwrap();

        let id = DisplayId::new("m1:text");
        let snapshot = manager.snapshot("c1", &id).unwrap();
        assert_eq!(snapshot.content, SnapshotContent::Text { text: "Hello".into() });
        assert!(snapshot.streaming);

        manager
            .apply(&complete("m1", ChunkKind::Text, 7, text_payload("Hello")))
            .unwrap();
        manager.apply(&stream_complete()).unwrap();

        let conversation = manager.conversation("c1").unwrap();
        assert_eq!(conversation.messages.len(), 2);
        assert_eq!(conversation.messages[0].role, Role::User);
        let record = &conversation.messages[1];
        assert_eq!(record.id, id);
        assert_eq!(record.sequence_number, 7);
        assert_eq!(record.text(), Some("Hello"));
        assert!(!conversation.streaming);
        assert_eq!(conversation.phase, TurnPhase::Idle);
        assert!(manager.snapshots("c1").is_empty());

        let value = serde_json::to_value(record).unwrap();
        assert_eq!(value["id"], "m1:text");
        assert_eq!(value["sequenceNumber"], 7);
        assert_eq!(value["text"], "Hello");
    }

    #[test]
    fn test_replayed_completion_is_idempotent() {
        let mut manager = SyncManager::default();
        manager.apply(&turn_start("u1", 1)).unwrap();
        manager.apply(&delta("m1", ChunkKind::Text, "Hi")).unwrap();
        let done = complete("m1", ChunkKind::Text, 2, text_payload("Hi there"));
        manager.apply(&done).unwrap();
        let before = manager.conversation("c1").unwrap().messages.clone();
        manager.apply(&done).unwrap();
        assert_eq!(manager.conversation("c1").unwrap().messages, before);
    }

    #[test]
    fn test_kinds_of_one_raw_id_stay_separate() {
        let mut manager = SyncManager::default();
        manager.apply(&turn_start("u1", 1)).unwrap();
        manager.apply(&delta("m1", ChunkKind::Reasoning, "think")).unwrap();
        manager.apply(&delta("m1", ChunkKind::Text, "say")).unwrap();

        let snapshots = manager.snapshots("c1");
        assert_eq!(snapshots.len(), 2);
        assert_ne!(snapshots[0].display_id, snapshots[1].display_id);
        // Only the latest chunk's message is streaming
        assert!(!snapshots[0].streaming);
        assert!(snapshots[1].streaming);
    }

    #[test]
    fn test_provisional_sequences_increase_under_interleaving() {
        let mut manager = SyncManager::default();
        manager.apply(&turn_start("u1", 1)).unwrap();
        manager.apply(&delta("m1", ChunkKind::Reasoning, "a")).unwrap();
        manager.apply(&delta("m2", ChunkKind::Text, "b")).unwrap();
        manager.apply(&delta("m1", ChunkKind::Reasoning, "c")).unwrap();
        manager.apply(&delta("m3", ChunkKind::Text, "d")).unwrap();

        let seqs: Vec<u64> = manager
            .snapshots("c1")
            .iter()
            .map(|s| s.sequence_number)
            .collect();
        assert_eq!(seqs, [2, 3, 4]);
    }

    #[test]
    fn test_finalized_reply_sorts_after_prompt() {
        let mut manager = SyncManager::default();
        manager.apply(&turn_start("u1", 6)).unwrap();
        manager.apply(&delta("m1", ChunkKind::Text, "partial")).unwrap();
        assert_eq!(
            manager
                .snapshot("c1", &DisplayId::new("m1:text"))
                .unwrap()
                .sequence_number,
            7
        );
        manager.apply(&stream_complete()).unwrap();

        let order: Vec<(String, u64)> = manager
            .conversation("c1")
            .unwrap()
            .messages
            .iter()
            .map(|m| (m.id.to_string(), m.sequence_number))
            .collect();
        assert_eq!(order, [("u1".to_string(), 6), ("m1:text".to_string(), 7)]);
    }

    #[test]
    fn test_stream_complete_finalizes_open_snapshots() {
        let mut manager = SyncManager::default();
        let mut events = manager.subscribe();
        manager.apply(&turn_start("u1", 1)).unwrap();
        manager.apply(&delta("m1", ChunkKind::Text, "cut")).unwrap();
        manager.apply(&stream_complete()).unwrap();

        let conversation = manager.conversation("c1").unwrap();
        assert_eq!(conversation.messages.len(), 2);
        assert_eq!(conversation.messages[1].text(), Some("cut"));
        assert_eq!(conversation.messages[1].sequence_number, 2);
        assert!(!conversation.streaming);
        assert!(manager.snapshots("c1").is_empty());

        let mut finished = None;
        while let Ok(event) = events.try_recv() {
            if let SyncEvent::TurnFinished { finalized, .. } = event {
                finished = Some(finalized);
            }
        }
        assert_eq!(finished.unwrap(), vec![DisplayId::new("m1:text")]);
    }

    #[test]
    fn test_turn_start_preserves_unfinished_snapshot() {
        let mut manager = SyncManager::default();
        manager.apply(&turn_start("u1", 1)).unwrap();
        manager.apply(&delta("m1", ChunkKind::Reasoning, "still thinking")).unwrap();
        manager.apply(&turn_start("u2", 5)).unwrap();

        let snapshot = manager
            .snapshot("c1", &DisplayId::new("m1:reasoning"))
            .unwrap();
        assert_eq!(
            snapshot.content,
            SnapshotContent::Reasoning {
                text: "still thinking".into(),
                visible: true
            }
        );
        assert_eq!(manager.conversation("c1").unwrap().messages.len(), 2);

        // The reasoning keeps streaming into the same snapshot
        manager.apply(&delta("m1", ChunkKind::Reasoning, "...")).unwrap();
        assert_eq!(manager.snapshots("c1").len(), 1);
    }

    #[test]
    fn test_turn_start_does_not_duplicate_user_record() {
        let mut manager = SyncManager::default();
        manager.apply(&turn_start("u1", 1)).unwrap();
        manager.apply(&turn_start("u1", 1)).unwrap();
        assert_eq!(manager.conversation("c1").unwrap().messages.len(), 1);
    }

    #[test]
    fn test_completion_for_unseen_id_is_appended() {
        let mut manager = SyncManager::default();
        manager.apply(&turn_start("u1", 1)).unwrap();
        manager
            .apply(&complete("m9", ChunkKind::Text, 4, text_payload("late")))
            .unwrap();
        let conversation = manager.conversation("c1").unwrap();
        let record = conversation.messages.last().unwrap();
        assert_eq!(record.id, DisplayId::new("m9:text"));
        assert_eq!(record.sequence_number, 4);
    }

    #[test]
    fn test_completion_repositions_record() {
        let mut manager = SyncManager::default();
        manager.apply(&turn_start("u1", 10)).unwrap();
        manager
            .apply(&complete("m1", ChunkKind::Text, 5, text_payload("early")))
            .unwrap();
        let ids: Vec<String> = manager
            .conversation("c1")
            .unwrap()
            .messages
            .iter()
            .map(|m| m.id.to_string())
            .collect();
        assert_eq!(ids, ["m1:text", "u1"]);
    }

    #[test]
    fn test_usage_folds_into_totals_once() {
        let mut manager = SyncManager::default();
        manager.apply(&turn_start("u1", 1)).unwrap();
        let usage = complete(
            "m1",
            ChunkKind::Usage,
            3,
            FinalPayload {
                usage: Some(Usage {
                    input_tokens: 10,
                    output_tokens: 5,
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        manager.apply(&usage).unwrap();
        manager.apply(&usage).unwrap();

        let conversation = manager.conversation("c1").unwrap();
        assert_eq!(conversation.usage.input_tokens, 10);
        assert_eq!(conversation.usage.output_tokens, 5);
        // Usage never becomes a message
        assert_eq!(conversation.messages.len(), 1);
    }

    #[test]
    fn test_server_error_keeps_content() {
        let mut manager = SyncManager::default();
        manager.apply(&turn_start("u1", 1)).unwrap();
        manager.apply(&delta("m1", ChunkKind::Text, "partial")).unwrap();
        manager
            .apply(&envelope(EnvelopeBody::Error(ErrorEvent {
                message: "overloaded".into(),
                code: Some("529".into()),
                raw_message_id: None,
            })))
            .unwrap();

        let conversation = manager.conversation("c1").unwrap();
        assert!(!conversation.streaming);
        assert_eq!(conversation.error.as_ref().unwrap().code.as_deref(), Some("529"));
        let snapshot = manager.snapshot("c1", &DisplayId::new("m1:text")).unwrap();
        assert!(!snapshot.streaming);
        assert_eq!(snapshot.content, SnapshotContent::Text { text: "partial".into() });
    }

    #[test]
    fn test_new_turn_clears_error() {
        let mut manager = SyncManager::default();
        manager.fail_turn("c1", "connection reset");
        assert!(manager.conversation("c1").unwrap().error.is_some());
        manager.apply(&turn_start("u1", 1)).unwrap();
        assert!(manager.conversation("c1").unwrap().error.is_none());
        assert!(manager.is_streaming("c1"));
    }

    #[test]
    fn test_cancel_streaming_keeps_snapshots() {
        let mut manager = SyncManager::default();
        manager.apply(&turn_start("u1", 1)).unwrap();
        manager.apply(&delta("m1", ChunkKind::Text, "partial")).unwrap();
        manager.cancel_streaming("c1");

        assert!(!manager.is_streaming("c1"));
        let snapshot = manager.snapshot("c1", &DisplayId::new("m1:text")).unwrap();
        assert!(!snapshot.streaming);
        assert!(manager.conversation("c1").unwrap().error.is_none());

        // The next turn end still finalizes them
        assert_eq!(manager.finish_turn("c1"), vec![DisplayId::new("m1:text")]);
        assert!(manager.finish_turn("c1").is_empty());
    }

    #[test]
    fn test_hot_swapped_text_handler_rejects_known_id() {
        let mut manager = SyncManager::default();
        manager.apply(&turn_start("u1", 1)).unwrap();
        manager.apply(&delta("m1", ChunkKind::Text, "a")).unwrap();
        manager.registry_mut().register(Box::new(TextHandler::new()));

        let err = manager.apply(&delta("m1", ChunkKind::Text, "b")).unwrap_err();
        assert!(matches!(err, Error::Handler(_)));
        // A new message still works
        manager.apply(&delta("m2", ChunkKind::Text, "c")).unwrap();
    }

    #[test]
    fn test_tool_result_and_update_share_a_message() {
        let mut manager = SyncManager::default();
        manager.apply(&turn_start("u1", 1)).unwrap();
        for (event, payload) in [
            (
                "messageupdate",
                json!({"toolCallUpdate": {"index": 0, "id": "t1", "name": "ls", "argumentsDelta": "{}"}}),
            ),
            (
                "messageupdate",
                json!({"toolResult": {"toolCallId": "t1", "content": "a.txt"}}),
            ),
        ] {
            let kind = if payload.get("toolResult").is_some() {
                "tool-result"
            } else {
                "tool-call-update"
            };
            let raw = json!({"chatId": "c1", "kind": kind, "messageId": "m2",
                             "sequenceId": 2, "payload": payload});
            manager
                .apply(&try_decode(event, &raw.to_string()).unwrap())
                .unwrap();
        }

        let snapshots = manager.snapshots("c1");
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].display_id, DisplayId::new("m2:tools"));

        manager.apply(&stream_complete()).unwrap();
        let record = manager.conversation("c1").unwrap().messages.last().unwrap().clone();
        match record.content {
            RecordContent::ToolsAggregate { pairs } => {
                assert_eq!(pairs.len(), 1);
                assert_eq!(pairs[0].result.as_ref().unwrap().content, json!("a.txt"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_tool_result_after_call_completion_reaches_record() {
        let mut manager = SyncManager::default();
        manager.apply(&turn_start("u1", 1)).unwrap();
        for (event, kind, payload) in [
            (
                "messageupdate",
                "tool-call-update",
                json!({"toolCallUpdate": {"index": 0, "id": "t1", "name": "ls", "argumentsDelta": "{}"}}),
            ),
            (
                "message",
                "tool-call-update",
                json!({"toolCalls": [{"id": "t1", "name": "ls", "arguments": "{}"}]}),
            ),
            (
                "messageupdate",
                "tool-result",
                json!({"toolResult": {"toolCallId": "t1", "content": "a.txt"}}),
            ),
        ] {
            let raw = json!({"chatId": "c1", "kind": kind, "messageId": "m2",
                             "sequenceId": 2, "payload": payload});
            manager
                .apply(&try_decode(event, &raw.to_string()).unwrap())
                .unwrap();
        }
        manager.apply(&stream_complete()).unwrap();

        let conversation = manager.conversation("c1").unwrap();
        assert_eq!(conversation.messages.len(), 2);
        let record = conversation
            .message(&DisplayId::new("m2:tools"))
            .unwrap();
        assert_eq!(record.sequence_number, 2);
        match &record.content {
            RecordContent::ToolsAggregate { pairs } => {
                assert_eq!(pairs.len(), 1);
                assert_eq!(pairs[0].call.id, "t1");
                assert_eq!(pairs[0].result.as_ref().unwrap().content, json!("a.txt"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_task_operations_reach_bridge() {
        let store = Arc::new(InMemoryTaskStore::new());
        let mut manager =
            SyncManager::default().with_task_bridge(TaskOperationBridge::new(store.clone()));
        manager
            .apply(&envelope(EnvelopeBody::TaskOperation(TaskOperation {
                operation: TaskOperationType::Start,
                task_state: None,
                state_version: None,
            })))
            .unwrap();
        assert!(store.get("c1").unwrap().loading);

        manager
            .apply(&envelope(EnvelopeBody::TaskOperation(TaskOperation {
                operation: TaskOperationType::Complete,
                task_state: None,
                state_version: None,
            })))
            .unwrap();
        let list = store.get("c1").unwrap();
        assert!(!list.loading);
        assert!(list.tasks.is_empty());
    }

    #[test]
    fn test_load_history_merges_records() {
        let mut manager = SyncManager::default();
        manager.apply(&turn_start("u2", 3)).unwrap();
        manager.load_history(
            "c1",
            vec![
                MessageRecord::user("u1", "c1", "first", 0, 1),
                MessageRecord::user("u2", "c1", "Hi", 0, 3),
            ],
        );
        let ids: Vec<String> = manager
            .conversation("c1")
            .unwrap()
            .messages
            .iter()
            .map(|m| m.id.to_string())
            .collect();
        assert_eq!(ids, ["u1", "u2"]);
    }
}
