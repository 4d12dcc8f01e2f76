//! Message-type handlers
//!
//! A handler owns the lifecycle of every in-flight message of one
//! [`MessageKind`]: it creates snapshots, merges chunks into them and turns
//! them into records. Handlers never touch conversation state. Instead they
//! queue [`HandlerEvent`]s that the synchronization manager drains after each
//! call and folds into chat-level state.

mod reasoning;
mod text;
mod tool_call;
pub(crate) mod tools_aggregate;

pub use reasoning::ReasoningHandler;
pub use text::TextHandler;
pub use tool_call::ToolCallHandler;
pub use tools_aggregate::ToolsAggregateHandler;

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use chatsync_wire::{MessageComplete, StreamChunk};
use thiserror::Error;

use crate::message::{
    DisplayId, MessageKind, MessageRecord, MessageSnapshot, Phase, RecordContent, Role,
    SnapshotContent,
};

/// Per-call information the manager supplies to a handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerContext {
    pub conversation_id: String,
    /// Creation time used if the call creates a snapshot
    pub timestamp: i64,
    /// Sequence number used if the call creates a snapshot
    pub sequence_number: u64,
}

/// Notification queued by a handler for the manager
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerEvent {
    Created(MessageSnapshot),
    Updated(MessageSnapshot),
    Completed(MessageRecord),
    Error {
        conversation_id: String,
        display_id: DisplayId,
        message: String,
    },
}

/// Errors raised by a handler for a single dispatch
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Chunk for a message that was never initialized, on a handler that
    /// cannot initialize lazily
    #[error("no snapshot for {0} and the handler does not initialize lazily")]
    NotInitialized(DisplayId),

    /// Chunk for a message that already completed
    #[error("message {0} is already complete")]
    AlreadyComplete(DisplayId),
}

/// Lifecycle contract shared by all message kinds
pub trait MessageHandler: Send {
    /// Kind of message this handler owns
    fn kind(&self) -> MessageKind;

    /// Whether `process_chunk` may create a snapshot on its own. Kinds whose
    /// first observed event can already be a chunk need this.
    fn supports_lazy_init(&self) -> bool;

    /// Create and store a fresh snapshot; queues `Created`
    fn initialize(&mut self, display_id: &DisplayId, ctx: &HandlerContext) -> MessageSnapshot;

    /// Merge a chunk into the snapshot's accumulator; queues `Updated`
    fn process_chunk(
        &mut self,
        display_id: &DisplayId,
        chunk: &StreamChunk,
        ctx: &HandlerContext,
    ) -> Result<MessageSnapshot, HandlerError>;

    /// Finalize with the authoritative payload; queues `Completed`.
    ///
    /// The record carries the completion's sequence number. Replaying the same
    /// completion produces the same record.
    fn complete_message(
        &mut self,
        display_id: &DisplayId,
        complete: &MessageComplete,
        ctx: &HandlerContext,
    ) -> Result<MessageRecord, HandlerError>;

    /// Best-effort record for a snapshot that never received its completion
    fn finalize_message(&mut self, display_id: &DisplayId) -> Option<MessageRecord>;

    /// Current snapshot for a display id
    fn snapshot(&self, display_id: &DisplayId) -> Option<&MessageSnapshot>;

    /// Drop every snapshot belonging to a conversation
    fn release(&mut self, conversation_id: &str);

    /// Take queued events
    fn drain_events(&mut self) -> Vec<HandlerEvent>;
}

/// Snapshot storage and event queue shared by the handler implementations
#[derive(Debug, Default)]
pub(crate) struct SnapshotStore {
    snapshots: HashMap<DisplayId, MessageSnapshot>,
    events: Vec<HandlerEvent>,
}

impl SnapshotStore {
    pub(crate) fn create(
        &mut self,
        display_id: &DisplayId,
        ctx: &HandlerContext,
        content: SnapshotContent,
    ) -> MessageSnapshot {
        let snapshot = new_snapshot(display_id, ctx, content);
        self.snapshots.insert(display_id.clone(), snapshot.clone());
        self.events.push(HandlerEvent::Created(snapshot.clone()));
        snapshot
    }

    pub(crate) fn get(&self, display_id: &DisplayId) -> Option<&MessageSnapshot> {
        self.snapshots.get(display_id)
    }

    /// Snapshot ready to take a chunk. `lazy` supplies empty content when the
    /// handler may create the snapshot itself.
    pub(crate) fn for_chunk(
        &mut self,
        display_id: &DisplayId,
        ctx: &HandlerContext,
        lazy: Option<fn() -> SnapshotContent>,
    ) -> Result<&mut MessageSnapshot, HandlerError> {
        let snapshot = match (self.snapshots.entry(display_id.clone()), lazy) {
            (Entry::Occupied(entry), _) => entry.into_mut(),
            (Entry::Vacant(entry), Some(empty)) => {
                let snapshot = new_snapshot(display_id, ctx, empty());
                self.events.push(HandlerEvent::Created(snapshot.clone()));
                entry.insert(snapshot)
            }
            (Entry::Vacant(_), None) => {
                return Err(HandlerError::NotInitialized(display_id.clone()));
            }
        };
        if snapshot.is_complete() {
            return Err(HandlerError::AlreadyComplete(display_id.clone()));
        }
        Ok(snapshot)
    }

    /// Snapshot for a completion, created from `ctx` when never seen
    pub(crate) fn for_completion(
        &mut self,
        display_id: &DisplayId,
        ctx: &HandlerContext,
        empty: fn() -> SnapshotContent,
    ) -> &mut MessageSnapshot {
        let events = &mut self.events;
        self.snapshots
            .entry(display_id.clone())
            .or_insert_with(|| {
                let snapshot = new_snapshot(display_id, ctx, empty());
                events.push(HandlerEvent::Created(snapshot.clone()));
                snapshot
            })
    }

    /// Open snapshot for finalization
    pub(crate) fn for_finalize(&mut self, display_id: &DisplayId) -> Option<&mut MessageSnapshot> {
        self.snapshots
            .get_mut(display_id)
            .filter(|snapshot| !snapshot.is_complete())
    }

    /// Completed snapshot that can still take late additions
    pub(crate) fn completed_mut(&mut self, display_id: &DisplayId) -> Option<&mut MessageSnapshot> {
        self.snapshots
            .get_mut(display_id)
            .filter(|snapshot| snapshot.is_complete())
    }

    /// Queue `Updated` without changing the phase
    pub(crate) fn refreshed(&mut self, display_id: &DisplayId) -> Option<MessageSnapshot> {
        let snapshot = self.snapshots.get(display_id)?.clone();
        self.events.push(HandlerEvent::Updated(snapshot.clone()));
        Some(snapshot)
    }

    /// Mark a snapshot as streaming and queue `Updated`
    pub(crate) fn updated(&mut self, display_id: &DisplayId) -> Option<MessageSnapshot> {
        let snapshot = self.snapshots.get_mut(display_id)?;
        snapshot.phase = Phase::Streaming;
        snapshot.streaming = true;
        let snapshot = snapshot.clone();
        self.events.push(HandlerEvent::Updated(snapshot.clone()));
        Some(snapshot)
    }

    /// Mark a snapshot complete and queue `Completed`
    pub(crate) fn completed(&mut self, record: MessageRecord) -> MessageRecord {
        if let Some(snapshot) = self.snapshots.get_mut(&record.id) {
            snapshot.phase = Phase::Complete;
            snapshot.streaming = false;
            snapshot.sequence_number = record.sequence_number;
        }
        self.events.push(HandlerEvent::Completed(record.clone()));
        record
    }

    pub(crate) fn error(&mut self, snapshot: &MessageSnapshot, message: String) {
        self.events.push(HandlerEvent::Error {
            conversation_id: snapshot.conversation_id.clone(),
            display_id: snapshot.display_id.clone(),
            message,
        });
    }

    pub(crate) fn release(&mut self, conversation_id: &str) {
        self.snapshots
            .retain(|_, snapshot| snapshot.conversation_id != conversation_id);
    }

    pub(crate) fn drain(&mut self) -> Vec<HandlerEvent> {
        std::mem::take(&mut self.events)
    }
}

fn new_snapshot(
    display_id: &DisplayId,
    ctx: &HandlerContext,
    content: SnapshotContent,
) -> MessageSnapshot {
    MessageSnapshot {
        display_id: display_id.clone(),
        conversation_id: ctx.conversation_id.clone(),
        role: Role::Assistant,
        created_at: ctx.timestamp,
        sequence_number: ctx.sequence_number,
        streaming: true,
        phase: Phase::Initial,
        content,
    }
}

/// Record skeleton for a snapshot
pub(crate) fn record_for(
    snapshot: &MessageSnapshot,
    sequence_number: u64,
    content: RecordContent,
) -> MessageRecord {
    MessageRecord {
        id: snapshot.display_id.clone(),
        conversation_id: snapshot.conversation_id.clone(),
        role: snapshot.role,
        timestamp: snapshot.created_at,
        sequence_number,
        content,
    }
}
