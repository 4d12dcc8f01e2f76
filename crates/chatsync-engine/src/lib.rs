//! chatsync-engine: client-side synchronization of streamed conversations
//!
//! This crate turns decoded stream envelopes into conversation state: one
//! handler per message kind accumulates snapshots, the manager places
//! finalized records in sequence order, and the controller drives a stream
//! from a transport with cancellation and recovery.

pub mod controller;
pub mod conversation;
pub mod error;
pub mod events;
pub mod handle;
pub mod handler;
pub mod history;
pub mod manager;
pub mod message;
pub mod registry;
pub mod sequence;
pub mod tasks;

pub use controller::{ControllerConfig, StreamController, StreamOutcome};
pub use conversation::{Conversation, ConversationError, TurnPhase};
pub use error::{Error, Result};
pub use events::SyncEvent;
pub use handle::StreamHandle;
pub use handler::{HandlerContext, HandlerError, HandlerEvent, MessageHandler};
pub use history::{HistorySource, sync_history};
pub use manager::SyncManager;
pub use message::{DisplayId, MessageKind, MessageRecord, MessageSnapshot, RecordContent, Role};
pub use registry::HandlerRegistry;
pub use tasks::{InMemoryTaskStore, TaskList, TaskOperationBridge, TaskSource, TaskStore};
