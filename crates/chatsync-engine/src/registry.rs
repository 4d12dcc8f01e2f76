//! Handler registry: one handler per message kind

use std::collections::HashMap;

use crate::handler::{
    MessageHandler, ReasoningHandler, TextHandler, ToolCallHandler, ToolsAggregateHandler,
};
use crate::message::MessageKind;

/// A boxed handler
pub type BoxedHandler = Box<dyn MessageHandler>;

/// Maps each message kind to the handler that owns it.
///
/// Registering a kind that already has a handler replaces it. Snapshots held
/// by the old handler are not migrated.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<MessageKind, BoxedHandler>,
}

impl HandlerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the built-in handler for every kind
    pub fn with_default_handlers() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(TextHandler::new()));
        registry.register(Box::new(ReasoningHandler::new()));
        registry.register(Box::new(ToolCallHandler::new()));
        registry.register(Box::new(ToolsAggregateHandler::new()));
        registry
    }

    /// Register a handler under its own kind, returning the one it replaced
    pub fn register(&mut self, handler: BoxedHandler) -> Option<BoxedHandler> {
        let kind = handler.kind();
        let previous = self.handlers.insert(kind, handler);
        if previous.is_some() {
            tracing::info!(?kind, "Replaced message handler");
        }
        previous
    }

    /// Handler for a kind
    pub fn get(&self, kind: MessageKind) -> Option<&dyn MessageHandler> {
        self.handlers.get(&kind).map(|h| h.as_ref())
    }

    /// Mutable handler for a kind
    pub fn get_mut(&mut self, kind: MessageKind) -> Option<&mut (dyn MessageHandler + 'static)> {
        self.handlers.get_mut(&kind).map(|h| h.as_mut())
    }

    /// Registered kinds
    pub fn kinds(&self) -> Vec<MessageKind> {
        self.handlers.keys().copied().collect()
    }

    pub fn handlers(&self) -> impl Iterator<Item = &BoxedHandler> {
        self.handlers.values()
    }

    /// Every registered handler
    pub fn handlers_mut(&mut self) -> impl Iterator<Item = &mut BoxedHandler> {
        self.handlers.values_mut()
    }

    /// Remove every handler
    pub fn clear(&mut self) {
        self.handlers.clear();
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
