//! Task tracker state and the bridge that feeds it from task operations

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chatsync_wire::{RetrievalClient, TaskNode, TaskOperation, TaskOperationType, TaskState};
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{Error, Result};

/// Something that can fetch the authoritative task state of a conversation
#[async_trait]
pub trait TaskSource: Send + Sync {
    async fn fetch_tasks(&self, conversation_id: &str) -> chatsync_wire::Result<TaskState>;
}

#[async_trait]
impl TaskSource for RetrievalClient {
    async fn fetch_tasks(&self, conversation_id: &str) -> chatsync_wire::Result<TaskState> {
        self.fetch_task_state(conversation_id).await
    }
}

/// Receiver of task-state changes
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Show or hide the loading indicator
    fn set_loading(&self, conversation_id: &str, loading: bool);

    /// Replace the task tree wholesale
    fn replace_tasks(&self, conversation_id: &str, tasks: Vec<TaskNode>, state_version: Option<u64>);

    /// Fetch the authoritative task tree again
    async fn reload(&self, conversation_id: &str) -> Result<()>;
}

/// Task state of one conversation
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskList {
    pub tasks: Vec<TaskNode>,
    pub loading: bool,
    /// Local revision, bumped on every replacement
    pub version: u64,
    /// Version the backend attached to the last replacement
    pub state_version: Option<u64>,
}

/// Task store kept in memory
#[derive(Default)]
pub struct InMemoryTaskStore {
    lists: Mutex<HashMap<String, TaskList>>,
    source: Option<Arc<dyn TaskSource>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a source for `reload`
    pub fn with_source(mut self, source: Arc<dyn TaskSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Task state of a conversation
    pub fn get(&self, conversation_id: &str) -> Option<TaskList> {
        self.lists.lock().get(conversation_id).cloned()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    fn set_loading(&self, conversation_id: &str, loading: bool) {
        self.lists
            .lock()
            .entry(conversation_id.to_string())
            .or_default()
            .loading = loading;
    }

    fn replace_tasks(&self, conversation_id: &str, tasks: Vec<TaskNode>, state_version: Option<u64>) {
        let mut lists = self.lists.lock();
        let list = lists.entry(conversation_id.to_string()).or_default();
        list.tasks = tasks;
        list.version += 1;
        list.state_version = state_version;
    }

    async fn reload(&self, conversation_id: &str) -> Result<()> {
        let Some(source) = &self.source else {
            tracing::debug!(conversation_id, "No task source, skipping reload");
            return Ok(());
        };

        self.set_loading(conversation_id, true);
        let fetched = source.fetch_tasks(conversation_id).await;
        self.set_loading(conversation_id, false);

        let state = fetched?;
        let version = state.version();
        self.replace_tasks(conversation_id, state.into_tasks(), version);
        Ok(())
    }
}

/// Applies task operations from the stream to a [`TaskStore`]
#[derive(Clone)]
pub struct TaskOperationBridge {
    store: Arc<dyn TaskStore>,
}

impl TaskOperationBridge {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Apply one operation.
    ///
    /// `start` raises the loading indicator, `complete` replaces the tasks and
    /// always lowers it, `sync` only replaces the tasks. A task state with an
    /// unrecognized shape leaves the tasks untouched and is reported.
    pub fn apply(&self, conversation_id: &str, op: &TaskOperation) -> Result<()> {
        match op.operation {
            TaskOperationType::Start => {
                self.store.set_loading(conversation_id, true);
                Ok(())
            }
            TaskOperationType::Complete => {
                let result = self.replace(conversation_id, op);
                self.store.set_loading(conversation_id, false);
                result
            }
            TaskOperationType::Sync => self.replace(conversation_id, op),
        }
    }

    fn replace(&self, conversation_id: &str, op: &TaskOperation) -> Result<()> {
        let Some(raw) = &op.task_state else {
            return Ok(());
        };
        match TaskState::from_value(raw) {
            Ok(state) => {
                let version = op.state_version.or(state.version());
                self.store
                    .replace_tasks(conversation_id, state.into_tasks(), version);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(conversation_id, error = %e, "Ignoring malformed task state");
                Err(Error::TaskState(e.to_string()))
            }
        }
    }
}
