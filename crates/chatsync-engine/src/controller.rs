//! Stream controller: reads one event stream and feeds the manager
//!
//! The controller owns the read loop. Bytes go through UTF-8 decoding and
//! record framing, each record is decoded into an envelope and applied to the
//! shared [`SyncManager`] under one lock acquisition. The loop can be stopped
//! at any point through the [`StreamHandle`]; a broken stream marks the
//! conversation as failed and schedules a reload of its task state.

use std::sync::Arc;
use std::time::Duration;

use chatsync_wire::{
    ChatRequest, ChatTransport, Frame, FrameBuffer, Utf8ChunkDecoder, decode_frame,
};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::handle::StreamHandle;
use crate::manager::SyncManager;
use crate::tasks::TaskStore;

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Delay before task state is reloaded after a transport failure
    pub recovery_delay: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            recovery_delay: Duration::from_secs(2),
        }
    }
}

/// How a stream ended when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The backend closed the stream
    Completed,
    /// The stream was stopped through the handle
    Cancelled,
}

struct Recovery {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Drives event streams into a shared [`SyncManager`]
pub struct StreamController {
    transport: Arc<dyn ChatTransport>,
    manager: Arc<Mutex<SyncManager>>,
    tasks: Option<Arc<dyn TaskStore>>,
    config: ControllerConfig,
    handle: StreamHandle,
    recovery: Mutex<Option<Recovery>>,
}

impl StreamController {
    pub fn new(transport: Arc<dyn ChatTransport>, manager: Arc<Mutex<SyncManager>>) -> Self {
        Self {
            transport,
            manager,
            tasks: None,
            config: ControllerConfig::default(),
            handle: StreamHandle::new(),
            recovery: Mutex::new(None),
        }
    }

    /// Reload task state from this store after transport failures
    pub fn with_task_store(mut self, tasks: Arc<dyn TaskStore>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    pub fn with_config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Get a cloneable handle for stopping the stream from outside
    pub fn handle(&self) -> StreamHandle {
        self.handle.clone()
    }

    pub fn manager(&self) -> &Arc<Mutex<SyncManager>> {
        &self.manager
    }

    /// Whether a recovery reload is scheduled and has not run yet
    pub fn has_pending_recovery(&self) -> bool {
        self.recovery
            .lock()
            .as_ref()
            .is_some_and(|r| !r.cancel.is_cancelled() && !r.task.is_finished())
    }

    /// Send a request and apply its event stream until it ends.
    ///
    /// A stream that ends without a `complete` event still finishes the turn.
    /// Transport failures are recorded on the conversation and returned.
    pub async fn run(&self, request: &ChatRequest) -> Result<StreamOutcome> {
        self.cancel_recovery();
        let cancel = self.handle.begin();
        let mut selected = request.conversation_id.clone();

        let result = self.read(request, &cancel, &mut selected).await;
        let outcome = match result {
            Ok(StreamOutcome::Completed) => {
                if let Some(id) = &selected {
                    self.manager.lock().finish_turn(id);
                }
                Ok(StreamOutcome::Completed)
            }
            Ok(StreamOutcome::Cancelled) => {
                tracing::debug!(conversation = ?selected, "Stream cancelled");
                if let Some(id) = &selected {
                    self.manager.lock().cancel_streaming(id);
                }
                Ok(StreamOutcome::Cancelled)
            }
            Err(e) => {
                tracing::warn!(conversation = ?selected, "Stream failed: {}", e);
                if let Some(id) = &selected {
                    self.manager.lock().fail_turn(id, e.to_string());
                    self.schedule_recovery(id.clone());
                }
                Err(e)
            }
        };

        self.handle.finish();
        outcome
    }

    async fn read(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
        selected: &mut Option<String>,
    ) -> Result<StreamOutcome> {
        let mut body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(StreamOutcome::Cancelled),
            opened = self.transport.open(request) => opened?,
        };

        let mut decoder = Utf8ChunkDecoder::new();
        let mut frames = FrameBuffer::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(StreamOutcome::Cancelled),
                next = body.next() => next,
            };
            match next {
                Some(Ok(bytes)) => {
                    let text = decoder.decode(&bytes);
                    let ready = frames.push(&text);
                    self.dispatch(&ready, selected);
                }
                Some(Err(e)) if e.is_cancellation() => return Ok(StreamOutcome::Cancelled),
                Some(Err(e)) => return Err(e.into()),
                None => break,
            }
        }

        let tail = decoder.finish();
        let mut ready = frames.push(&tail);
        ready.extend(frames.finish());
        self.dispatch(&ready, selected);
        Ok(StreamOutcome::Completed)
    }

    fn dispatch(&self, frames: &[Frame], selected: &mut Option<String>) {
        for envelope in frames.iter().filter_map(decode_frame) {
            if selected.as_deref() != Some(envelope.conversation_id.as_str()) {
                *selected = Some(envelope.conversation_id.clone());
            }
            if let Err(e) = self.manager.lock().apply(&envelope) {
                tracing::warn!(
                    conversation_id = %envelope.conversation_id,
                    kind = ?envelope.kind(),
                    "Failed to apply event: {}",
                    e
                );
            }
        }
    }

    fn schedule_recovery(&self, conversation_id: String) {
        let Some(tasks) = self.tasks.clone() else {
            return;
        };
        let cancel = CancellationToken::new();
        let delay = self.config.recovery_delay;

        let token = cancel.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!(conversation_id, "Recovery reload cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = tasks.reload(&conversation_id).await {
                        tracing::warn!(conversation_id, "Task reload failed: {}", e);
                    }
                }
            }
        });

        if let Some(previous) = self.recovery.lock().replace(Recovery { cancel, task }) {
            previous.cancel.cancel();
        }
    }

    fn cancel_recovery(&self) {
        if let Some(recovery) = self.recovery.lock().take() {
            recovery.cancel.cancel();
        }
    }
}
