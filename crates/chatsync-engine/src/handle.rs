//! A cloneable handle for stopping a stream from external code.

use parking_lot::Mutex;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio_util::sync::CancellationToken;

/// A cloneable handle for stopping a stream from external code.
///
/// All fields are `Arc`-wrapped, so cloning is cheap.
#[derive(Clone)]
pub struct StreamHandle {
    pub(crate) cancel: Arc<Mutex<CancellationToken>>,
    pub(crate) idle_notify: Arc<tokio::sync::Notify>,
    pub(crate) is_streaming: Arc<AtomicBool>,
}

impl StreamHandle {
    pub(crate) fn new() -> Self {
        Self {
            cancel: Arc::new(Mutex::new(CancellationToken::new())),
            idle_notify: Arc::new(tokio::sync::Notify::new()),
            is_streaming: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stop the current stream. Content received so far stays visible.
    pub fn stop(&self) {
        self.cancel.lock().cancel();
    }

    /// Wait until no stream is running.
    pub async fn wait_for_idle(&self) {
        let notified = self.idle_notify.notified();
        if !self.is_streaming.load(Ordering::Acquire) {
            return;
        }
        notified.await;
    }

    /// Wait until no stream is running, with a timeout.
    /// Returns `true` if idle was reached, `false` on timeout.
    pub async fn wait_for_idle_timeout(&self, timeout: std::time::Duration) -> bool {
        if !self.is_streaming.load(Ordering::Acquire) {
            return true;
        }
        tokio::time::timeout(timeout, self.wait_for_idle())
            .await
            .is_ok()
    }

    /// Whether a stream is currently being read.
    pub fn is_streaming(&self) -> bool {
        self.is_streaming.load(Ordering::Acquire)
    }

    /// Install a fresh token and mark the stream as running
    pub(crate) fn begin(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.cancel.lock() = token.clone();
        self.is_streaming.store(true, Ordering::Release);
        token
    }

    /// Mark the stream as finished and wake waiters
    pub(crate) fn finish(&self) {
        self.is_streaming.store(false, Ordering::Release);
        self.idle_notify.notify_waiters();
    }
}
