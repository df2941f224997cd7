//! Cancellation handles for in-flight exchanges
//!
//! The engine imposes no timeouts of its own; a [`CancelHandle`] is the
//! sole bounded-wait mechanism. One handle can be cloned freely: any clone
//! may cancel, every clone observes the cancellation.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Clonable cancellation handle for a request exchange
///
/// Wraps a [`CancellationToken`] and carries an optional human-readable
/// reason supplied at cancel time. A default handle never fires.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    token: CancellationToken,
    reason: Arc<Mutex<Option<String>>>,
}

impl CancelHandle {
    /// Create a fresh, un-cancelled handle
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation without a reason
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Signal cancellation, recording a reason for the resulting error
    pub fn cancel_with_reason(&self, reason: impl Into<String>) {
        *self.reason.lock() = Some(reason.into());
        self.token.cancel();
    }

    /// Check whether cancellation has been signalled
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait until cancellation is signalled
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// The reason recorded at cancel time, if any
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }
}
