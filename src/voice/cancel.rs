//! One-shot cancellation latch shared between a turn's tasks

use std::sync::Arc;

use tokio::sync::watch;

/// Cancellation flag that can be awaited
///
/// Clones share the same latch. Once cancelled it stays cancelled.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// Create an untriggered token
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Trigger cancellation; idempotent
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Whether cancellation has been triggered
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once cancellation has been triggered
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // the sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}
