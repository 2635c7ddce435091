//! Cooperative cancellation.
//!
//! A single top-level token propagates into every blocking call site: the
//! orchestrator loop stops between items, the PRP runtime aborts at the next
//! stage boundary, and running gate subprocesses are signalled. Cancellation
//! is a first-class value returned from operations, not an exception.

use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable cancellation token.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Signal cancellation to every clone of this token.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is signalled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // wait_for only errors when the sender is dropped, and every clone
        // holds the sender alive.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
