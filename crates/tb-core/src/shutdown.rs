use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// ShutdownSignal: cooperative shutdown coordination
// ---------------------------------------------------------------------------

/// Watch-based shutdown coordinator.
///
/// Background loops `select!` on [`ShutdownSignal::wait`] alongside their
/// work. Unlike a broadcast channel, a component that starts listening after
/// the trigger still observes it.
///
/// ```ignore
/// let shutdown = ShutdownSignal::new();
/// let listener = shutdown.clone();
///
/// tokio::select! {
///     _ = listener.wait() => { /* graceful cleanup */ }
///     _ = do_work() => {}
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Check if shutdown has been triggered (non-blocking).
    pub fn is_shutting_down(&self) -> bool {
        *self.tx.borrow()
    }

    /// Trigger shutdown for all listeners. Later calls only log.
    pub fn trigger(&self) {
        let first = self.tx.send_if_modified(|flag| {
            if *flag {
                false
            } else {
                *flag = true;
                true
            }
        });
        if first {
            info!("shutdown signal triggered");
        } else {
            warn!("shutdown already triggered");
        }
    }

    /// Resolve once shutdown has been triggered.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // `wait_for` checks the current value first, so a trigger that
        // happened before this call resolves immediately.
        let _ = rx.wait_for(|flag| *flag).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
