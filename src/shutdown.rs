//! Cooperative shutdown signaling for listening endpoints.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// A handle used to stop accept loops and anything else that waits on
/// it. Cloning produces connected handles; signaling any one of them
/// releases every waiter, including waiters that subscribe later.
#[derive(Debug, Clone)]
pub struct Shutdown {
    notify: broadcast::Sender<()>,
    /// Latched so that a handle subscribed after the signal still
    /// observes it.
    fired: Arc<AtomicBool>,
}

impl Shutdown {
    /// Creates a new, unsignaled shutdown.
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(1);
        Self {
            notify,
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Signals every handle cloned from this one.
    pub fn shut_down(&self) {
        self.fired.store(true, Ordering::SeqCst);
        // An error only means there are no waiters right now; the latch
        // still catches them.
        let _ = self.notify.send(());
    }

    /// Waits until the shutdown is signaled. Returns immediately if it
    /// already was.
    pub async fn wait_for_shutdown(&self) {
        if self.fired.load(Ordering::SeqCst) {
            return;
        }
        let mut recv = self.notify.subscribe();
        if self.fired.load(Ordering::SeqCst) {
            return;
        }
        loop {
            use tokio::sync::broadcast::error::RecvError;
            match recv.recv().await {
                Ok(()) => return,
                // We hold a sender, so the channel cannot close.
                Err(RecvError::Closed) => unreachable!(),
                Err(RecvError::Lagged(_)) => {
                    if self.fired.load(Ordering::SeqCst) {
                        return;
                    }
                }
            }
        }
    }

    /// Whether the shutdown has been signaled.
    pub fn is_shut_down(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
