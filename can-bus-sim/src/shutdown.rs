//! Cooperative cancellation
//!
//! Both loops watch a `tokio::sync::watch` flag. Setting it to `true` (or
//! dropping the sender) asks them to stop at their next wait.

use tokio::sync::watch;
use tokio::time::Instant;

/// Sender half used by whoever decides to stop the loops
pub type ShutdownSender = watch::Sender<bool>;

/// Receiver half observed by the loops
pub type ShutdownReceiver = watch::Receiver<bool>;

/// Create a shutdown flag, initially not set
pub fn channel() -> (ShutdownSender, ShutdownReceiver) {
    watch::channel(false)
}

/// True once shutdown was requested
pub fn is_requested(shutdown: &ShutdownReceiver) -> bool {
    *shutdown.borrow()
}

/// Resolve when shutdown is requested or the sender is gone
pub async fn requested(shutdown: &mut ShutdownReceiver) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Sleep until `deadline` unless shutdown comes first
///
/// Returns `false` if the sleep was interrupted by shutdown.
pub async fn sleep_until(shutdown: &mut ShutdownReceiver, deadline: Instant) -> bool {
    tokio::select! {
        biased;
        _ = requested(shutdown) => false,
        _ = tokio::time::sleep_until(deadline) => true,
    }
}
