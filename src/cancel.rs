//! Cooperative cancellation for the tunnel poller

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Stop flag shared between the poller and whoever may ask it to stop.
///
/// Clones share the same flag. Setting it never blocks and never performs
/// I/O, so it is safe to flip from a signal-handling task while the poller
/// is in the middle of a tick.
#[derive(Debug, Clone, Default)]
pub struct CancellationSignal {
    stop: Arc<AtomicBool>,
}

impl CancellationSignal {
    /// Create a signal in the running state
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop. Further calls have no additional effect.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Check whether a stop has been requested
    pub fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_flag() {
        let signal = CancellationSignal::new();
        let remote = signal.clone();
        assert!(!signal.is_stop_requested());

        remote.request_stop();
        assert!(signal.is_stop_requested());

        remote.request_stop();
        assert!(signal.is_stop_requested());
    }

    #[test]
    fn test_set_from_other_thread() {
        let signal = CancellationSignal::new();
        let remote = signal.clone();
        std::thread::spawn(move || remote.request_stop())
            .join()
            .unwrap();
        assert!(signal.is_stop_requested());
    }
}
