/// Process-wide cancellation checked at sleep boundaries
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const SLICE: Duration = Duration::from_millis(100);

/// Cloneable shutdown flag
///
/// Nothing is interrupted mid-request; waits poll the flag in short slices
/// and return early once it is set.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    requested: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag from a Ctrl+C / SIGTERM handler
    pub fn install_signal_handler(&self) -> Result<(), ctrlc::Error> {
        let requested = self.requested.clone();
        ctrlc::set_handler(move || {
            tracing::info!("received shutdown signal");
            requested.store(true, Ordering::SeqCst);
        })
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` unless shutdown is requested first.
    ///
    /// Returns `false` when woken by shutdown.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_requested() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(SLICE.min(deadline - now));
        }
    }
}
