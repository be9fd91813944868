//! State shared by every task of one run

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

/// Created once at process start and handed by reference to the dispatcher
/// and the receive loop.
#[derive(Debug, Default)]
pub struct RunContext {
    stop: Arc<AtomicBool>,
    next_buffer_id: AtomicU64,
    console: Mutex<()>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share an existing stop flag, e.g. one raised by a signal handler.
    pub fn with_stop_flag(stop: Arc<AtomicBool>) -> Self {
        Self {
            stop,
            ..Self::default()
        }
    }

    /// Raise the stop flag from SIGINT/SIGTERM.
    pub fn install_interrupt_handler(&self) -> Result<(), ctrlc::Error> {
        let stop = Arc::clone(&self.stop);
        ctrlc::set_handler(move || {
            stop.store(true, Ordering::SeqCst);
        })
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Unique across all tasks; order across tasks is unspecified.
    pub fn next_buffer_id(&self) -> u64 {
        self.next_buffer_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Ids handed out so far.
    pub fn buffer_ids_issued(&self) -> u64 {
        self.next_buffer_id.load(Ordering::Relaxed)
    }

    /// Hold while emitting multi-line output so tasks do not interleave.
    pub fn console(&self) -> MutexGuard<'_, ()> {
        self.console.lock()
    }
}
