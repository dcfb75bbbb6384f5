//! Cooperative signals for background tasks and blocked waits.
//!
//! `ShutdownSignal` replaces bare `thread::sleep` loops in background tasks
//! with Condvar-backed waits that wake within milliseconds of a stop request.
//! `InterruptFlag` is the lighter cousin carried by interruptible operations:
//! a plain flag that blocked lock waits poll at slice boundaries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Cooperative shutdown signal with sub-millisecond wakeup latency.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<ShutdownInner>,
}

#[derive(Default)]
struct ShutdownInner {
    flag: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal shutdown. Wakes all waiters immediately.
    pub fn shutdown(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.condvar.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Sleep for at most `duration`, waking early on `shutdown()`. Returns
    /// `true` if shutdown was requested (caller should exit its loop).
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        if self.is_shutdown() {
            return true;
        }
        let mut guard = self.inner.mutex.lock();
        self.inner.condvar.wait_for(&mut guard, duration);
        self.is_shutdown()
    }
}

/// External cancellation flag for an in-flight operation.
///
/// Lock and ticket waits holding a clone of this flag re-check it on every
/// bounded wait slice and fail with `LockError::Interrupted` once set.
#[derive(Clone, Default)]
pub struct InterruptFlag {
    flag: Arc<AtomicBool>,
}

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Clear the flag so the handle can be reused by a following operation.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_wakes_waiter() {
        let sig = ShutdownSignal::new();
        let sig2 = sig.clone();
        let handle = std::thread::spawn(move || {
            let start = std::time::Instant::now();
            let stopped = sig2.wait_timeout(Duration::from_secs(10));
            (stopped, start.elapsed())
        });
        std::thread::sleep(Duration::from_millis(20));
        sig.shutdown();
        let (stopped, elapsed) = handle.join().unwrap();
        assert!(stopped);
        assert!(elapsed < Duration::from_secs(1), "took {:?}", elapsed);
    }

    #[test]
    fn test_wait_timeout_expires() {
        let sig = ShutdownSignal::new();
        assert!(!sig.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_interrupt_flag_shared_and_resettable() {
        let flag = InterruptFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_interrupted());
        flag.interrupt();
        assert!(clone.is_interrupted());
        clone.reset();
        assert!(!flag.is_interrupted());
    }
}
