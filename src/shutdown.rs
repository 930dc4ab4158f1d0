//! Process-wide shutdown signal.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// One-shot shutdown flag shared by the driver and the publisher
/// workers. Every blocking wait in the process goes through
/// [`Shutdown::wait_timeout`] so a signal is observed promptly.
#[derive(Default)]
pub struct Shutdown {
    flag: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown and wake all waiters.
    pub fn signal(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let _guard = self.mutex.lock();
        self.condvar.notify_all();
    }

    pub fn is_signaled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep for up to `timeout`. Returns `true` when shutdown has been
    /// signaled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_signaled() {
            return true;
        }
        let mut guard = self.mutex.lock();
        if self.is_signaled() {
            return true;
        }
        self.condvar.wait_for(&mut guard, timeout);
        self.is_signaled()
    }
}
