//! One-shot readiness signal.
//!
//! The latch starts closed and opens exactly once, when bootstrap has
//! finished populating the world. Everything the bootstrap task wrote
//! before [`ReadinessLatch::fire`] is visible to a thread that returns
//! from [`ReadinessLatch::wait`], because both sides go through the same
//! mutex.

#[cfg(test)]
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Monotonic false-to-true flag with blocking waiters.
#[derive(Debug, Default)]
pub struct ReadinessLatch {
    ready: Mutex<bool>,
    opened: Condvar,
}

impl ReadinessLatch {
    /// Create a closed latch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the latch and wake every waiter.
    ///
    /// Returns `true` on the call that actually opened it; later calls are
    /// no-ops returning `false`.
    pub fn fire(&self) -> bool {
        let mut ready = self.ready.lock();
        if *ready {
            return false;
        }
        *ready = true;
        drop(ready);
        self.opened.notify_all();
        true
    }

    /// Whether the latch has been opened.
    pub fn is_ready(&self) -> bool {
        *self.ready.lock()
    }

    /// Block until the latch is open. Returns immediately if it already is.
    pub fn wait(&self) {
        let mut ready = self.ready.lock();
        while !*ready {
            self.opened.wait(&mut ready);
        }
    }

    /// Block until the latch opens or `timeout` elapses.
    ///
    /// Returns whether the latch is open.
    #[cfg(test)]
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut ready = self.ready.lock();
        if !*ready {
            let _ = self
                .opened
                .wait_while_for(&mut ready, |ready| !*ready, timeout);
        }
        *ready
    }
}
