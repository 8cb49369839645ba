//! Decrement-to-zero completion latch

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Counts down to zero exactly once; waiters are released when the last
/// count arrives. Counts are never reused.
pub struct CountDownLatch {
    count: Mutex<u32>,
    cond: Condvar,
}

impl CountDownLatch {
    pub fn new(count: u32) -> Self {
        Self { count: Mutex::new(count), cond: Condvar::new() }
    }

    /// Record one completion; releases waiters on the final call
    pub fn count_down(&self) {
        let mut count = self.count.lock();
        debug_assert!(*count > 0, "latch counted down past zero");
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.cond.notify_all();
        }
    }

    pub fn count(&self) -> u32 {
        *self.count.lock()
    }

    /// Block until the count reaches zero
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.cond.wait(&mut count);
        }
    }

    /// Block until the count reaches zero or the timeout elapses.
    /// Returns true if the latch was released.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count > 0 {
            if self.cond.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}
