//! Counting latch used as a completion barrier.
//!
//! Callers `count_up` before starting an asynchronous operation, the
//! completion path calls `count_down`, and `wait` blocks until the count
//! returns to zero. Unlike `std::sync::Barrier` the count is dynamic, and
//! unlike a channel there is nothing to transfer.

use std::sync::{Condvar, Mutex};

/// Dynamic counting latch.
#[derive(Debug)]
pub struct Latch {
    count: Mutex<isize>,
    zeroed: Condvar,
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl Latch {
    /// Create a latch with a count of zero. A fresh latch is already
    /// "complete": `wait` returns immediately until `count_up` is called.
    pub const fn new() -> Self {
        Self {
            count: Mutex::new(0),
            zeroed: Condvar::new(),
        }
    }

    /// Block until the count reaches zero.
    pub fn wait(&self) {
        let mut count = self.count.lock().expect("latch mutex poisoned");
        while *count != 0 {
            count = self.zeroed.wait(count).expect("latch mutex poisoned");
        }
    }

    /// Increment the count.
    pub fn count_up(&self) {
        *self.count.lock().expect("latch mutex poisoned") += 1;
    }

    /// Decrement the count, waking waiters when it reaches zero.
    pub fn count_down(&self) {
        let mut count = self.count.lock().expect("latch mutex poisoned");
        *count -= 1;
        if *count == 0 {
            self.zeroed.notify_all();
        }
    }
}
