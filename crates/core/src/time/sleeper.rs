//! Interruptible wall-clock sleep.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Sleeps on a condition variable so another thread can cut the sleep short.
#[derive(Debug, Default)]
pub struct Sleeper {
    interrupted: Mutex<bool>,
    wakeup: Condvar,
}

impl Sleeper {
    /// Creates a sleeper with no pending interrupt.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleeps for up to `duration`.
    ///
    /// Returns whether the full duration elapsed and how long the call actually slept.
    /// A pending interrupt ends the sleep immediately. It is consumed unless
    /// `preserve_interrupt_request` is set, in which case the next sleep is cut short too.
    ///
    /// # Arguments
    ///
    /// * `duration` - Requested sleep time.
    /// * `preserve_interrupt_request` - Leave the interrupt pending for the next sleep.
    pub fn sleep(&self, duration: Duration, preserve_interrupt_request: bool) -> (bool, Duration) {
        let start = Instant::now();
        let guard = self
            .interrupted
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (mut guard, timeout) = self
            .wakeup
            .wait_timeout_while(guard, duration, |interrupted| !*interrupted)
            .unwrap_or_else(PoisonError::into_inner);
        let completed = timeout.timed_out();
        if !completed && !preserve_interrupt_request {
            *guard = false;
        }
        (completed, start.elapsed().min(duration))
    }

    /// Ends the current sleep, or the next one if nobody is sleeping.
    pub fn interrupt(&self) {
        let mut interrupted = self
            .interrupted
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *interrupted = true;
        self.wakeup.notify_all();
    }

    /// Drops a pending interrupt.
    pub fn clear(&self) {
        *self
            .interrupted
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = false;
    }
}
