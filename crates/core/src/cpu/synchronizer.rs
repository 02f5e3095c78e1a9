//! Single-step rendezvous between a driver thread and the CPU thread.
//!
//! The driver hands out a step count with [`Synchronizer::command_step`] and blocks in
//! [`Synchronizer::wait_for_step_finished`]. The CPU thread blocks in
//! [`Synchronizer::wait_for_step_command`] before each burst and acknowledges every
//! executed step. Disabling the synchronizer wakes every waiter, so a mode change
//! never leaves a thread blocked.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use tracing::trace;

#[derive(Debug, Default)]
struct StepState {
    enabled: bool,
    counter: u32,
}

/// Condition-variable based step gate.
#[derive(Debug, Default)]
pub struct Synchronizer {
    guard: Mutex<StepState>,
    changed: Condvar,
}

impl Synchronizer {
    /// Creates a disabled synchronizer with no pending steps.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StepState> {
        self.guard.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether stepping is active.
    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    /// Turns stepping on or off. Turning it off wakes all waiters.
    pub fn set_enabled(&self, enabled: bool) {
        let mut state = self.lock();
        state.enabled = enabled;
        if !enabled {
            self.changed.notify_all();
        }
    }

    /// Steps not yet acknowledged by the CPU thread.
    pub fn pending_steps(&self) -> u32 {
        self.lock().counter
    }

    /// Hands out `count` steps and wakes the CPU thread.
    pub fn command_step(&self, count: u32) {
        let mut state = self.lock();
        state.counter = count;
        trace!(count, "step commanded");
        self.changed.notify_all();
    }

    /// Blocks while stepping is enabled and no step is pending.
    ///
    /// Returns `false` if stepping was disabled, meaning the caller must recheck
    /// its loop condition instead of executing.
    pub fn wait_for_step_command(&self) -> bool {
        let state = self
            .changed
            .wait_while(self.lock(), |s| s.enabled && s.counter == 0)
            .unwrap_or_else(PoisonError::into_inner);
        state.enabled
    }

    /// Acknowledges one executed step.
    pub fn step_finished(&self) {
        let mut state = self.lock();
        if state.counter > 0 {
            state.counter -= 1;
            if state.counter == 0 {
                self.changed.notify_all();
            }
        }
    }

    /// Blocks while steps are pending and stepping is enabled.
    ///
    /// Disabling stepping releases the driver even with steps left, since no CPU
    /// thread will acknowledge them anymore.
    pub fn wait_for_step_finished(&self) {
        let _state = self
            .changed
            .wait_while(self.lock(), |s| s.enabled && s.counter > 0)
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Drops all pending steps after an abnormal burst and wakes the driver.
    pub fn step_interrupted(&self) {
        let mut state = self.lock();
        state.counter = 0;
        self.changed.notify_all();
    }
}
