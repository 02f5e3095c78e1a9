//! Lifecycle state machine shared by every schedulable compute unit.
//!
//! States are `NotStarted -> Running <-> Paused`, with `Aborted` reachable from any
//! state and terminal. The flags are atomics so other threads can test them
//! without locking, but they only change while the pause lock is held, through a
//! [`Transition`].
//!
//! A blocking pause issued from a foreign thread marks itself as in progress and
//! then waits for the CPU thread *without* holding the lock. Anyone who wants to
//! start the CPU in the meantime sees the marker and backs off: pausing always
//! wins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct PauseState {
    pause_in_progress: bool,
}

/// Started/paused/aborted flags plus the pause lock.
#[derive(Debug)]
pub struct CpuCore {
    started: AtomicBool,
    paused: AtomicBool,
    aborted: AtomicBool,
    pause_lock: Mutex<PauseState>,
    pause_finished: Condvar,
}

/// Proof that the pause lock is held. Lifecycle flags change only through it.
#[derive(Debug)]
pub struct Transition<'a> {
    core: &'a CpuCore,
    state: MutexGuard<'a, PauseState>,
}

impl Transition<'_> {
    /// Sets the started flag.
    pub fn set_started(&mut self, started: bool) {
        self.core.started.store(started, Ordering::Release);
    }

    /// Sets the paused flag.
    pub fn set_paused(&mut self, paused: bool) {
        self.core.paused.store(paused, Ordering::Release);
    }

    /// Marks a foreign-thread pause as running until [`CpuCore::finish_pause`].
    pub fn mark_pause_in_progress(&mut self) {
        debug_assert!(
            !self.state.pause_in_progress,
            "two blocking pauses in flight on one CPU"
        );
        self.state.pause_in_progress = true;
    }

    /// Whether a foreign-thread pause is still waiting for the CPU thread.
    pub fn is_pause_in_progress(&self) -> bool {
        self.state.pause_in_progress
    }
}

impl Default for CpuCore {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuCore {
    /// A core that was never started. It counts as paused.
    pub fn new() -> Self {
        Self {
            started: AtomicBool::new(false),
            paused: AtomicBool::new(true),
            aborted: AtomicBool::new(false),
            pause_lock: Mutex::new(PauseState::default()),
            pause_finished: Condvar::new(),
        }
    }

    /// Whether the core was resumed at least once since the last dispose.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Whether the core is paused.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Whether the core was aborted.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Acquires the pause lock.
    pub fn lock(&self) -> Transition<'_> {
        Transition {
            core: self,
            state: self.pause_lock.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Acquires the pause lock unless a foreign-thread pause is in flight.
    ///
    /// If one is, this waits for it to finish and returns `None`; on the CPU thread
    /// it returns `None` immediately, since the pause is waiting for that very thread.
    pub fn lock_unless_pausing(&self, on_cpu_thread: bool) -> Option<Transition<'_>> {
        let mut transition = self.lock();
        if !transition.state.pause_in_progress {
            return Some(transition);
        }
        if !on_cpu_thread {
            transition.state = self
                .pause_finished
                .wait_while(transition.state, |s| s.pause_in_progress)
                .unwrap_or_else(PoisonError::into_inner);
        }
        None
    }

    /// Clears the marker set by [`Transition::mark_pause_in_progress`].
    pub fn finish_pause(&self) {
        let mut transition = self.lock();
        debug_assert!(
            transition.state.pause_in_progress,
            "pause finished without being marked"
        );
        transition.state.pause_in_progress = false;
        self.pause_finished.notify_all();
    }

    /// Resumes the core and runs `on_resume` under the pause lock.
    ///
    /// No-op, returning `false`, if the core is aborted, already running, or a
    /// concurrent pause wins the race.
    ///
    /// # Arguments
    ///
    /// * `on_cpu_thread` - Whether the caller is the CPU thread.
    /// * `on_resume` - Subclass hook, e.g. starting the execution thread.
    pub fn resume(&self, on_cpu_thread: bool, on_resume: impl FnOnce(&mut Transition<'_>)) -> bool {
        if self.is_aborted() || !self.is_paused() {
            return false;
        }
        let Some(mut transition) = self.lock_unless_pausing(on_cpu_thread) else {
            return false;
        };
        if self.is_aborted() || !self.is_paused() {
            return false;
        }
        transition.set_started(true);
        transition.set_paused(false);
        on_resume(&mut transition);
        true
    }

    /// Makes the core permanently unusable.
    pub fn abort(&self) {
        let _transition = self.lock();
        self.aborted.store(true, Ordering::Release);
    }

    /// Clears the aborted flag; used by reset.
    pub fn clear_abort(&self) {
        let _transition = self.lock();
        self.aborted.store(false, Ordering::Release);
    }
}
