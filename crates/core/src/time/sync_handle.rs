//! Condition-variable based time handle.
//!
//! The source side grants one interval per round with [`SyncTimeHandle::grant`] and
//! waits for the sink with [`SyncTimeHandle::wait_until_done`]. The sink side is the
//! [`TimeHandle`] implementation used by a CPU thread.
//!
//! A grant is settled by the sink in one of two ways:
//! 1. **Continue:** the round is finished; unused time rolls into the next grant.
//! 2. **Break:** the sink stopped early; the remainder stays owed and is handed out
//!    again on the next request, without waiting for a new round.
//!
//! A sink that is disabled, disposed or not running never holds up its source.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::common::{EventList, SubscriptionId};

use super::{TimeHandle, TimeHandleCallback, TimeHandleEvent, TimeInterval};

#[derive(Debug, Default)]
struct HandleState {
    enabled: bool,
    deferred_enabled: Option<bool>,
    disposed: bool,
    pending: Option<TimeInterval>,
    leftover: TimeInterval,
    in_grant: bool,
    done: bool,
    interrupt_requested: bool,
    sink_active: bool,
    total_elapsed: TimeInterval,
    elapsed_in_round: TimeInterval,
}

/// Time handle whose source and sink rendezvous on a condition variable.
pub struct SyncTimeHandle {
    name: String,
    state: Mutex<HandleState>,
    changed: Condvar,
    pause_requested: EventList<()>,
    start_requested: EventList<()>,
}

impl SyncTimeHandle {
    /// Creates an enabled handle with no grant.
    ///
    /// # Arguments
    ///
    /// * `name` - Label used in trace output.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(HandleState {
                enabled: true,
                done: true,
                ..HandleState::default()
            }),
            changed: Condvar::new(),
            pause_requested: EventList::new(),
            start_requested: EventList::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Label of the handle.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Opens a new round with `interval` plus whatever rolled over from the last one.
    ///
    /// Returns `false` if the sink still owes the previous round; it then keeps only
    /// the remainder it is owed.
    pub fn grant(&self, interval: TimeInterval) -> bool {
        let start_sink = {
            let mut state = self.lock();
            if state.disposed {
                return false;
            }
            if let Some(enabled) = state.deferred_enabled.take() {
                state.enabled = enabled;
            }
            if !state.done {
                trace!(handle = %self.name, "sink still owes the previous round");
                return false;
            }
            let leftover = std::mem::take(&mut state.leftover);
            state.pending = Some(interval + leftover);
            state.done = false;
            state.elapsed_in_round = TimeInterval::EMPTY;
            self.changed.notify_all();
            state.enabled && !state.sink_active
        };
        if start_sink {
            self.start_requested.emit(&());
        }
        true
    }

    /// Blocks until the sink finished the round, stopped running or got disabled.
    ///
    /// Returns `false` if `timeout` passed first.
    pub fn wait_until_done(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.lock();
        while !state.disposed && state.enabled && state.sink_active && !state.done {
            match deadline {
                None => {
                    state = self
                        .changed
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    state = self
                        .changed
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
        true
    }

    /// Raises `PauseRequested` on the sink.
    pub fn request_pause(&self) {
        self.pause_requested.emit(&());
    }

    /// Raises `StartRequested` on the sink.
    pub fn request_start(&self) {
        self.start_requested.emit(&());
    }

    /// Wakes everyone blocked on this handle without changing the grant.
    pub fn unblock(&self) {
        let mut state = self.lock();
        state.interrupt_requested = true;
        self.changed.notify_all();
    }

    /// Whether the sink closed the current round.
    pub fn is_done(&self) -> bool {
        self.lock().done
    }

    /// Time granted but not yet requested by the sink.
    pub fn pending(&self) -> Option<TimeInterval> {
        self.lock().pending
    }

    /// Progress reported since the last grant.
    pub fn elapsed_in_round(&self) -> TimeInterval {
        self.lock().elapsed_in_round
    }

    /// Whether the sink thread is currently running.
    pub fn is_sink_active(&self) -> bool {
        self.lock().sink_active
    }
}

impl TimeHandle for SyncTimeHandle {
    fn request_time_interval(&self) -> Option<TimeInterval> {
        let mut state = self.lock();
        loop {
            if state.disposed {
                return None;
            }
            if state.interrupt_requested {
                state.interrupt_requested = false;
                return None;
            }
            if state.enabled {
                if let Some(interval) = state.pending.take() {
                    state.in_grant = true;
                    return Some(interval);
                }
            }
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn report_progress(&self, progress: TimeInterval) {
        let mut state = self.lock();
        state.total_elapsed += progress;
        state.elapsed_in_round += progress;
    }

    fn report_back_and_continue(&self, time_left: TimeInterval) {
        let mut state = self.lock();
        state.in_grant = false;
        state.leftover += time_left;
        state.done = true;
        self.changed.notify_all();
    }

    fn report_back_and_break(&self, time_left: TimeInterval) {
        let mut state = self.lock();
        state.in_grant = false;
        state.pending = Some(time_left);
        self.changed.notify_all();
    }

    fn interrupt(&self, timeout: Duration) -> bool {
        let mut state = self.lock();
        state.interrupt_requested = true;
        self.changed.notify_all();
        let (state, _) = self
            .changed
            .wait_timeout_while(state, timeout, |s| s.in_grant && !s.disposed)
            .unwrap_or_else(PoisonError::into_inner);
        !state.in_grant
    }

    fn set_enabled(&self, enabled: bool) {
        let mut state = self.lock();
        state.enabled = enabled;
        state.deferred_enabled = None;
        self.changed.notify_all();
    }

    fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    fn set_deferred_enabled(&self, enabled: bool) {
        let mut state = self.lock();
        if state.done || (state.pending.is_none() && !state.in_grant) {
            state.enabled = enabled;
            state.deferred_enabled = None;
            self.changed.notify_all();
        } else {
            state.deferred_enabled = Some(enabled);
        }
    }

    fn total_elapsed_time(&self) -> TimeInterval {
        self.lock().total_elapsed
    }

    fn set_sink_active(&self, active: bool) {
        let mut state = self.lock();
        state.sink_active = active;
        self.changed.notify_all();
    }

    fn subscribe(&self, event: TimeHandleEvent, callback: TimeHandleCallback) -> SubscriptionId {
        match event {
            TimeHandleEvent::PauseRequested => self.pause_requested.subscribe(move |_: &()| callback()),
            TimeHandleEvent::StartRequested => self.start_requested.subscribe(move |_: &()| callback()),
        }
    }

    fn unsubscribe(&self, event: TimeHandleEvent, id: SubscriptionId) -> bool {
        match event {
            TimeHandleEvent::PauseRequested => self.pause_requested.unsubscribe(id),
            TimeHandleEvent::StartRequested => self.start_requested.unsubscribe(id),
        }
    }

    fn dispose(&self) {
        {
            let mut state = self.lock();
            state.disposed = true;
            state.in_grant = false;
            self.changed.notify_all();
        }
        self.pause_requested.clear();
        self.start_requested.clear();
    }
}

impl std::fmt::Debug for SyncTimeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncTimeHandle")
            .field("name", &self.name)
            .field("state", &*self.lock())
            .finish_non_exhaustive()
    }
}
