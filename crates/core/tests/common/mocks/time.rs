use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tempo_core::common::{EventList, SubscriptionId};
use tempo_core::time::{TimeHandle, TimeHandleCallback, TimeHandleEvent, TimeInterval};

/// Calls recorded once they exceed this many are dropped, so a CPU spinning on an
/// unlimited grant does not grow the log without bound.
const CALL_LOG_LIMIT: usize = 4096;

/// One report made by the CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeCall {
    Progress(TimeInterval),
    Continue(TimeInterval),
    Break(TimeInterval),
}

#[derive(Default)]
struct Script {
    grants: VecDeque<TimeInterval>,
    unlimited: Option<TimeInterval>,
    owed: Option<TimeInterval>,
    requests: Vec<TimeInterval>,
    calls: Vec<TimeCall>,
    enabled: bool,
    interrupted: bool,
    disposed: bool,
    in_grant: bool,
    sink_active: bool,
    total: TimeInterval,
}

/// Time handle fed from a queue of grants.
///
/// A break keeps the remainder owed and hands it out on the next request, like the
/// quantum source does. Enabling through `set_deferred_enabled` applies immediately.
pub struct ScriptedTimeHandle {
    script: Mutex<Script>,
    changed: Condvar,
    pause_requested: EventList<()>,
    start_requested: EventList<()>,
}

impl Default for ScriptedTimeHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTimeHandle {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(Script {
                enabled: true,
                ..Script::default()
            }),
            changed: Condvar::new(),
            pause_requested: EventList::new(),
            start_requested: EventList::new(),
        }
    }

    /// A handle granting `interval` on every request.
    pub fn unlimited(interval: TimeInterval) -> Self {
        let handle = Self::new();
        handle.lock().unlimited = Some(interval);
        handle
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(script: &mut Script, call: TimeCall) {
        if script.calls.len() < CALL_LOG_LIMIT {
            script.calls.push(call);
        }
    }

    /// Queues one grant and wakes a waiting CPU.
    pub fn grant(&self, interval: TimeInterval) {
        self.lock().grants.push_back(interval);
        self.changed.notify_all();
    }

    /// Reports made so far.
    pub fn calls(&self) -> Vec<TimeCall> {
        self.lock().calls.clone()
    }

    /// Intervals handed out so far.
    pub fn requests(&self) -> Vec<TimeInterval> {
        self.lock().requests.clone()
    }

    /// Sum of the progress reports.
    pub fn reported_progress(&self) -> TimeInterval {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                TimeCall::Progress(t) => Some(*t),
                _ => None,
            })
            .fold(TimeInterval::EMPTY, |acc, t| acc + t)
    }

    pub fn is_sink_active(&self) -> bool {
        self.lock().sink_active
    }

    pub fn is_disposed(&self) -> bool {
        self.lock().disposed
    }

    /// Waits until the recorded calls satisfy `predicate`.
    pub fn wait_for(&self, timeout: Duration, predicate: impl Fn(&[TimeCall]) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut script = self.lock();
        loop {
            if predicate(&script.calls) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            script = self
                .changed
                .wait_timeout(script, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Waits until a report closes a grant with `report_back_and_continue`.
    pub fn wait_for_continue(&self, timeout: Duration) -> bool {
        self.wait_for(timeout, |calls| {
            calls.iter().any(|c| matches!(c, TimeCall::Continue(_)))
        })
    }

    pub fn request_pause(&self) {
        self.pause_requested.emit(&());
    }

    pub fn request_start(&self) {
        self.start_requested.emit(&());
    }
}

impl TimeHandle for ScriptedTimeHandle {
    fn request_time_interval(&self) -> Option<TimeInterval> {
        let mut script = self.lock();
        loop {
            if script.disposed {
                return None;
            }
            if script.interrupted {
                script.interrupted = false;
                return None;
            }
            if script.enabled {
                let next = script
                    .owed
                    .take()
                    .or_else(|| script.grants.pop_front())
                    .or(script.unlimited);
                if let Some(interval) = next {
                    script.in_grant = true;
                    script.requests.push(interval);
                    return Some(interval);
                }
            }
            script = self
                .changed
                .wait(script)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn report_progress(&self, progress: TimeInterval) {
        let mut script = self.lock();
        script.total += progress;
        Self::record(&mut script, TimeCall::Progress(progress));
        self.changed.notify_all();
    }

    fn report_back_and_continue(&self, time_left: TimeInterval) {
        let mut script = self.lock();
        script.in_grant = false;
        Self::record(&mut script, TimeCall::Continue(time_left));
        self.changed.notify_all();
    }

    fn report_back_and_break(&self, time_left: TimeInterval) {
        let mut script = self.lock();
        script.in_grant = false;
        script.owed = Some(time_left);
        Self::record(&mut script, TimeCall::Break(time_left));
        self.changed.notify_all();
    }

    fn interrupt(&self, timeout: Duration) -> bool {
        let mut script = self.lock();
        script.interrupted = true;
        self.changed.notify_all();
        let (script, _) = self
            .changed
            .wait_timeout_while(script, timeout, |s| s.in_grant && !s.disposed)
            .unwrap_or_else(PoisonError::into_inner);
        !script.in_grant
    }

    fn set_enabled(&self, enabled: bool) {
        self.lock().enabled = enabled;
        self.changed.notify_all();
    }

    fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    fn set_deferred_enabled(&self, enabled: bool) {
        self.set_enabled(enabled);
    }

    fn total_elapsed_time(&self) -> TimeInterval {
        self.lock().total
    }

    fn set_sink_active(&self, active: bool) {
        self.lock().sink_active = active;
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
            let mut script = self.lock();
            script.disposed = true;
            script.in_grant = false;
        }
        self.changed.notify_all();
        self.pause_requested.clear();
        self.start_requested.clear();
    }
}
