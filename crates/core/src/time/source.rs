//! Round-based time source.
//!
//! Every round grants the same quantum to all registered handles, waits until
//! each sink has used it (or stopped running) and then advances the shared
//! clock. Sinks never see the next round before every other sink finished the
//! current one, which bounds the skew between CPUs to one quantum.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::{HostTimeSync, PeriodicClock, SyncTimeHandle, TimeInterval};

/// Grants fixed quanta to a set of [`SyncTimeHandle`]s.
#[derive(Debug)]
pub struct QuantumTimeSource {
    quantum: TimeInterval,
    handles: Mutex<Vec<Arc<SyncTimeHandle>>>,
    clock: Arc<PeriodicClock>,
    elapsed: AtomicU64,
    advance_immediately: AtomicBool,
    host_start: Mutex<Option<Instant>>,
}

impl QuantumTimeSource {
    /// Creates a source.
    ///
    /// # Arguments
    ///
    /// * `quantum` - Interval granted to every handle per round.
    /// * `clock` - Clock advanced after every round.
    /// * `advance_immediately` - Do not throttle virtual time to host time.
    pub fn new(quantum: TimeInterval, clock: Arc<PeriodicClock>, advance_immediately: bool) -> Self {
        Self {
            quantum,
            handles: Mutex::new(Vec::new()),
            clock,
            elapsed: AtomicU64::new(0),
            advance_immediately: AtomicBool::new(advance_immediately),
            host_start: Mutex::new(None),
        }
    }

    /// Creates and registers a new handle.
    pub fn new_handle(&self, name: impl Into<String>) -> Arc<SyncTimeHandle> {
        let handle = Arc::new(SyncTimeHandle::new(name));
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&handle));
        handle
    }

    /// Unregisters `handle`. Returns `false` if it was not registered.
    pub fn remove_handle(&self, handle: &Arc<SyncTimeHandle>) -> bool {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        let before = handles.len();
        handles.retain(|h| !Arc::ptr_eq(h, handle));
        handles.len() != before
    }

    /// Quantum granted per round.
    pub const fn quantum(&self) -> TimeInterval {
        self.quantum
    }

    /// Virtual time of all completed rounds.
    pub fn elapsed_virtual_time(&self) -> TimeInterval {
        TimeInterval::from_ticks(self.elapsed.load(Ordering::Acquire))
    }

    /// Shared clock.
    pub fn clock(&self) -> &Arc<PeriodicClock> {
        &self.clock
    }

    /// Switches host-time throttling.
    pub fn set_advance_immediately(&self, value: bool) {
        self.advance_immediately.store(value, Ordering::Release);
    }

    fn snapshot(&self) -> Vec<Arc<SyncTimeHandle>> {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Runs one round and returns the virtual time it advanced.
    pub fn run_round(&self) -> TimeInterval {
        let _ = self
            .host_start
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert_with(Instant::now);

        let handles = self.snapshot();
        for handle in &handles {
            if !handle.grant(self.quantum) {
                trace!(handle = handle.name(), "handle skipped this round");
            }
        }
        for handle in &handles {
            let _ = handle.wait_until_done(None);
        }
        let _ = self
            .elapsed
            .fetch_add(self.quantum.ticks(), Ordering::AcqRel);
        self.clock.advance(self.quantum);
        trace!(elapsed = %self.elapsed_virtual_time(), "round finished");

        if !self.advance_immediately.load(Ordering::Acquire) {
            let ahead = self.virtual_time_ahead_of_host();
            if !ahead.is_empty() {
                std::thread::sleep(ahead.to_duration());
            }
        }
        self.quantum
    }

    /// Runs `rounds` rounds and returns the virtual time they advanced.
    pub fn run_rounds(&self, rounds: u64) -> TimeInterval {
        let mut total = TimeInterval::EMPTY;
        for _ in 0..rounds {
            total += self.run_round();
        }
        debug!(rounds, virtual_time = %total, "time source ran");
        total
    }

    /// Raises `PauseRequested` on every handle.
    pub fn request_pause(&self) {
        for handle in self.snapshot() {
            handle.request_pause();
        }
    }

    /// Wakes every sink and source waiter.
    pub fn unblock_all(&self) {
        for handle in self.snapshot() {
            handle.unblock();
        }
    }

    /// Waits for every sink, with a bound on each wait.
    pub fn wait_for_sinks(&self, timeout: Duration) -> bool {
        self.snapshot()
            .iter()
            .all(|handle| handle.wait_until_done(Some(timeout)))
    }
}

impl HostTimeSync for QuantumTimeSource {
    fn advance_immediately(&self) -> bool {
        self.advance_immediately.load(Ordering::Acquire)
    }

    fn virtual_time_ahead_of_host(&self) -> TimeInterval {
        let host = self
            .host_start
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map_or(TimeInterval::EMPTY, |start| {
                TimeInterval::from_duration(start.elapsed())
            });
        self.elapsed_virtual_time().saturating_sub(host)
    }
}
