//! Periodic timer limits.

use std::sync::atomic::{AtomicU64, Ordering};

use super::{ClockSource, TimeInterval};

/// Clock source backed by a fixed set of periodic timers.
///
/// Every timer fires at each multiple of its period. The nearest limit is the
/// time until the next firing of any timer.
#[derive(Debug, Default)]
pub struct PeriodicClock {
    periods: Vec<TimeInterval>,
    elapsed: AtomicU64,
}

impl PeriodicClock {
    /// Creates a clock; zero-length periods are ignored.
    ///
    /// # Arguments
    ///
    /// * `periods` - Timer periods.
    pub fn new(periods: impl IntoIterator<Item = TimeInterval>) -> Self {
        Self {
            periods: periods.into_iter().filter(|p| !p.is_empty()).collect(),
            elapsed: AtomicU64::new(0),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, interval: TimeInterval) {
        let _ = self
            .elapsed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |e| {
                Some(e.saturating_add(interval.ticks()))
            });
    }

    /// Virtual time since the clock was created.
    pub fn elapsed(&self) -> TimeInterval {
        TimeInterval::from_ticks(self.elapsed.load(Ordering::Acquire))
    }
}

impl ClockSource for PeriodicClock {
    fn nearest_limit_in(&self) -> TimeInterval {
        let elapsed = self.elapsed.load(Ordering::Acquire);
        self.periods
            .iter()
            .map(|period| {
                let p = period.ticks();
                TimeInterval::from_ticks(p - elapsed % p)
            })
            .min()
            .unwrap_or(TimeInterval::MAX)
    }
}
