//! Contracts between a CPU and the time framework.

use std::time::Duration;

use crate::common::SubscriptionId;

use super::TimeInterval;

/// Events a time source raises on a time handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeHandleEvent {
    /// The source wants the sink to stop executing.
    PauseRequested,
    /// The source granted time and wants the sink's thread running.
    StartRequested,
}

/// Callback registered for a [`TimeHandleEvent`].
pub type TimeHandleCallback = Box<dyn Fn() + Send + Sync>;

/// The sink side of a time handle, as seen by a CPU.
///
/// A handle grants intervals of virtual time to exactly one sink. The sink reports
/// progress within a grant and finally hands the grant back, either to continue
/// with the next quantum or to break and be owed the remainder.
pub trait TimeHandle: Send + Sync {
    /// Blocks until an interval is granted. Returns `None` when the handle is
    /// disabled, disposed or was interrupted while waiting.
    fn request_time_interval(&self) -> Option<TimeInterval>;

    /// Reports virtual time consumed within the current grant.
    fn report_progress(&self, progress: TimeInterval);

    /// Closes the current grant; `time_left` was not used and rolls over to the next quantum.
    fn report_back_and_continue(&self, time_left: TimeInterval);

    /// Closes the current grant early; `time_left` is still owed to the sink.
    fn report_back_and_break(&self, time_left: TimeInterval);

    /// Bounded-timeout probe used while pausing.
    ///
    /// Wakes a sink waiting for a grant and returns `true` once the sink is not
    /// inside a grant, or `false` if that did not happen within `timeout`.
    fn interrupt(&self, timeout: Duration) -> bool;

    /// Allows or forbids granting time immediately.
    fn set_enabled(&self, enabled: bool);

    /// Whether the handle currently grants time.
    fn is_enabled(&self) -> bool;

    /// Allows or forbids granting time from the next quantum on.
    fn set_deferred_enabled(&self, enabled: bool);

    /// Total virtual time reported through this handle.
    fn total_elapsed_time(&self) -> TimeInterval;

    /// Marks the sink thread as active or idle for the source's bookkeeping.
    fn set_sink_active(&self, active: bool);

    /// Registers a callback for `event`.
    fn subscribe(&self, event: TimeHandleEvent, callback: TimeHandleCallback) -> SubscriptionId;

    /// Removes a callback registered with [`TimeHandle::subscribe`].
    fn unsubscribe(&self, event: TimeHandleEvent, id: SubscriptionId) -> bool;

    /// Detaches the handle from its source and wakes every waiter.
    fn dispose(&self);
}

/// Source of the nearest timer limit.
pub trait ClockSource: Send + Sync {
    /// Virtual time until the soonest pending limit, or [`TimeInterval::MAX`] if none.
    fn nearest_limit_in(&self) -> TimeInterval;
}

/// Relation between virtual time and host time.
pub trait HostTimeSync: Send + Sync {
    /// Virtual time may run ahead of host time without sleeping.
    fn advance_immediately(&self) -> bool;

    /// How far virtual time is ahead of host time; empty when behind.
    fn virtual_time_ahead_of_host(&self) -> TimeInterval;
}

/// Clock with no timers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLimitClock;

impl ClockSource for NoLimitClock {
    fn nearest_limit_in(&self) -> TimeInterval {
        TimeInterval::MAX
    }
}

/// Host synchronisation that never throttles.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unthrottled;

impl HostTimeSync for Unthrottled {
    fn advance_immediately(&self) -> bool {
        true
    }

    fn virtual_time_ahead_of_host(&self) -> TimeInterval {
        TimeInterval::EMPTY
    }
}
