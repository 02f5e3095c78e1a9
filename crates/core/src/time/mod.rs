//! Virtual time.
//!
//! This module provides:
//! 1. **Intervals:** [`TimeInterval`] with exact instruction/time conversion.
//! 2. **Contracts:** The [`TimeHandle`], [`ClockSource`] and [`HostTimeSync`] traits a CPU consumes.
//! 3. **Accounting:** [`QuantumAccount`], the residue bookkeeping of one quantum.
//! 4. **Reference implementations:** [`SyncTimeHandle`], [`QuantumTimeSource`], [`PeriodicClock`] and [`Sleeper`].

/// Periodic timer limits.
pub mod clock;
/// Time handle, clock and host synchronisation contracts.
pub mod handle;
/// Time intervals and conversions.
pub mod interval;
/// Per-quantum instruction accounting.
pub mod quantum;
/// Interruptible sleep.
pub mod sleeper;
/// Round-based time source.
pub mod source;
/// Condition-variable based time handle.
pub mod sync_handle;

pub use clock::PeriodicClock;
pub use handle::{
    ClockSource, HostTimeSync, NoLimitClock, TimeHandle, TimeHandleCallback, TimeHandleEvent,
    Unthrottled,
};
pub use interval::{TICKS_PER_MICROSECOND, TimeInterval};
pub use quantum::{QuantumAccount, Settlement};
pub use sleeper::Sleeper;
pub use source::QuantumTimeSource;
pub use sync_handle::SyncTimeHandle;
