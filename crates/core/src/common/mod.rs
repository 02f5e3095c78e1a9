//! Common utilities and types shared by every part of the scheduler.
//!
//! This module provides:
//! 1. **Error Handling:** The [`CpuError`] and [`TracerError`] taxonomies.
//! 2. **Events:** Observer lists used for `Halted`, `StateChanged` and time-handle events.
//! 3. **Identifiers:** The orchestrator-owned [`InstanceCounter`].

/// Error types.
pub mod error;

/// Registrable callback lists.
pub mod events;

pub use error::{CpuError, TracerError};
pub use events::{EventList, SubscriptionId};

use std::sync::atomic::{AtomicU32, Ordering};

/// Monotonic counter handing out per-instance identifiers.
///
/// Owned by the orchestrator rather than being a process-wide static, so several
/// independent machines in one process never share numbering.
#[derive(Debug, Default)]
pub struct InstanceCounter {
    next: AtomicU32,
}

impl InstanceCounter {
    /// Creates a counter starting at zero.
    pub const fn new() -> Self {
        Self {
            next: AtomicU32::new(0),
        }
    }

    /// Returns the next identifier.
    pub fn allocate(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of identifiers handed out so far.
    pub fn allocated(&self) -> u32 {
        self.next.load(Ordering::Relaxed)
    }
}
