//! System bus contract.
//!
//! The scheduler consumes the bus through a narrow interface:
//! 1. **Accesses:** Byte, word, double-word and quad-word reads and writes carrying the
//!    id of the CPU that issued them.
//! 2. **Symbols:** Lookup of the symbol containing an address, for logging.
//! 3. **Watchpoints:** Access hooks that the precise-pause guard consults before an
//!    access performs its side effect.

/// Flat RAM-backed reference bus.
pub mod flat;

pub use flat::FlatBus;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

/// Width of a bus access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessWidth {
    /// 8 bits.
    Byte,
    /// 16 bits.
    Word,
    /// 32 bits.
    DoubleWord,
    /// 64 bits.
    QuadWord,
}

impl AccessWidth {
    /// Access size in bytes.
    pub const fn bytes(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::Word => 2,
            Self::DoubleWord => 4,
            Self::QuadWord => 8,
        }
    }
}

/// Direction of a bus access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Access {
    /// Load.
    Read,
    /// Store.
    Write,
}

/// Callback of a watchpoint: `(cpu id, address, width, value)`. Reads pass `0`.
pub type WatchpointCallback = Arc<dyn Fn(u32, u64, AccessWidth, u64) + Send + Sync>;

/// An access hook with an enable flag.
///
/// The precise-pause guard disables enabled watchpoints before invoking them so the
/// retried access passes through, and re-enables them on the next hit.
pub struct Watchpoint {
    enabled: AtomicBool,
    callback: WatchpointCallback,
}

impl Watchpoint {
    /// Creates an enabled watchpoint.
    pub fn new(callback: WatchpointCallback) -> Self {
        Self {
            enabled: AtomicBool::new(true),
            callback,
        }
    }

    /// Whether the watchpoint fires on the next access.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Enables or disables the watchpoint.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Runs the callback.
    pub fn invoke(&self, cpu: u32, address: u64, width: AccessWidth, value: u64) {
        (self.callback)(cpu, address, width, value);
    }
}

impl fmt::Debug for Watchpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watchpoint")
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}

/// The bus as seen by CPUs.
pub trait BusController: Send + Sync {
    /// Reads `width` bytes at `address`, little endian.
    fn read(&self, address: u64, width: AccessWidth, cpu: Option<u32>) -> u64;

    /// Writes `width` bytes at `address`, little endian.
    fn write(&self, address: u64, width: AccessWidth, value: u64, cpu: Option<u32>);

    /// Copies memory into `buffer`. Returns `false` if any byte is unmapped.
    fn read_bytes(&self, address: u64, buffer: &mut [u8]) -> bool;

    /// Name of the symbol containing `address`.
    fn find_symbol(&self, address: u64) -> Option<String>;

    /// Watchpoints registered for `access` at `address`.
    fn watchpoints_at(&self, address: u64, access: Access) -> Vec<Arc<Watchpoint>>;
}
