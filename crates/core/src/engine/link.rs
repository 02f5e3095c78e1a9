//! Requests shared between a CPU and its engine.
//!
//! The CPU thread holds the engine exclusively while it executes. Anything
//! another thread (or a hook running inside `execute`) wants the engine to
//! observe is written here and polled by the engine at block boundaries.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Request table consulted by the engine.
#[derive(Debug, Default)]
pub struct EngineLink {
    return_requested: AtomicBool,
    restart_block: AtomicBool,
    flush_cache: AtomicBool,
    irq_mask: AtomicU32,
    block_begin_hook: AtomicBool,
    wfi_as_nop: AtomicBool,
    breakpoints: Mutex<BTreeSet<u64>>,
    breakpoint_generation: AtomicU64,
}

impl EngineLink {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks the engine to return at the next block boundary.
    pub fn request_return(&self) {
        self.return_requested.store(true, Ordering::Release);
    }

    /// Consumes a pending return request.
    pub fn take_return_request(&self) -> bool {
        self.return_requested.swap(false, Ordering::AcqRel)
    }

    /// Whether a return request is pending.
    pub fn is_return_requested(&self) -> bool {
        self.return_requested.load(Ordering::Acquire)
    }

    /// Asks the engine to abandon the current block and retranslate at the current PC.
    pub fn request_block_restart(&self) {
        self.restart_block.store(true, Ordering::Release);
    }

    /// Consumes a pending block restart.
    pub fn take_block_restart(&self) -> bool {
        self.restart_block.swap(false, Ordering::AcqRel)
    }

    /// Asks the engine to drop all translated code.
    pub fn request_cache_flush(&self) {
        self.flush_cache.store(true, Ordering::Release);
    }

    /// Consumes a pending cache flush.
    pub fn take_cache_flush(&self) -> bool {
        self.flush_cache.swap(false, Ordering::AcqRel)
    }

    /// Sets or clears an interrupt category bit.
    pub fn set_irq(&self, category: u32, asserted: bool) {
        if asserted {
            let _ = self.irq_mask.fetch_or(category, Ordering::AcqRel);
        } else {
            let _ = self.irq_mask.fetch_and(!category, Ordering::AcqRel);
        }
    }

    /// Asserted interrupt categories.
    pub fn irq_mask(&self) -> u32 {
        self.irq_mask.load(Ordering::Acquire)
    }

    /// Enables or disables the block-begin callback.
    pub fn set_block_begin_hook_present(&self, present: bool) {
        self.block_begin_hook.store(present, Ordering::Release);
    }

    /// Whether the engine must call `block_begin`.
    pub fn block_begin_hook_present(&self) -> bool {
        self.block_begin_hook.load(Ordering::Acquire)
    }

    /// Makes wait-for-interrupt instructions retire as no-ops.
    pub fn set_wfi_as_nop(&self, value: bool) {
        self.wfi_as_nop.store(value, Ordering::Release);
    }

    /// Whether wait-for-interrupt instructions retire as no-ops.
    pub fn wfi_as_nop(&self) -> bool {
        self.wfi_as_nop.load(Ordering::Acquire)
    }

    /// Installs a breakpoint.
    pub fn add_breakpoint(&self, address: u64) {
        let inserted = self
            .breakpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address);
        if inserted {
            let _ = self.breakpoint_generation.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Removes a breakpoint.
    pub fn remove_breakpoint(&self, address: u64) {
        let removed = self
            .breakpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&address);
        if removed {
            let _ = self.breakpoint_generation.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Whether a breakpoint is installed at `address`.
    pub fn has_breakpoint(&self, address: u64) -> bool {
        self.breakpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&address)
    }

    /// Installed breakpoints, sorted.
    pub fn breakpoints(&self) -> Vec<u64> {
        self.breakpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    /// Counter bumped on every breakpoint change.
    pub fn breakpoint_generation(&self) -> u64 {
        self.breakpoint_generation.load(Ordering::Acquire)
    }
}
