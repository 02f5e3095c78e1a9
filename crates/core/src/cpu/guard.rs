//! Precise-pause guard.
//!
//! While the engine executes, the CPU thread may only stop at two kinds of points:
//! a block boundary, or a bus access that has not yet performed its side effect.
//! The guard tracks the second kind:
//! 1. **Activity:** [`PauseGuard::enter`] and [`PauseGuard::leave`] bracket the engine call.
//! 2. **Initialization:** every bus access holds a [`GuardToken`] on the CPU thread for
//!    its duration. Only code running under a token may cancel the access.
//! 3. **Ordering:** a pause ordered while the guard is active but not initialized on
//!    the calling thread would stop in the middle of an instruction, and is refused.

use std::cell::RefCell;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::trace;

use crate::bus::{AccessWidth, Watchpoint};
use crate::engine::EngineLink;

thread_local! {
    static INITIALIZED: RefCell<HashSet<usize>> = RefCell::new(HashSet::new());
}

/// Tracks whether it is safe to cut the current instruction short.
#[derive(Debug, Default)]
pub struct PauseGuard {
    active: AtomicBool,
}

/// Marks the current thread as inside a guarded bus access until dropped.
#[derive(Debug)]
pub struct GuardToken<'a> {
    guard: &'a PauseGuard,
    nested: bool,
}

impl Drop for GuardToken<'_> {
    fn drop(&mut self) {
        if !self.nested {
            let key = self.guard.key();
            INITIALIZED.with(|set| {
                let _ = set.borrow_mut().remove(&key);
            });
        }
    }
}

impl PauseGuard {
    /// Creates an inactive guard.
    pub fn new() -> Self {
        Self::default()
    }

    fn key(&self) -> usize {
        std::ptr::from_ref(self) as usize
    }

    /// The engine call begins.
    pub fn enter(&self) {
        self.active.store(true, Ordering::Release);
    }

    /// The engine call returned.
    pub fn leave(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Whether the engine is executing.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Marks the calling thread as inside a bus access.
    pub fn initialize(&self) -> GuardToken<'_> {
        let key = self.key();
        let nested = INITIALIZED.with(|set| !set.borrow_mut().insert(key));
        GuardToken {
            guard: self,
            nested,
        }
    }

    /// Whether the calling thread holds a token of this guard.
    pub fn is_initialized(&self) -> bool {
        let key = self.key();
        INITIALIZED.with(|set| set.borrow().contains(&key))
    }

    /// Whether a pause ordered now would stop at a precise point.
    ///
    /// # Arguments
    ///
    /// * `inside_block_hook` - The caller runs inside a block hook, which is a block boundary.
    pub fn may_order_pause(&self, inside_block_hook: bool) -> bool {
        !self.is_active() || inside_block_hook || self.is_initialized()
    }

    /// Runs the watchpoints hit by an access and decides whether to cancel it.
    ///
    /// Outside an engine call the watchpoints simply run and the access proceeds.
    /// Inside one, enabled watchpoints are disabled and run, and the access is
    /// cancelled with a block restart so it is retried after any pause they ordered.
    /// On the retry all watchpoints are disabled; they are re-enabled and the access
    /// goes through.
    ///
    /// Returns `true` if the access must not perform its side effect.
    pub fn intercept(
        &self,
        watchpoints: &[Arc<Watchpoint>],
        link: &EngineLink,
        cpu: u32,
        address: u64,
        width: AccessWidth,
        value: u64,
    ) -> bool {
        if watchpoints.is_empty() {
            return false;
        }
        if !self.is_active() {
            for watchpoint in watchpoints.iter().filter(|w| w.is_enabled()) {
                watchpoint.invoke(cpu, address, width, value);
            }
            return false;
        }

        let enabled: Vec<_> = watchpoints.iter().filter(|w| w.is_enabled()).collect();
        if enabled.is_empty() {
            for watchpoint in watchpoints {
                watchpoint.set_enabled(true);
            }
            return false;
        }
        for watchpoint in &enabled {
            watchpoint.set_enabled(false);
        }
        for watchpoint in enabled {
            watchpoint.invoke(cpu, address, width, value);
        }
        trace!(cpu, address = format_args!("{address:#x}"), "watchpoint hit, restarting block");
        link.request_block_restart();
        true
    }
}
