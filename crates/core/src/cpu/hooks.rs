//! Breakpoint hook registry.
//!
//! Installing a hook places a breakpoint in the engine's table. After a hook fires
//! it is deactivated, so the engine can retranslate its address and move past it,
//! and reactivated at the next block boundary. New hooks are only activated in
//! bulk before an engine call.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{trace, warn};

use crate::engine::EngineLink;

use super::TranslationCpu;

/// Breakpoint callback: `(cpu, address)`. Identity is the `Arc` pointer.
pub type HookCallback = Arc<dyn Fn(&TranslationCpu, u64) + Send + Sync>;

struct HookDescriptor {
    callbacks: Vec<HookCallback>,
    active: bool,
}

impl HookDescriptor {
    fn activate(&mut self, address: u64, link: &EngineLink) {
        if !self.active {
            link.add_breakpoint(address);
            self.active = true;
        }
    }

    fn deactivate(&mut self, address: u64, link: &EngineLink) {
        if self.active {
            link.remove_breakpoint(address);
            self.active = false;
        }
    }
}

#[derive(Default)]
struct HookState {
    descriptors: BTreeMap<u64, HookDescriptor>,
    pending_activation: BTreeSet<u64>,
    inactive: BTreeSet<u64>,
}

impl HookState {
    fn forget(&mut self, address: u64) {
        let _ = self.descriptors.remove(&address);
        let _ = self.pending_activation.remove(&address);
        let _ = self.inactive.remove(&address);
    }
}

/// Address-to-callbacks table backed by the engine's breakpoint set.
pub struct HookTable {
    link: Arc<EngineLink>,
    state: Mutex<HookState>,
}

impl HookTable {
    /// Creates an empty table installing breakpoints into `link`.
    pub fn new(link: Arc<EngineLink>) -> Self {
        Self {
            link,
            state: Mutex::new(HookState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HookState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `callback` at `address`. The breakpoint is installed by the next
    /// [`HookTable::activate_new`].
    pub fn add(&self, address: u64, callback: HookCallback) {
        let mut state = self.lock();
        state
            .descriptors
            .entry(address)
            .or_insert_with(|| HookDescriptor {
                callbacks: Vec::new(),
                active: false,
            })
            .callbacks
            .push(callback);
        let _ = state.pending_activation.insert(address);
        trace!(address = format_args!("{address:#x}"), "hook added");
    }

    /// Removes one callback. Warns and returns `false` if it is not registered there.
    pub fn remove(&self, address: u64, callback: &HookCallback) -> bool {
        let mut state = self.lock();
        let Some(descriptor) = state.descriptors.get_mut(&address) else {
            warn!(address = format_args!("{address:#x}"), "no hook registered at this address");
            return false;
        };
        let before = descriptor.callbacks.len();
        descriptor.callbacks.retain(|cb| !Arc::ptr_eq(cb, callback));
        if descriptor.callbacks.len() == before {
            warn!(address = format_args!("{address:#x}"), "hook not registered at this address");
            return false;
        }
        if descriptor.callbacks.is_empty() {
            descriptor.deactivate(address, &self.link);
            state.forget(address);
        }
        true
    }

    /// Removes every callback at `address`.
    pub fn remove_at(&self, address: u64) {
        let mut state = self.lock();
        if let Some(descriptor) = state.descriptors.get_mut(&address) {
            descriptor.deactivate(address, &self.link);
        }
        state.forget(address);
    }

    /// Removes `callback` from every address. Returns how many registrations went away.
    pub fn remove_callback(&self, callback: &HookCallback) -> usize {
        let mut state = self.lock();
        let mut removed = 0;
        let mut emptied = Vec::new();
        for (&address, descriptor) in &mut state.descriptors {
            let before = descriptor.callbacks.len();
            descriptor.callbacks.retain(|cb| !Arc::ptr_eq(cb, callback));
            removed += before - descriptor.callbacks.len();
            if descriptor.callbacks.is_empty() {
                descriptor.deactivate(address, &self.link);
                emptied.push(address);
            }
        }
        for address in emptied {
            state.forget(address);
        }
        removed
    }

    /// Removes every hook.
    pub fn clear(&self) {
        let mut state = self.lock();
        for (&address, descriptor) in &mut state.descriptors {
            descriptor.deactivate(address, &self.link);
        }
        *state = HookState::default();
    }

    /// Installs the breakpoints of hooks added since the last call.
    pub fn activate_new(&self) {
        let mut state = self.lock();
        let pending = std::mem::take(&mut state.pending_activation);
        for address in pending {
            // Deactivated after firing; reinstalled at the next block boundary.
            if state.inactive.contains(&address) {
                continue;
            }
            if let Some(descriptor) = state.descriptors.get_mut(&address) {
                descriptor.activate(address, &self.link);
            }
        }
    }

    /// Removes the breakpoint at `address` until the next [`HookTable::reactivate`].
    pub fn deactivate(&self, address: u64) {
        let mut state = self.lock();
        if let Some(descriptor) = state.descriptors.get_mut(&address) {
            if descriptor.active {
                descriptor.deactivate(address, &self.link);
                let _ = state.inactive.insert(address);
            }
        }
    }

    /// Reinstalls every deactivated breakpoint.
    pub fn reactivate(&self) {
        let mut state = self.lock();
        if state.inactive.is_empty() {
            return;
        }
        let inactive = std::mem::take(&mut state.inactive);
        for address in inactive {
            if let Some(descriptor) = state.descriptors.get_mut(&address) {
                descriptor.activate(address, &self.link);
            }
        }
    }

    /// Whether some breakpoint waits for reactivation.
    pub fn has_inactive(&self) -> bool {
        !self.lock().inactive.is_empty()
    }

    /// Snapshot of the callbacks at `address`, safe to run while the table changes.
    pub fn callbacks_at(&self, address: u64) -> Vec<HookCallback> {
        self.lock()
            .descriptors
            .get(&address)
            .map(|d| d.callbacks.clone())
            .unwrap_or_default()
    }

    /// Addresses with at least one hook.
    pub fn addresses(&self) -> Vec<u64> {
        self.lock().descriptors.keys().copied().collect()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().descriptors.is_empty()
    }
}

impl std::fmt::Debug for HookTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("HookTable")
            .field("addresses", &state.descriptors.keys().collect::<Vec<_>>())
            .field("inactive", &state.inactive)
            .finish()
    }
}
