//! Flat RAM-backed bus.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::warn;

use super::{Access, AccessWidth, BusController, Watchpoint, WatchpointCallback};

/// A single RAM region plus a symbol table and access watchpoints.
///
/// Unmapped reads return zero and unmapped writes are dropped, both with a warning.
#[derive(Debug)]
pub struct FlatBus {
    base: u64,
    memory: Mutex<Vec<u8>>,
    symbols: RwLock<BTreeMap<u64, (u64, String)>>,
    watchpoints: Mutex<HashMap<(u64, Access), Vec<Arc<Watchpoint>>>>,
}

impl FlatBus {
    /// Creates a zeroed RAM region.
    ///
    /// # Arguments
    ///
    /// * `base` - Address of the first byte.
    /// * `size` - Size in bytes.
    pub fn new(base: u64, size: usize) -> Self {
        Self {
            base,
            memory: Mutex::new(vec![0; size]),
            symbols: RwLock::new(BTreeMap::new()),
            watchpoints: Mutex::new(HashMap::new()),
        }
    }

    /// Base address of the RAM.
    pub const fn base(&self) -> u64 {
        self.base
    }

    fn offset(&self, address: u64, len: usize, size: usize) -> Option<usize> {
        let offset = usize::try_from(address.checked_sub(self.base)?).ok()?;
        (offset.checked_add(len)? <= size).then_some(offset)
    }

    /// Copies `data` into RAM. Returns `false` if it does not fit.
    pub fn load(&self, address: u64, data: &[u8]) -> bool {
        let mut memory = self.memory.lock().unwrap_or_else(PoisonError::into_inner);
        let size = memory.len();
        let Some(offset) = self.offset(address, data.len(), size) else {
            return false;
        };
        memory[offset..offset + data.len()].copy_from_slice(data);
        true
    }

    /// Registers a symbol covering `[start, start + size)`.
    pub fn add_symbol(&self, start: u64, size: u64, name: impl Into<String>) {
        let _ = self
            .symbols
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(start, (size, name.into()));
    }

    /// Registers a watchpoint and returns it.
    pub fn add_watchpoint(
        &self,
        address: u64,
        access: Access,
        callback: WatchpointCallback,
    ) -> Arc<Watchpoint> {
        let watchpoint = Arc::new(Watchpoint::new(callback));
        self.watchpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry((address, access))
            .or_default()
            .push(Arc::clone(&watchpoint));
        watchpoint
    }

    /// Removes every watchpoint at `address` for `access`.
    pub fn remove_watchpoints(&self, address: u64, access: Access) {
        let _ = self
            .watchpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(address, access));
    }
}

impl BusController for FlatBus {
    fn read(&self, address: u64, width: AccessWidth, cpu: Option<u32>) -> u64 {
        let memory = self.memory.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(offset) = self.offset(address, width.bytes(), memory.len()) else {
            warn!(address = format_args!("{address:#x}"), ?cpu, "read from unmapped address");
            return 0;
        };
        let mut bytes = [0u8; 8];
        bytes[..width.bytes()].copy_from_slice(&memory[offset..offset + width.bytes()]);
        u64::from_le_bytes(bytes)
    }

    fn write(&self, address: u64, width: AccessWidth, value: u64, cpu: Option<u32>) {
        let mut memory = self.memory.lock().unwrap_or_else(PoisonError::into_inner);
        let size = memory.len();
        let Some(offset) = self.offset(address, width.bytes(), size) else {
            warn!(address = format_args!("{address:#x}"), ?cpu, "write to unmapped address");
            return;
        };
        memory[offset..offset + width.bytes()].copy_from_slice(&value.to_le_bytes()[..width.bytes()]);
    }

    fn read_bytes(&self, address: u64, buffer: &mut [u8]) -> bool {
        let memory = self.memory.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(offset) = self.offset(address, buffer.len(), memory.len()) else {
            return false;
        };
        buffer.copy_from_slice(&memory[offset..offset + buffer.len()]);
        true
    }

    fn find_symbol(&self, address: u64) -> Option<String> {
        let symbols = self.symbols.read().unwrap_or_else(PoisonError::into_inner);
        let (start, (size, name)) = symbols.range(..=address).next_back()?;
        (address - start < *size).then(|| name.clone())
    }

    fn watchpoints_at(&self, address: u64, access: Access) -> Vec<Arc<Watchpoint>> {
        self.watchpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(address, access))
            .cloned()
            .unwrap_or_default()
    }
}
