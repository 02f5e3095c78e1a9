//! Least Recently Used cache of disassembled opcodes.
//!
//! Disassembly of most instructions only depends on the opcode bits, so it is cached
//! per opcode. Results the decoder marks as pc-relative bypass the cache. Keys
//! are the raw little-endian opcode; only instructions of at most 4 bytes are
//! cacheable, longer ones are disassembled every time.
//!
//! # Performance
//!
//! - `get()`: O(C) where C is the capacity, for the usage stack update
//! - `insert()`: O(C)

use std::collections::{HashMap, VecDeque};

use super::Disassembled;

/// Widest cacheable instruction, in bytes.
pub const MAX_CACHEABLE_SIZE: usize = 4;

/// Bounded opcode cache.
#[derive(Debug)]
pub struct OpcodeCache {
    capacity: usize,
    entries: HashMap<u64, Disassembled>,
    /// Front is the most recently used opcode, back the least recently used.
    usage: VecDeque<u64>,
    hits: u64,
    misses: u64,
}

impl OpcodeCache {
    /// Creates an empty cache.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Maximum number of opcodes kept. At least one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            usage: VecDeque::with_capacity(capacity),
            hits: 0,
            misses: 0,
        }
    }

    /// Cache key of `bytes`, or `None` if the instruction is too wide to cache.
    pub fn key(bytes: &[u8]) -> Option<u64> {
        if bytes.is_empty() || bytes.len() > MAX_CACHEABLE_SIZE {
            return None;
        }
        let mut raw = [0u8; MAX_CACHEABLE_SIZE];
        raw[..bytes.len()].copy_from_slice(bytes);
        // Distinguish a 2-byte opcode from a 4-byte one with zero upper half.
        Some(u64::from(u32::from_le_bytes(raw)) | ((bytes.len() as u64) << 32))
    }

    fn touch(&mut self, key: u64) {
        if let Some(pos) = self.usage.iter().position(|&k| k == key) {
            let _ = self.usage.remove(pos);
        }
        self.usage.push_front(key);
    }

    /// Looks up an opcode and marks it most recently used.
    pub fn get(&mut self, key: u64) -> Option<Disassembled> {
        let found = self.entries.get(&key).cloned();
        if found.is_some() {
            self.hits += 1;
            self.touch(key);
        } else {
            self.misses += 1;
        }
        found
    }

    /// Stores an opcode, evicting the least recently used one when full.
    pub fn insert(&mut self, key: u64, value: Disassembled) {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            if let Some(victim) = self.usage.pop_back() {
                let _ = self.entries.remove(&victim);
            }
        }
        let _ = self.entries.insert(key, value);
        self.touch(key);
    }

    /// Cached opcodes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Successful lookups.
    pub const fn hits(&self) -> u64 {
        self.hits
    }

    /// Failed lookups.
    pub const fn misses(&self) -> u64 {
        self.misses
    }
}
