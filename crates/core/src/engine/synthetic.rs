//! Deterministic stand-in engine.
//!
//! Models only the control flow the scheduler cares about: sequential program
//! counters, fixed-size blocks, periodic wait-for-interrupt, breakpoints,
//! scripted bus accesses, MMU faults and aborts. It executes no guest
//! semantics.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bus::AccessWidth;

use super::{EngineAbort, EngineHost, EngineLink, EngineResult, ExecutionEngine};

/// A bus access performed when the instruction at a given PC executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntheticAccess {
    /// Target address.
    pub address: u64,
    /// Access width.
    pub width: AccessWidth,
    /// Value to store; `None` for a load.
    pub store: Option<u64>,
}

/// Behaviour of a [`SyntheticEngine`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntheticEngineConfig {
    /// Instruction set name.
    #[serde(default = "SyntheticEngineConfig::default_architecture")]
    pub architecture: String,
    /// PC after reset.
    #[serde(default)]
    pub entry_pc: u64,
    /// Bytes per instruction.
    #[serde(default = "SyntheticEngineConfig::default_instruction_width")]
    pub instruction_width: u64,
    /// Instructions per translated block.
    #[serde(default = "SyntheticEngineConfig::default_block_size")]
    pub block_size: u32,
    /// Enter wait-for-interrupt after this many retired instructions.
    #[serde(default)]
    pub wfi_every: Option<u64>,
    /// Guest page size.
    #[serde(default = "SyntheticEngineConfig::default_page_size")]
    pub page_size: u64,
    /// Bus accesses keyed by the PC that issues them.
    #[serde(default)]
    pub accesses: BTreeMap<u64, SyntheticAccess>,
    /// PCs that raise an external MMU fault once.
    #[serde(default)]
    pub mmu_faults: BTreeSet<u64>,
    /// PC at which the engine aborts.
    #[serde(default)]
    pub abort_at: Option<u64>,
}

impl SyntheticEngineConfig {
    fn default_architecture() -> String {
        "synthetic".to_string()
    }

    const fn default_instruction_width() -> u64 {
        4
    }

    const fn default_block_size() -> u32 {
        8
    }

    const fn default_page_size() -> u64 {
        4096
    }
}

impl Default for SyntheticEngineConfig {
    fn default() -> Self {
        Self {
            architecture: Self::default_architecture(),
            entry_pc: 0,
            instruction_width: Self::default_instruction_width(),
            block_size: Self::default_block_size(),
            wfi_every: None,
            page_size: Self::default_page_size(),
            accesses: BTreeMap::new(),
            mmu_faults: BTreeSet::new(),
            abort_at: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct SyntheticState {
    pc: u64,
    retired: u64,
    since_wfi: u64,
    waiting: bool,
    pending_faults: BTreeSet<u64>,
}

/// Deterministic engine used by the CLI and by tests.
#[derive(Debug)]
pub struct SyntheticEngine {
    config: SyntheticEngineConfig,
    state: SyntheticState,
    executed_last: u64,
    translated_blocks: u64,
    link: Arc<EngineLink>,
}

impl SyntheticEngine {
    /// Creates an engine at `config.entry_pc`.
    pub fn new(config: SyntheticEngineConfig) -> Self {
        let state = Self::power_on(&config);
        Self {
            config,
            state,
            executed_last: 0,
            translated_blocks: 0,
            link: Arc::new(EngineLink::new()),
        }
    }

    fn power_on(config: &SyntheticEngineConfig) -> SyntheticState {
        SyntheticState {
            pc: config.entry_pc,
            pending_faults: config.mmu_faults.clone(),
            ..SyntheticState::default()
        }
    }

    /// Instructions retired since reset.
    pub const fn retired(&self) -> u64 {
        self.state.retired
    }

    /// Blocks translated since reset or the last cache flush.
    pub const fn translated_blocks(&self) -> u64 {
        self.translated_blocks
    }

    /// Whether the guest waits for an interrupt.
    pub const fn is_waiting_for_interrupt(&self) -> bool {
        self.state.waiting
    }

    fn perform_access(host: &mut dyn EngineHost, access: SyntheticAccess) -> bool {
        match access.store {
            Some(value) => host.write(access.address, access.width, value),
            None => host.read(access.address, access.width).is_some(),
        }
    }
}

impl ExecutionEngine for SyntheticEngine {
    fn attach(&mut self, link: Arc<EngineLink>) {
        self.link = link;
    }

    fn execute(
        &mut self,
        budget: u32,
        host: &mut dyn EngineHost,
    ) -> Result<EngineResult, EngineAbort> {
        self.executed_last = 0;
        if self.link.take_cache_flush() {
            self.translated_blocks = 0;
        }
        if self.state.waiting {
            if self.link.irq_mask() == 0 {
                return Ok(EngineResult::WaitingForInterrupt);
            }
            self.state.waiting = false;
        }

        let width = self.config.instruction_width;
        let budget = u64::from(budget);
        while self.executed_last < budget {
            if self.link.take_return_request() {
                return Ok(EngineResult::ReturnRequested);
            }
            let block_len = u64::from(self.config.block_size.max(1)).min(budget - self.executed_last);
            let block_start = self.state.pc;
            // Breakpoints are baked in when the block is translated, before the
            // block-begin hook can reinstall anything.
            let trap = (0..block_len).find(|i| self.link.has_breakpoint(block_start + i * width));
            self.translated_blocks += 1;

            if self.link.block_begin_hook_present()
                && !host.block_begin(block_start, u32::try_from(block_len).unwrap_or(u32::MAX))
            {
                return Ok(EngineResult::ReturnRequested);
            }

            let mut retired_in_block = 0u32;
            let mut stop = None;
            for i in 0..block_len {
                let pc = self.state.pc;
                if trap == Some(i) {
                    stop = Some(EngineResult::StoppedAtBreakpoint);
                    break;
                }
                if self.config.abort_at == Some(pc) {
                    if retired_in_block > 0 {
                        host.block_finished(block_start, retired_in_block);
                    }
                    return Err(EngineAbort::new(format!("abort at {pc:#x}")));
                }
                if self.state.pending_faults.remove(&pc) {
                    stop = Some(EngineResult::ExternalMmuFault);
                    break;
                }
                if let Some(access) = self.config.accesses.get(&pc).copied() {
                    let completed = Self::perform_access(host, access);
                    let restart = self.link.take_block_restart();
                    if !completed || restart {
                        stop = Some(EngineResult::StoppedAtWatchpoint);
                        break;
                    }
                }

                self.state.pc = pc.wrapping_add(width);
                self.state.retired += 1;
                self.executed_last += 1;
                retired_in_block += 1;

                if let Some(every) = self.config.wfi_every {
                    self.state.since_wfi += 1;
                    if self.state.since_wfi >= every && !self.link.wfi_as_nop() {
                        self.state.since_wfi = 0;
                        self.state.waiting = true;
                        stop = Some(EngineResult::WaitingForInterrupt);
                        break;
                    }
                }
            }
            if retired_in_block > 0 {
                host.block_finished(block_start, retired_in_block);
            }
            if let Some(result) = stop {
                return Ok(result);
            }
        }
        Ok(EngineResult::Ok)
    }

    fn executed_instructions(&self) -> u64 {
        self.executed_last
    }

    fn pc(&self) -> u64 {
        self.state.pc
    }

    fn set_pc(&mut self, pc: u64) {
        self.state.pc = pc;
        self.state.waiting = false;
    }

    fn reset(&mut self) {
        self.state = Self::power_on(&self.config);
        self.executed_last = 0;
        self.translated_blocks = 0;
    }

    fn export_state(&self) -> Vec<u8> {
        serde_json::to_vec(&self.state).unwrap_or_default()
    }

    fn import_state(&mut self, state: &[u8]) -> Result<(), EngineAbort> {
        self.state = serde_json::from_slice(state)
            .map_err(|e| EngineAbort::new(format!("bad synthetic state: {e}")))?;
        Ok(())
    }

    fn page_size(&self) -> u64 {
        self.config.page_size
    }

    fn architecture(&self) -> &str {
        &self.config.architecture
    }
}
