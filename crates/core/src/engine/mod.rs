//! Execution-engine contract.
//!
//! The engine translates and runs guest code. The scheduler treats it as an
//! opaque synchronous service called from the CPU thread only:
//! 1. **Execution:** `execute(budget, host)` runs at most `budget` instructions and
//!    returns a result code.
//! 2. **Host callbacks:** While executing, the engine calls back into the CPU through
//!    [`EngineHost`] for block hooks and bus accesses.
//! 3. **Shared table:** Requests that other threads make while the engine runs
//!    (return requests, breakpoints, interrupt lines) go through an [`EngineLink`].

/// Shared request table between the CPU and its engine.
pub mod link;
/// Explicit FFI binding table for native engines.
pub mod native;
/// Deterministic stand-in engine.
pub mod synthetic;

pub use link::EngineLink;
pub use native::{EngineBindings, HostCallbacks, NativeEngine};
pub use synthetic::{SyntheticEngine, SyntheticEngineConfig};

use std::sync::Arc;

use thiserror::Error;

use crate::bus::AccessWidth;

/// Result codes returned by an engine's `execute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineResult {
    /// The budget was used up.
    Ok,
    /// The guest idles until an interrupt arrives.
    WaitingForInterrupt,
    /// Execution stopped before an instruction with an installed breakpoint.
    StoppedAtBreakpoint,
    /// A watchpoint cancelled an access; the instruction will be retried.
    StoppedAtWatchpoint,
    /// A return request ended execution early.
    ReturnRequested,
    /// An external MMU reported a fault.
    ExternalMmuFault,
}

impl EngineResult {
    /// Native result code.
    pub const fn code(self) -> u32 {
        match self {
            Self::Ok => 0x10000,
            Self::WaitingForInterrupt => 0x10001,
            Self::StoppedAtBreakpoint => 0x10002,
            Self::StoppedAtWatchpoint => 0x10004,
            Self::ReturnRequested => 0x10005,
            Self::ExternalMmuFault => 0x10006,
        }
    }

    /// Decodes a native result code.
    pub const fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0x10000 => Self::Ok,
            0x10001 => Self::WaitingForInterrupt,
            0x10002 => Self::StoppedAtBreakpoint,
            0x10004 => Self::StoppedAtWatchpoint,
            0x10005 => Self::ReturnRequested,
            0x10006 => Self::ExternalMmuFault,
            _ => return None,
        })
    }
}

/// The engine hit an unrecoverable guest or engine condition.
#[derive(Debug, Clone, Error)]
#[error("engine aborted: {reason}")]
pub struct EngineAbort {
    /// Human readable cause.
    pub reason: String,
}

impl EngineAbort {
    /// Creates an abort with `reason`.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Callbacks an engine makes into its CPU while executing.
pub trait EngineHost {
    /// Called before a translated block runs, when the block-begin hook is present.
    ///
    /// Returns `false` if the engine should stop before the block.
    fn block_begin(&mut self, pc: u64, size: u32) -> bool;

    /// Called after a block retired `executed` instructions starting at `pc`.
    fn block_finished(&mut self, pc: u64, executed: u32);

    /// Guest load. `None` means a watchpoint cancelled the access and the block
    /// must be restarted.
    fn read(&mut self, address: u64, width: AccessWidth) -> Option<u64>;

    /// Guest store. `false` means a watchpoint cancelled the access.
    fn write(&mut self, address: u64, width: AccessWidth, value: u64) -> bool;
}

/// The translation engine of one CPU.
pub trait ExecutionEngine: Send {
    /// Connects the engine to its CPU's request table.
    fn attach(&mut self, link: Arc<EngineLink>);

    /// Runs at most `budget` instructions.
    fn execute(
        &mut self,
        budget: u32,
        host: &mut dyn EngineHost,
    ) -> Result<EngineResult, EngineAbort>;

    /// Instructions retired by the last `execute` call.
    fn executed_instructions(&self) -> u64;

    /// Current program counter.
    fn pc(&self) -> u64;

    /// Sets the program counter.
    fn set_pc(&mut self, pc: u64);

    /// Returns the engine to its power-on state.
    fn reset(&mut self);

    /// Serialises the engine state into an opaque blob.
    fn export_state(&self) -> Vec<u8>;

    /// Restores a blob produced by `export_state`.
    fn import_state(&mut self, state: &[u8]) -> Result<(), EngineAbort>;

    /// Guest page size in bytes.
    fn page_size(&self) -> u64;

    /// Instruction set name, used to name engine instances.
    fn architecture(&self) -> &str;
}
