//! CPU lifecycle, execution driver and translation layer.
//!
//! This module provides:
//! 1. **Lifecycle:** [`CpuCore`], the started/paused/aborted state machine with its
//!    pause-wins protocol.
//! 2. **Stepping:** [`Synchronizer`], the step rendezvous between a driver and the CPU thread.
//! 3. **Driver:** [`Cpu`], which owns the CPU thread and negotiates time with a time handle.
//! 4. **Translation layer:** [`TranslationCpu`], breakpoint hooks, the precise-pause guard,
//!    interrupt aggregation and snapshots on top of an execution engine.

/// The seam between the driver and a CPU flavour.
pub mod backend;
/// Execution driver.
pub mod base;
/// Lifecycle state machine.
pub mod core;
/// Precise-pause guard.
pub mod guard;
/// Breakpoint hook registry.
pub mod hooks;
/// Interrupt decoding and aggregation.
pub mod interrupts;
/// Serializable CPU state.
pub mod snapshot;
/// CPU value types.
pub mod state;
/// Single-step rendezvous.
pub mod synchronizer;
/// Translation-engine backed CPU.
pub mod translation;

pub use self::backend::CpuBackend;
pub use self::base::{Cpu, WeakCpu};
pub use self::core::{CpuCore, Transition};
pub use self::guard::{GuardToken, PauseGuard};
pub use self::hooks::{HookCallback, HookTable};
pub use self::interrupts::{
    DefaultInterruptDecoder, InterruptAggregator, InterruptCategory, InterruptDecoder,
};
pub use self::snapshot::CpuSnapshot;
pub use self::state::{
    Bitness, CpuState, Endianness, ExecutionMode, ExecutionResult, HaltArguments, HaltReason,
    StateChange,
};
pub use self::synchronizer::Synchronizer;
pub use self::translation::{BlockHook, TranslationBackend, TranslationCpu};
