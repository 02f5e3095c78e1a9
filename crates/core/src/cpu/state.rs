//! Value types describing a CPU and its execution.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::common::CpuError;

/// Register width of a CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Bitness {
    /// 32-bit registers.
    #[default]
    Bits32,
    /// 64-bit registers.
    Bits64,
}

impl Bitness {
    /// Width in bits.
    pub const fn bits(self) -> u32 {
        match self {
            Self::Bits32 => 32,
            Self::Bits64 => 64,
        }
    }
}

impl TryFrom<u32> for Bitness {
    type Error = CpuError;

    fn try_from(bits: u32) -> Result<Self, Self::Error> {
        match bits {
            32 => Ok(Self::Bits32),
            64 => Ok(Self::Bits64),
            other => Err(CpuError::UnsupportedBitness(other)),
        }
    }
}

impl From<Bitness> for u32 {
    fn from(bitness: Bitness) -> Self {
        bitness.bits()
    }
}

/// Byte order of a CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    /// Least significant byte first.
    #[default]
    Little,
    /// Most significant byte first.
    Big,
}

/// Emulation-level state, reported through `StateChanged`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CpuState {
    /// Created or reset, not yet running.
    #[default]
    InReset,
    /// Resumed at least once since the last reset.
    Running,
    /// The engine aborted; only reconstruction recovers the CPU.
    Aborted,
}

/// Why a CPU stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HaltReason {
    /// Paused by a user, a hook or the halted flag.
    Pause,
    /// Aborted or disposed.
    Abort,
    /// Waiting for the next step command.
    Step,
}

/// Payload of the `Halted` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaltArguments {
    /// Reason of the halt.
    pub reason: HaltReason,
    /// Multiprocessing id of the CPU.
    pub cpu_id: u32,
    /// Address that caused the halt, if any.
    pub address: Option<u64>,
}

impl HaltArguments {
    /// Arguments without an address.
    pub const fn new(reason: HaltReason, cpu_id: u32) -> Self {
        Self {
            reason,
            cpu_id,
            address: None,
        }
    }

    /// Arguments pointing at `address`.
    pub const fn at(reason: HaltReason, cpu_id: u32, address: u64) -> Self {
        Self {
            reason,
            cpu_id,
            address: Some(address),
        }
    }
}

/// Payload of the `StateChanged` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    /// Multiprocessing id of the CPU.
    pub cpu_id: u32,
    /// State before the transition.
    pub old: CpuState,
    /// State after the transition.
    pub new: CpuState,
}

/// How the CPU thread consumes time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// Run whole quanta.
    #[default]
    Continuous,
    /// Execute one instruction per step command; time keeps flowing between steps.
    SingleStepBlocking,
    /// Execute one instruction per step command; the CPU counts as halted between steps.
    SingleStepNonBlocking,
}

impl ExecutionMode {
    /// Whether this is one of the stepping modes.
    pub const fn is_single_step(self) -> bool {
        matches!(self, Self::SingleStepBlocking | Self::SingleStepNonBlocking)
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Continuous => "Continuous",
            Self::SingleStepBlocking => "SingleStepBlocking",
            Self::SingleStepNonBlocking => "SingleStepNonBlocking",
        };
        f.write_str(name)
    }
}

/// Outcome of one `execute_instructions` call as seen by the execution loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExecutionResult {
    /// The budget was used up.
    #[default]
    Ok,
    /// A return request cut the call short.
    Interrupted,
    /// The guest idles until an interrupt arrives.
    WaitingForInterrupt,
    /// A breakpoint stopped execution.
    StoppedAtBreakpoint,
    /// A watchpoint cancelled an access.
    StoppedAtWatchpoint,
    /// An external MMU reported a fault.
    ExternalMmuFault,
    /// The engine aborted.
    Aborted,
}
