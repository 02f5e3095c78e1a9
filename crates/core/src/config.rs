//! Configuration system for the scheduler.
//!
//! This module defines all configuration structures used to build a machine. It provides:
//! 1. **Defaults:** Baseline performance, pause probing, quantum and tracer constants.
//! 2. **Structures:** Hierarchical config for the machine, its CPUs and the execution tracer.
//! 3. **Validation:** `Config::validate` rejects values the scheduler cannot run with.
//!
//! Configuration is supplied as JSON (see `Config::from_json`) or built with `Config::default()`.

use serde::{Deserialize, Serialize};

use crate::common::CpuError;
use crate::cpu::{Bitness, Endianness};
use crate::tracer::TraceFormat;

/// Default configuration constants.
mod defaults {
    /// Default CPU performance in instructions per microsecond.
    pub const PERFORMANCE_IN_MIPS: u64 = 100;

    /// Timeout of a single `TimeHandle::interrupt` probe while pausing, in milliseconds.
    pub const PAUSE_PROBE_TIMEOUT_MS: u64 = 10;

    /// Number of unsuccessful pause probes after which a warning is logged.
    ///
    /// Repeated failures usually mean the CPU is in a long engine call, or the
    /// start/pause handoff is stuck.
    pub const PAUSE_PROBE_WARN_AFTER: u32 = 100;

    /// Quantum granted to every CPU per round, in microseconds.
    pub const QUANTUM_US: u64 = 100;

    /// Trace buffer size after which the writer flushes (64 KiB).
    pub const FLUSH_THRESHOLD_BYTES: usize = 64 * 1024;

    /// Capacity of the per-tracer opcode disassembly cache.
    pub const OPCODE_CACHE_CAPACITY: usize = 4096;

    /// Default machine name used in thread names.
    pub const MACHINE_NAME: &str = "machine-0";

    /// Default CPU model name.
    pub const CPU_MODEL: &str = "synthetic";
}

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Machine-wide settings.
    #[serde(default)]
    pub machine: MachineConfig,
    /// One entry per CPU.
    #[serde(default)]
    pub cpus: Vec<CpuConfig>,
    /// Execution tracer settings.
    #[serde(default)]
    pub tracer: TracerConfig,
}

impl Config {
    /// Parses a configuration from JSON and validates it.
    ///
    /// # Arguments
    ///
    /// * `json` - The JSON document.
    pub fn from_json(json: &str) -> Result<Self, CpuError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every value is usable.
    pub fn validate(&self) -> Result<(), CpuError> {
        if self.machine.quantum_us == 0 {
            return Err(CpuError::InvalidConfig {
                field: "machine.quantum_us",
                reason: "quantum must be positive".to_string(),
            });
        }
        for cpu in &self.cpus {
            cpu.validate()?;
        }
        if self.tracer.opcode_cache_capacity == 0 {
            return Err(CpuError::InvalidConfig {
                field: "tracer.opcode_cache_capacity",
                reason: "cache capacity must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Machine-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Machine name, used as the prefix of CPU thread names.
    #[serde(default = "MachineConfig::default_name")]
    pub name: String,

    /// Quantum granted per round, in microseconds.
    #[serde(default = "MachineConfig::default_quantum_us")]
    pub quantum_us: u64,

    /// Let virtual time run ahead of host time without sleeping.
    #[serde(default = "MachineConfig::default_advance_immediately")]
    pub advance_immediately: bool,

    /// Periods of the machine timers, in microseconds. They bound instruction bursts.
    #[serde(default)]
    pub timer_periods_us: Vec<u64>,
}

impl MachineConfig {
    fn default_name() -> String {
        defaults::MACHINE_NAME.to_string()
    }

    fn default_quantum_us() -> u64 {
        defaults::QUANTUM_US
    }

    /// Virtual time is not throttled to host time unless asked for.
    fn default_advance_immediately() -> bool {
        true
    }
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            name: defaults::MACHINE_NAME.to_string(),
            quantum_us: defaults::QUANTUM_US,
            advance_immediately: true,
            timer_periods_us: Vec::new(),
        }
    }
}

/// Per-CPU settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuConfig {
    /// Multiprocessing id. Not required to be unique.
    #[serde(default)]
    pub id: u32,

    /// Model name.
    #[serde(default = "CpuConfig::default_model")]
    pub model: String,

    /// Register width.
    #[serde(default)]
    pub bitness: Bitness,

    /// Byte order.
    #[serde(default)]
    pub endianness: Endianness,

    /// Instructions per microsecond.
    #[serde(default = "CpuConfig::default_performance_in_mips")]
    pub performance_in_mips: u64,

    /// Treat wait-for-interrupt as a no-op instead of idling.
    #[serde(default)]
    pub never_wait_for_interrupt: bool,

    /// Do not forward interrupts while single-stepping (unless the CPU waits for one).
    #[serde(default)]
    pub disable_interrupts_while_stepping: bool,

    /// Peripherals run in lock-step with the CPU, so interrupts need no wakeup.
    #[serde(default)]
    pub synchronized_io: bool,

    /// Timeout of a single pause probe, in milliseconds.
    #[serde(default = "CpuConfig::default_pause_probe_timeout_ms")]
    pub pause_probe_timeout_ms: u64,

    /// Failed probes between two "slow pause" warnings.
    #[serde(default = "CpuConfig::default_pause_probe_warn_after")]
    pub pause_probe_warn_after: u32,
}

impl CpuConfig {
    fn default_model() -> String {
        defaults::CPU_MODEL.to_string()
    }

    fn default_performance_in_mips() -> u64 {
        defaults::PERFORMANCE_IN_MIPS
    }

    fn default_pause_probe_timeout_ms() -> u64 {
        defaults::PAUSE_PROBE_TIMEOUT_MS
    }

    fn default_pause_probe_warn_after() -> u32 {
        defaults::PAUSE_PROBE_WARN_AFTER
    }

    /// Checks the construction-time invariants of a CPU.
    pub fn validate(&self) -> Result<(), CpuError> {
        if self.model.trim().is_empty() {
            return Err(CpuError::Construction("CPU model was empty".to_string()));
        }
        if self.performance_in_mips == 0 {
            return Err(CpuError::InvalidConfig {
                field: "performance_in_mips",
                reason: "performance must be positive".to_string(),
            });
        }
        if self.pause_probe_timeout_ms == 0 {
            return Err(CpuError::InvalidConfig {
                field: "pause_probe_timeout_ms",
                reason: "probe timeout must be positive".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            id: 0,
            model: defaults::CPU_MODEL.to_string(),
            bitness: Bitness::default(),
            endianness: Endianness::default(),
            performance_in_mips: defaults::PERFORMANCE_IN_MIPS,
            never_wait_for_interrupt: false,
            disable_interrupts_while_stepping: false,
            synchronized_io: false,
            pause_probe_timeout_ms: defaults::PAUSE_PROBE_TIMEOUT_MS,
            pause_probe_warn_after: defaults::PAUSE_PROBE_WARN_AFTER,
        }
    }
}

/// Execution tracer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracerConfig {
    /// Output style.
    #[serde(default)]
    pub format: TraceFormat,

    /// Buffered bytes after which the writer flushes.
    #[serde(default = "TracerConfig::default_flush_threshold_bytes")]
    pub flush_threshold_bytes: usize,

    /// Entries of the opcode disassembly cache.
    #[serde(default = "TracerConfig::default_opcode_cache_capacity")]
    pub opcode_cache_capacity: usize,
}

impl TracerConfig {
    fn default_flush_threshold_bytes() -> usize {
        defaults::FLUSH_THRESHOLD_BYTES
    }

    fn default_opcode_cache_capacity() -> usize {
        defaults::OPCODE_CACHE_CAPACITY
    }
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            format: TraceFormat::default(),
            flush_threshold_bytes: defaults::FLUSH_THRESHOLD_BYTES,
            opcode_cache_capacity: defaults::OPCODE_CACHE_CAPACITY,
        }
    }
}
