//! Error definitions.
//!
//! This module defines the error taxonomy of the scheduler core. It provides:
//! 1. **Construction errors:** Invalid model names, bitness or performance values that
//!    prevent a CPU from being created at all.
//! 2. **Recoverable errors:** Invalid configuration, thread-affine calls made from the
//!    wrong thread, unsupported ELF images. The CPU keeps running.
//! 3. **Tracer errors:** I/O failures of the asynchronous trace writer.

use std::io;

use thiserror::Error;

/// Errors reported by CPUs, clusters and the machine orchestrator.
#[derive(Debug, Error)]
pub enum CpuError {
    /// The CPU could not be constructed.
    #[error("cannot construct CPU: {0}")]
    Construction(String),

    /// The requested register width is not supported.
    #[error("unsupported CPU bitness: {0} (expected 32 or 64)")]
    UnsupportedBitness(u32),

    /// A configuration value is out of range.
    #[error("invalid value for `{field}`: {reason}")]
    InvalidConfig {
        /// Name of the offending field.
        field: &'static str,
        /// Human readable explanation.
        reason: String,
    },

    /// A thread-affine operation was invoked from a thread that does not own the CPU.
    #[error("`{operation}` must be called from the CPU thread")]
    WrongThread {
        /// Name of the rejected operation.
        operation: &'static str,
    },

    /// The ELF image is wider than the CPU.
    #[error("unsupported ELF format - trying to load a {elf_bits}-bit ELF on a {cpu_bits}-bit machine")]
    UnsupportedElf {
        /// Bitness of the image.
        elf_bits: u32,
        /// Bitness of the CPU.
        cpu_bits: u32,
    },

    /// The ELF image could not be parsed.
    #[error("malformed ELF image: {0}")]
    Elf(#[from] object::read::Error),

    /// Adding the cluster would create a cycle.
    #[error("cluster `{child}` cannot be nested in `{parent}`: cycle detected")]
    ClusterCycle {
        /// Cluster being extended.
        parent: String,
        /// Cluster that was rejected.
        child: String,
    },

    /// The architecture has no interrupt line with this number.
    #[error("invalid interrupt number: {0}")]
    InvalidInterrupt(i32),

    /// A pause was ordered on the CPU thread while the engine ran, outside a bus
    /// access and outside a block hook.
    #[error("CPU {0} ordered a pause without entering the pause guard on this thread")]
    PauseOutsideGuard(u32),

    /// The operation needs a paused CPU.
    #[error("CPU {0} must be paused for this operation")]
    NotPaused(u32),

    /// The snapshot belongs to a different CPU or engine.
    #[error("snapshot mismatch: {0}")]
    SnapshotMismatch(String),

    /// The execution engine rejected a state blob.
    #[error("engine state rejected: {0}")]
    EngineState(String),

    /// The CPU thread could not be spawned.
    #[error("failed to spawn CPU thread")]
    ThreadSpawn(#[source] io::Error),

    /// Configuration could not be deserialized.
    #[error("configuration parse error")]
    ConfigParse(#[from] serde_json::Error),
}

/// Errors reported by the execution tracer.
#[derive(Debug, Error)]
pub enum TracerError {
    /// Trace file could not be created or written.
    #[error("trace output error")]
    Io(#[from] io::Error),

    /// The tracer was already stopped.
    #[error("tracer already stopped")]
    Stopped,

    /// The writer thread panicked before flushing.
    #[error("trace writer thread panicked")]
    WriterPanicked,
}
