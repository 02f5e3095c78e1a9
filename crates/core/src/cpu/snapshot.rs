//! Serializable CPU state.

use serde::{Deserialize, Serialize};

use crate::common::CpuError;

/// State of a translation CPU. The engine blob is opaque and copied verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuSnapshot {
    /// Instruction set of the engine that produced the blob.
    pub architecture: String,
    /// Multiprocessing id of the CPU.
    pub cpu_id: u32,
    /// Program counter.
    pub pc: u64,
    /// Instructions executed since reset.
    pub executed_instructions: u64,
    /// Instructions skipped since creation.
    pub skipped_instructions: u64,
    /// Engine state as returned by `export_state`.
    pub engine_state: Vec<u8>,
}

impl CpuSnapshot {
    /// Serializes the snapshot as JSON.
    pub fn to_json(&self) -> Result<String, CpuError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a snapshot produced by [`CpuSnapshot::to_json`].
    pub fn from_json(json: &str) -> Result<Self, CpuError> {
        Ok(serde_json::from_str(json)?)
    }
}
