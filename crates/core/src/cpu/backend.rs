//! The seam between the generic execution driver and a concrete CPU flavour.

use std::any::Any;
use std::sync::Arc;

use crate::common::CpuError;

use super::{Cpu, ExecutionMode, ExecutionResult};

/// What a CPU flavour provides to the execution driver in [`Cpu`].
///
/// Every method except the register accessors is called from the CPU thread or
/// with the CPU paused.
pub trait CpuBackend: Send + Sync + 'static {
    /// Instruction set name.
    fn architecture(&self) -> &str;

    /// Executes at most `budget` instructions on the CPU thread.
    ///
    /// Returns the result and the number of instructions actually executed, which
    /// never exceeds `budget`.
    fn execute_instructions(&self, cpu: &Cpu, budget: u64) -> (ExecutionResult, u64);

    /// Post-processes a result. Returning `true` ends the current burst.
    fn execution_finished(&self, _cpu: &Cpu, _result: ExecutionResult) -> bool {
        false
    }

    /// Asks a running `execute_instructions` to return as soon as possible.
    fn request_return(&self);

    /// Checks that pausing from the CPU thread is allowed right now.
    fn order_pause(&self, _cpu: &Cpu) -> Result<(), CpuError> {
        Ok(())
    }

    /// Program counter.
    fn pc(&self) -> u64;

    /// Sets the program counter.
    fn set_pc(&self, pc: u64);

    /// Instructions executed since reset.
    fn executed_instructions(&self) -> u64;

    /// Returns the flavour to its power-on state.
    fn reset(&self);

    /// The execution mode changed.
    fn execution_mode_changed(&self, _mode: ExecutionMode) {}

    /// Wait-for-interrupt must retire as a no-op (`true`) or idle (`false`).
    fn set_wfi_as_nop(&self, _value: bool) {}

    /// The CPU left [`super::CpuState::InReset`].
    fn on_leaving_reset_state(&self) {}

    /// Releases native resources. Called once, after the CPU thread is joined.
    fn dispose(&self) {}

    /// Upcast used to recover the concrete flavour from a [`Cpu`].
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}
