//! Per-quantum instruction accounting.
//!
//! A CPU converts every granted interval into an instruction budget, reports
//! progress while it executes and finally settles the quantum with its time
//! handle. Conversions leave residues in both directions:
//!
//! 1. **Tick residuum:** ticks of the grant that do not make up a whole
//!    instruction. They are handed back unchanged when the quantum settles.
//! 2. **Executed residuum:** instructions already executed but too few to be
//!    reported as whole ticks. The CPU is this many instructions ahead of the
//!    time it reported; they count against the next budget and are added to
//!    the next progress report.
//!
//! The sum of reported progress and handed-back time always equals the sum of
//! granted intervals.

use super::TimeInterval;

/// How a quantum is handed back to the time handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// The budget was used up; the handle may move to the next quantum.
    Continue(TimeInterval),
    /// Execution stopped early; the interval is still owed to this CPU.
    Break(TimeInterval),
}

/// Instruction bookkeeping of the quantum currently being executed.
#[derive(Debug, Clone, Default)]
pub struct QuantumAccount {
    executed_residuum: u64,
    to_execute: u64,
    executed_this_round: u64,
    left_this_round: u64,
    ticks_residuum: TimeInterval,
}

impl QuantumAccount {
    /// Creates an account with no carried residue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a quantum for `interval`.
    ///
    /// Returns `false` when the interval is not longer than the instructions the CPU
    /// is already ahead by; the caller hands the whole interval back.
    ///
    /// # Arguments
    ///
    /// * `interval` - The granted interval.
    /// * `mips` - Performance in instructions per microsecond.
    /// * `single_step` - Limits the quantum to one instruction.
    pub fn begin(&mut self, interval: TimeInterval, mips: u64, single_step: bool) -> bool {
        let (to_execute, ticks_residuum) = interval.to_cpu_cycles(mips);
        if to_execute <= self.executed_residuum {
            return false;
        }
        self.to_execute = to_execute;
        self.ticks_residuum = ticks_residuum;
        self.left_this_round = (to_execute - self.executed_residuum).min(if single_step {
            1
        } else {
            u64::MAX
        });
        self.executed_this_round = self.executed_residuum;
        true
    }

    /// Instructions that may still be executed in this quantum.
    pub const fn instructions_left(&self) -> u64 {
        self.left_this_round
    }

    /// Instructions the CPU is ahead of the time it reported.
    pub const fn executed_residuum(&self) -> u64 {
        self.executed_residuum
    }

    /// Instructions budgeted for the open quantum.
    pub const fn instructions_to_execute(&self) -> u64 {
        self.to_execute
    }

    /// Books `instructions` as executed and returns the time to report, if any.
    ///
    /// # Arguments
    ///
    /// * `instructions` - Executed or skipped instructions.
    /// * `mips` - Performance in instructions per microsecond.
    pub fn record_progress(&mut self, instructions: u64, mips: u64) -> Option<TimeInterval> {
        if instructions == 0 {
            return None;
        }
        self.left_this_round = self.left_this_round.saturating_sub(instructions);
        self.executed_this_round = self.executed_this_round.saturating_add(instructions);
        let (elapsed, residuum) =
            TimeInterval::from_cpu_cycles(instructions.saturating_add(self.executed_residuum), mips);
        self.executed_residuum = residuum;
        Some(elapsed)
    }

    /// Instructions until `nearest_limit` is reached or passed.
    ///
    /// The owner of a limit only runs once the limit is reached, so the count is
    /// rounded up when the limit does not fall on an instruction boundary. Never
    /// returns zero.
    ///
    /// # Arguments
    ///
    /// * `nearest_limit` - Time until the nearest clock limit.
    /// * `mips` - Performance in instructions per microsecond.
    pub fn instructions_to_nearest_limit(&self, nearest_limit: TimeInterval, mips: u64) -> u64 {
        let (mut instructions, unused) = nearest_limit.to_cpu_cycles(mips);
        if instructions <= self.executed_residuum {
            return 1;
        }
        instructions -= self.executed_residuum;
        if instructions != u64::MAX && (nearest_limit.is_empty() || !unused.is_empty()) {
            instructions += 1;
        }
        instructions
    }

    /// Closes the quantum after a normal stop.
    ///
    /// # Arguments
    ///
    /// * `mips` - Performance in instructions per microsecond.
    pub fn settle(&mut self, mips: u64) -> Settlement {
        let instructions_left = self.to_execute.saturating_sub(self.executed_this_round);
        // reported + executed_residuum + left == to_execute, and both reported and
        // to_execute are whole conversion units, so this converts without residue.
        let (time_left, residuum) = TimeInterval::from_cpu_cycles(
            instructions_left.saturating_add(self.executed_residuum),
            mips,
        );
        debug_assert_eq!(residuum, 0, "quantum settled with an inexact residue");
        let time_left = time_left + self.ticks_residuum;
        self.left_this_round = 0;
        if instructions_left > 0 {
            Settlement::Break(time_left)
        } else {
            debug_assert_eq!(self.executed_residuum, 0);
            Settlement::Continue(time_left)
        }
    }

    /// Drops the carried residue after a halt or an abort.
    pub fn discard(&mut self) {
        self.executed_residuum = 0;
        self.left_this_round = 0;
    }
}
