//! Multi-core CPU execution scheduler with deterministic virtual time.
//!
//! This crate drives translating CPUs against a shared virtual time base with the following:
//! 1. **Time:** Intervals, exact instruction/time conversion, time handles, clock sources and quantum sources.
//! 2. **CPU:** Lifecycle state machine, per-CPU execution thread, pause/resume/single-step protocol.
//! 3. **Engine:** The contract of the instruction-translation engine, its FFI binding table and a synthetic engine.
//! 4. **Translation layer:** Breakpoint hooks, the precise-pause guard, interrupt aggregation and snapshots.
//! 5. **Composition:** Clusters of CPUs, the machine orchestrator and the asynchronous execution tracer.

/// Common types (errors, event lists, instance counters).
pub mod common;
/// Machine, CPU and tracer configuration.
pub mod config;
/// Virtual time (intervals, time handles, clock sources, quantum accounting).
pub mod time;
/// System bus contract and the flat RAM-backed reference bus.
pub mod bus;
/// Execution-engine contract, native bindings and the synthetic engine.
pub mod engine;
/// CPU lifecycle, execution driver and translation layer.
pub mod cpu;
/// Recursive grouping of CPUs.
pub mod cluster;
/// Machine orchestrator.
pub mod machine;
/// Asynchronous execution tracer.
pub mod tracer;

/// Root configuration type; deserialize from JSON or use `Config::default()`.
pub use crate::config::Config;
/// Handle to a schedulable CPU.
pub use crate::cpu::Cpu;
/// CPU backed by a translation engine.
pub use crate::cpu::TranslationCpu;
/// Machine orchestrator owning CPUs, the time source and the bus.
pub use crate::machine::Machine;
/// Virtual time interval.
pub use crate::time::TimeInterval;
