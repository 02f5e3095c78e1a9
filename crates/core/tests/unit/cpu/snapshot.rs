//! Snapshot Tests.

use pretty_assertions::assert_eq;
use tempo_core::common::CpuError;
use tempo_core::cpu::CpuSnapshot;
use tempo_core::time::TimeInterval;

use crate::common::harness::{ENTRY_PC, TestContext, WAIT, cpu_config};
use crate::common::mocks::engine::CallbackEngine;
use crate::common::mocks::time::ScriptedTimeHandle;

fn run_one_quantum(ctx: &TestContext) {
    ctx.time.grant(TimeInterval::from_microseconds(1));
    ctx.cpu.start();
    assert!(ctx.time.wait_for_continue(WAIT));
    ctx.cpu.pause().unwrap();
}

#[test]
fn snapshot_restores_pc_and_counters_after_reset() {
    let ctx = TestContext::new();
    run_one_quantum(&ctx);

    let snapshot = ctx.cpu.export_snapshot().unwrap();
    assert_eq!(snapshot.architecture, "synthetic");
    assert_eq!(snapshot.cpu_id, 0);
    assert_eq!(snapshot.pc, ENTRY_PC + 400);
    assert_eq!(snapshot.executed_instructions, 100);
    assert_eq!(snapshot.skipped_instructions, 0);

    ctx.cpu.reset().unwrap();
    assert_eq!(ctx.cpu.pc(), ENTRY_PC);

    ctx.cpu.import_snapshot(&snapshot).unwrap();
    assert_eq!(ctx.cpu.pc(), ENTRY_PC + 400);
    assert_eq!(ctx.cpu.executed_instructions(), 100);
    assert_eq!(ctx.cpu.export_snapshot().unwrap(), snapshot);
}

#[test]
fn running_cpu_refuses_snapshots() {
    let ctx = TestContext::new();
    let snapshot = ctx.cpu.export_snapshot().unwrap();
    ctx.cpu.start();

    assert!(matches!(
        ctx.cpu.export_snapshot(),
        Err(CpuError::NotPaused(0))
    ));
    assert!(matches!(
        ctx.cpu.import_snapshot(&snapshot),
        Err(CpuError::NotPaused(0))
    ));
}

#[test]
fn snapshot_of_another_architecture_is_rejected() {
    let synthetic = TestContext::new();
    let snapshot = synthetic.cpu.export_snapshot().unwrap();

    let other = TestContext::build(
        &cpu_config(1),
        Box::new(CallbackEngine::new(Box::new(|_| {}))),
        ScriptedTimeHandle::new(),
    );
    assert!(matches!(
        other.cpu.import_snapshot(&snapshot),
        Err(CpuError::SnapshotMismatch(_))
    ));
    assert_eq!(other.cpu.pc(), 0);
}

#[test]
fn corrupt_engine_state_is_rejected() {
    let ctx = TestContext::new();
    let mut snapshot = ctx.cpu.export_snapshot().unwrap();
    snapshot.engine_state = b"not an engine state".to_vec();

    assert!(matches!(
        ctx.cpu.import_snapshot(&snapshot),
        Err(CpuError::EngineState(_))
    ));
    assert_eq!(ctx.cpu.pc(), ENTRY_PC);
}

#[test]
fn snapshot_survives_json() {
    let ctx = TestContext::new();
    run_one_quantum(&ctx);
    let snapshot = ctx.cpu.export_snapshot().unwrap();

    let json = snapshot.to_json().unwrap();
    assert_eq!(CpuSnapshot::from_json(&json).unwrap(), snapshot);
    assert!(matches!(
        CpuSnapshot::from_json("{\"pc\": 1}"),
        Err(CpuError::ConfigParse(_))
    ));
}
