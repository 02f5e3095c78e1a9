//! Single-Step Tests.
//!
//! Stepping runs one instruction per burst and raises `Halted(Step)` before each
//! one. Non-blocking stepping leaves the CPU effectively halted between steps.

use std::sync::{Arc, Mutex};

use pretty_assertions::assert_eq;
use tempo_core::cpu::{ExecutionMode, HaltArguments, HaltReason, TranslationCpu};
use tempo_core::engine::SyntheticEngine;
use tempo_core::time::{TimeHandle, TimeInterval};

use crate::common::harness::{ENTRY_PC, TestContext, WAIT, cpu_config, engine_config, wait_until};
use crate::common::mocks::time::ScriptedTimeHandle;

fn stepping_context() -> TestContext {
    TestContext::build(
        &cpu_config(0),
        Box::new(SyntheticEngine::new(engine_config())),
        ScriptedTimeHandle::unlimited(TimeInterval::from_microseconds(1)),
    )
}

#[test]
fn blocking_steps_execute_one_instruction_each() {
    let ctx = stepping_context();

    assert_eq!(ctx.cpu.step(3, Some(true)), ENTRY_PC + 12);
    assert_eq!(ctx.cpu.execution_mode(), ExecutionMode::SingleStepBlocking);
    assert_eq!(ctx.cpu.executed_instructions(), 3);
    assert!(!ctx.cpu.is_effectively_halted());

    // The CPU announces the next step once it is ready for it.
    assert!(wait_until(WAIT, || ctx.halts.count(HaltReason::Step) == 4));
    let announced: Vec<u64> = ctx
        .halts
        .events()
        .iter()
        .filter_map(|event| event.address)
        .collect();
    assert_eq!(
        announced,
        vec![ENTRY_PC, ENTRY_PC + 4, ENTRY_PC + 8, ENTRY_PC + 12]
    );

    assert_eq!(ctx.cpu.step(2, None), ENTRY_PC + 20);
    assert_eq!(ctx.cpu.executed_instructions(), 5);
}

#[test]
fn non_blocking_step_leaves_the_cpu_halted() {
    let ctx = stepping_context();

    assert_eq!(ctx.cpu.step(2, Some(false)), ENTRY_PC + 8);
    assert_eq!(ctx.cpu.execution_mode(), ExecutionMode::SingleStepNonBlocking);
    assert!(ctx.cpu.is_effectively_halted());
    assert!(!ctx.cpu.is_halted());
    assert!(!ctx.time.is_enabled());

    // Switching flavour mid-session is allowed.
    assert_eq!(ctx.cpu.step(1, Some(true)), ENTRY_PC + 12);
    assert!(!ctx.cpu.is_effectively_halted());
    assert!(ctx.time.is_enabled());
}

#[test]
fn leaving_single_step_mode_releases_the_cpu() {
    let ctx = stepping_context();
    let _ = ctx.cpu.step(1, Some(false));
    assert!(wait_until(WAIT, || ctx.halts.count(HaltReason::Step) == 2));

    ctx.cpu.set_execution_mode(ExecutionMode::Continuous);
    assert!(!ctx.cpu.is_effectively_halted());
    assert!(ctx.time.is_enabled());
    assert!(wait_until(WAIT, || ctx.cpu.executed_instructions() > 100));
    assert_eq!(ctx.halts.count(HaltReason::Step), 2);
}

#[test]
fn stepping_a_halted_cpu_is_ignored() {
    let ctx = stepping_context();
    ctx.cpu.set_halted(true);

    assert_eq!(ctx.cpu.step(5, Some(true)), ENTRY_PC);
    assert_eq!(ctx.cpu.execution_mode(), ExecutionMode::Continuous);
    assert_eq!(ctx.cpu.executed_instructions(), 0);
    assert!(!ctx.cpu.is_started());
}

#[test]
fn stepping_from_the_cpu_thread_is_ignored() {
    let ctx = TestContext::new();
    let seen: Arc<Mutex<Vec<(u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    ctx.cpu.add_hook(
        ENTRY_PC + 8,
        Arc::new(move |cpu: &TranslationCpu, address: u64| {
            sink.lock().unwrap().push((address, cpu.step(4, Some(true))));
        }),
    );

    ctx.time.grant(TimeInterval::from_microseconds(1));
    ctx.cpu.start();
    assert!(ctx.time.wait_for_continue(WAIT));

    assert_eq!(*seen.lock().unwrap(), vec![(ENTRY_PC + 8, ENTRY_PC + 8)]);
    assert_eq!(ctx.cpu.execution_mode(), ExecutionMode::Continuous);
    assert_eq!(ctx.cpu.executed_instructions(), 100);
}

#[test]
fn debug_mode_turns_interrupt_waits_into_no_ops() {
    let ctx = TestContext::new();
    ctx.cpu.set_debugger_connected(true);
    ctx.cpu.set_should_enter_debug_mode(true);
    assert!(!ctx.cpu.in_debug_mode());
    assert!(!ctx.cpu.link().wfi_as_nop());

    ctx.cpu.set_execution_mode(ExecutionMode::SingleStepBlocking);
    assert!(ctx.cpu.in_debug_mode());
    assert!(ctx.cpu.link().wfi_as_nop());

    ctx.cpu.set_execution_mode(ExecutionMode::Continuous);
    assert!(!ctx.cpu.link().wfi_as_nop());

    ctx.cpu.set_never_wait_for_interrupt(true);
    assert!(ctx.cpu.link().wfi_as_nop());
}

#[test]
fn step_events_carry_the_cpu_id() {
    let ctx = stepping_context();
    let _ = ctx.cpu.step(1, Some(true));
    assert!(wait_until(WAIT, || ctx.halts.count(HaltReason::Step) == 2));
    assert_eq!(
        ctx.halts.events()[0],
        HaltArguments::at(HaltReason::Step, 0, ENTRY_PC)
    );
}

#[test]
fn hooks_may_switch_to_stepping_on_the_cpu_thread() {
    let ctx = TestContext::new();
    let hook_pc = ENTRY_PC + 8;
    ctx.cpu.add_hook(
        hook_pc,
        Arc::new(|cpu: &TranslationCpu, address: u64| {
            let args = HaltArguments::at(HaltReason::Step, cpu.id(), address);
            assert!(cpu.enter_single_step_mode_safely(args, Some(true)));
        }),
    );
    let args = HaltArguments::new(HaltReason::Step, 0);
    assert!(!ctx.cpu.enter_single_step_mode_safely(args, Some(true)));

    ctx.time.grant(TimeInterval::from_microseconds(1));
    ctx.cpu.start();
    assert!(wait_until(WAIT, || ctx.halts.count(HaltReason::Step) == 2));

    assert_eq!(ctx.cpu.execution_mode(), ExecutionMode::SingleStepBlocking);
    assert_eq!(ctx.cpu.pc(), hook_pc);
    assert_eq!(
        ctx.halts.events(),
        vec![
            HaltArguments::at(HaltReason::Step, 0, hook_pc),
            HaltArguments::at(HaltReason::Step, 0, hook_pc),
        ]
    );
}
