//! Interrupt Line Tests.

use tempo_core::common::CpuError;
use tempo_core::config::CpuConfig;
use tempo_core::cpu::{ExecutionMode, InterruptCategory, InterruptDecoder};
use tempo_core::engine::SyntheticEngineConfig;
use tempo_core::time::TimeInterval;

use crate::common::harness::{TestContext, WAIT, cpu_config, engine_config, wait_until};
use crate::common::mocks::time::TimeCall;

const EXTERNAL: u32 = 0x08;
const HARD: u32 = 0x02;

/// Lines 5 and 7 share the first external category, line 0 is a hard interrupt.
struct SharedLineDecoder;

impl InterruptDecoder for SharedLineDecoder {
    fn decode(&self, number: i32) -> Result<InterruptCategory, CpuError> {
        match number {
            0 => Ok(InterruptCategory::Hard),
            5 | 7 => Ok(InterruptCategory::TargetExternal0),
            other => Err(CpuError::InvalidInterrupt(other)),
        }
    }
}

fn context(config: &CpuConfig, engine: SyntheticEngineConfig) -> TestContext {
    TestContext::with_decoder(config, engine, Box::new(SharedLineDecoder))
}

#[test]
fn lines_are_ignored_until_the_cpu_starts() {
    let ctx = context(&cpu_config(0), engine_config());
    ctx.cpu.on_gpio(5, true).unwrap();
    assert_eq!(ctx.cpu.link().irq_mask(), 0);

    ctx.cpu.start();
    ctx.cpu.on_gpio(5, true).unwrap();
    assert_eq!(ctx.cpu.link().irq_mask(), EXTERNAL);
}

#[test]
fn category_stays_asserted_while_any_of_its_lines_is() {
    let ctx = context(&cpu_config(0), engine_config());
    ctx.cpu.start();

    ctx.cpu.on_gpio(5, true).unwrap();
    ctx.cpu.on_gpio(7, true).unwrap();
    ctx.cpu.on_gpio(0, true).unwrap();
    assert_eq!(ctx.cpu.link().irq_mask(), EXTERNAL | HARD);

    ctx.cpu.on_gpio(5, false).unwrap();
    assert_eq!(ctx.cpu.link().irq_mask(), EXTERNAL | HARD);
    ctx.cpu.on_gpio(7, false).unwrap();
    assert_eq!(ctx.cpu.link().irq_mask(), HARD);
}

#[test]
fn concurrent_lines_leave_the_category_consistent() {
    let ctx = context(&cpu_config(0), engine_config());
    ctx.cpu.start();

    for round in 0..50 {
        std::thread::scope(|s| {
            for line in [5, 7] {
                let cpu = &ctx.cpu;
                let _ = s.spawn(move || {
                    for i in 0..200 {
                        cpu.on_gpio(line, i % 2 == 0).unwrap();
                    }
                });
            }
        });
        assert_eq!(ctx.cpu.link().irq_mask(), 0, "round {round}");
    }

    std::thread::scope(|s| {
        let cpu = &ctx.cpu;
        let _ = s.spawn(move || cpu.on_gpio(5, true).unwrap());
        let _ = s.spawn(move || {
            for i in 0..200 {
                cpu.on_gpio(7, i % 2 == 0).unwrap();
            }
        });
    });
    assert_eq!(ctx.cpu.link().irq_mask(), EXTERNAL);
}

#[test]
fn reset_deasserts_latched_lines() {
    let ctx = context(&cpu_config(0), engine_config());
    ctx.time.grant(TimeInterval::from_microseconds(1));
    ctx.cpu.start();
    ctx.cpu.on_gpio(5, true).unwrap();
    ctx.cpu.on_gpio(0, true).unwrap();
    assert!(ctx.time.wait_for_continue(WAIT));

    ctx.cpu.reset().unwrap();
    assert_eq!(ctx.cpu.link().irq_mask(), 0);
}

#[test]
fn unknown_lines_are_rejected() {
    let ctx = context(&cpu_config(0), engine_config());
    assert!(matches!(
        ctx.cpu.on_gpio(9, true),
        Err(CpuError::InvalidInterrupt(9))
    ));
    ctx.cpu.start();
    assert!(matches!(
        ctx.cpu.on_gpio(-1, false),
        Err(CpuError::InvalidInterrupt(-1))
    ));
}

#[test]
fn stepping_masks_lines_when_configured() {
    let config = CpuConfig {
        disable_interrupts_while_stepping: true,
        ..cpu_config(0)
    };
    let ctx = context(&config, engine_config());
    ctx.cpu.start();

    ctx.cpu.set_execution_mode(ExecutionMode::SingleStepBlocking);
    ctx.cpu.on_gpio(5, true).unwrap();
    assert_eq!(ctx.cpu.link().irq_mask(), 0);

    ctx.cpu.set_execution_mode(ExecutionMode::Continuous);
    ctx.cpu.on_gpio(5, true).unwrap();
    assert_eq!(ctx.cpu.link().irq_mask(), EXTERNAL);
}

#[test]
fn asserted_line_wakes_a_waiting_guest() {
    let engine = SyntheticEngineConfig {
        wfi_every: Some(3),
        ..engine_config()
    };
    let ctx = context(&cpu_config(0), engine);
    let continues = |calls: &[TimeCall]| {
        calls
            .iter()
            .filter(|c| matches!(c, TimeCall::Continue(_)))
            .count()
    };

    ctx.time.grant(TimeInterval::from_microseconds(1));
    ctx.cpu.start();
    assert!(ctx.time.wait_for(WAIT, |calls| continues(calls) == 1));
    assert_eq!(ctx.cpu.executed_instructions(), 3);
    // The idle rest of the quantum still counts as elapsed time.
    assert_eq!(ctx.time.reported_progress(), TimeInterval::from_microseconds(1));

    ctx.time.grant(TimeInterval::from_microseconds(1));
    assert!(ctx.time.wait_for(WAIT, |calls| continues(calls) == 2));
    assert_eq!(ctx.cpu.executed_instructions(), 3);

    ctx.cpu.on_gpio(0, true).unwrap();
    ctx.time.grant(TimeInterval::from_microseconds(1));
    assert!(ctx.time.wait_for(WAIT, |calls| continues(calls) == 3));
    assert!(wait_until(WAIT, || ctx.cpu.executed_instructions() == 6));
    assert_eq!(ctx.time.reported_progress(), TimeInterval::from_microseconds(3));
}
