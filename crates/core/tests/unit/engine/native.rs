//! Native Engine Binding Tests.
//!
//! Verifies the FFI layer against a fake library that implements the C function table:
//! 1. **Instances:** Naming, failed initialisation and disposal on drop.
//! 2. **Link sync:** Breakpoints, interrupt lines and flags reach the library before `execute`.
//! 3. **Callbacks:** Host callbacks reach the host during `execute` and get neutral
//!    answers outside of it.
//! 4. **CPU integration:** A translation CPU runs hooks and bus loads through the binding.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use pretty_assertions::assert_eq;
use tempo_core::bus::{AccessWidth, BusController};
use tempo_core::common::{CpuError, InstanceCounter};
use tempo_core::cpu::TranslationCpu;
use tempo_core::engine::{EngineHost, EngineLink, EngineResult, ExecutionEngine, NativeEngine};
use tempo_core::time::TimeInterval;

use crate::common::harness::{TestContext, WAIT, cpu_config};
use crate::common::mocks::native::{
    FAKE_ABORT_PC, FAKE_ENTRY, FAKE_LOAD_ADDRESS, FAKE_LOAD_PC, failing_bindings, fake_bindings,
    fake_core,
};
use crate::common::mocks::time::ScriptedTimeHandle;

#[derive(Default)]
struct RecordingHost {
    refuse_blocks: bool,
    load_value: u64,
    loads: Vec<(u64, AccessWidth)>,
    finished: Vec<(u64, u32)>,
}

impl EngineHost for RecordingHost {
    fn block_begin(&mut self, _pc: u64, _size: u32) -> bool {
        !self.refuse_blocks
    }

    fn block_finished(&mut self, pc: u64, executed: u32) {
        self.finished.push((pc, executed));
    }

    fn read(&mut self, address: u64, width: AccessWidth) -> Option<u64> {
        self.loads.push((address, width));
        Some(self.load_value)
    }

    fn write(&mut self, _address: u64, _width: AccessWidth, _value: u64) -> bool {
        true
    }
}

/// Creates an instance of the fake library with a fresh link attached.
fn engine(architecture: &str) -> (NativeEngine, Arc<EngineLink>) {
    let counter = InstanceCounter::new();
    // SAFETY: the fake table is valid for the whole test.
    let mut engine = unsafe { NativeEngine::new(fake_bindings(), architecture, &counter) }.unwrap();
    let link = Arc::new(EngineLink::new());
    engine.attach(Arc::clone(&link));
    (engine, link)
}

#[test]
fn instances_are_numbered_by_their_orchestrator() {
    let counter = InstanceCounter::new();
    // SAFETY: as above.
    let first = unsafe { NativeEngine::new(fake_bindings(), "fake-naming", &counter) }.unwrap();
    let second = unsafe { NativeEngine::new(fake_bindings(), "fake-naming", &counter) }.unwrap();

    assert_eq!(first.name(), "fake-naming-engine-0");
    assert_eq!(second.name(), "fake-naming-engine-1");
    assert_eq!(counter.allocated(), 2);
    assert_eq!(first.architecture(), "fake-naming");
    assert_eq!(first.page_size(), 0x1000);
    assert_eq!(first.pc(), FAKE_ENTRY);
}

#[test]
fn failed_initialisation_is_a_construction_error() {
    let counter = InstanceCounter::new();
    // SAFETY: as above.
    let result = unsafe { NativeEngine::new(failing_bindings(), "fake-broken", &counter) };
    assert!(matches!(result, Err(CpuError::Construction(_))));
}

#[test]
fn link_state_is_pushed_before_execute() {
    let (mut engine, link) = engine("fake-sync");
    link.add_breakpoint(FAKE_ENTRY + 8);
    link.set_irq(0x08, true);
    link.request_cache_flush();
    link.set_wfi_as_nop(true);
    link.set_block_begin_hook_present(true);

    let mut host = RecordingHost {
        load_value: 0x55,
        ..RecordingHost::default()
    };
    assert_eq!(
        engine.execute(100, &mut host).unwrap(),
        EngineResult::StoppedAtBreakpoint
    );
    assert_eq!(engine.executed_instructions(), 2);
    assert_eq!(engine.pc(), FAKE_ENTRY + 8);
    assert_eq!(host.finished, vec![(FAKE_ENTRY, 1), (FAKE_LOAD_PC, 1)]);
    assert_eq!(host.loads, vec![(FAKE_LOAD_ADDRESS, AccessWidth::DoubleWord)]);
    {
        let shared = fake_core("fake-sync-engine-0");
        let core = shared.lock().unwrap();
        assert_eq!(core.breakpoints.iter().copied().collect::<Vec<_>>(), vec![FAKE_ENTRY + 8]);
        assert_eq!(core.irq, 0x08);
        assert_eq!(core.flushes, 1);
        assert!(core.wfi_as_nop);
        assert!(core.block_hook_present);
        assert_eq!(core.loads, vec![0x55]);
    }

    link.remove_breakpoint(FAKE_ENTRY + 8);
    link.set_irq(0x08, false);
    assert_eq!(engine.execute(4, &mut host).unwrap(), EngineResult::Ok);
    assert_eq!(engine.pc(), FAKE_ENTRY + 24);

    let shared = fake_core("fake-sync-engine-0");
    let core = shared.lock().unwrap();
    assert!(core.breakpoints.is_empty());
    assert_eq!(core.irq, 0);
    assert_eq!(core.flushes, 1);
}

#[test]
fn return_requests_and_refused_blocks_stop_execution() {
    let (mut engine, link) = engine("fake-return");
    let mut host = RecordingHost::default();

    link.request_return();
    assert_eq!(
        engine.execute(10, &mut host).unwrap(),
        EngineResult::ReturnRequested
    );
    assert_eq!(engine.executed_instructions(), 0);
    assert_eq!(engine.execute(10, &mut host).unwrap(), EngineResult::Ok);
    assert_eq!(engine.executed_instructions(), 10);

    link.set_block_begin_hook_present(true);
    host.refuse_blocks = true;
    assert_eq!(
        engine.execute(10, &mut host).unwrap(),
        EngineResult::ReturnRequested
    );
    assert_eq!(engine.executed_instructions(), 0);
}

#[test]
fn callbacks_outside_execute_get_neutral_answers() {
    let (mut engine, _link) = engine("fake-stray");
    let shared = fake_core("fake-stray-engine-0");
    assert_eq!(shared.lock().unwrap().stray_read(), 0);
    assert_eq!(shared.lock().unwrap().stray_should_return(), 1);

    let _ = engine.execute(1, &mut RecordingHost::default()).unwrap();
    assert_eq!(shared.lock().unwrap().stray_should_return(), 1);
}

#[test]
fn negative_code_is_an_abort() {
    let (mut engine, _link) = engine("fake-abort");
    engine.set_pc(FAKE_ABORT_PC);
    let abort = engine.execute(10, &mut RecordingHost::default()).unwrap_err();
    assert_eq!(abort.reason, "fake-abort-engine-0 aborted with code -1");
}

#[test]
fn state_blob_round_trips_and_drop_disposes() {
    let (mut engine, _link) = engine("fake-state");
    let blob = engine.export_state();
    assert_eq!(blob, FAKE_ENTRY.to_le_bytes().to_vec());

    engine.set_pc(0x500);
    engine.import_state(&blob).unwrap();
    assert_eq!(engine.pc(), FAKE_ENTRY);
    assert!(engine.import_state(&[1, 2, 3]).is_err());

    engine.set_pc(0x500);
    engine.reset();
    assert_eq!(engine.pc(), FAKE_ENTRY);

    let shared = fake_core("fake-state-engine-0");
    drop(engine);
    assert!(shared.lock().unwrap().disposed);
}

#[test]
fn translation_cpu_runs_hooks_and_loads_through_the_binding() {
    let counter = InstanceCounter::new();
    // SAFETY: as above.
    let engine = unsafe { NativeEngine::new(fake_bindings(), "fake-cpu", &counter) }.unwrap();
    let ctx = TestContext::build(&cpu_config(0), Box::new(engine), ScriptedTimeHandle::new());
    ctx.bus
        .write(FAKE_LOAD_ADDRESS, AccessWidth::DoubleWord, 0x1234_5678, None);

    let hits = Arc::new(AtomicUsize::new(0));
    let counter_hits = Arc::clone(&hits);
    ctx.cpu.add_hook(
        FAKE_ENTRY + 16,
        Arc::new(move |_: &TranslationCpu, _: u64| {
            let _ = counter_hits.fetch_add(1, Ordering::SeqCst);
        }),
    );

    ctx.time.grant(TimeInterval::from_microseconds(1));
    ctx.cpu.start();
    assert!(ctx.time.wait_for_continue(WAIT));

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.cpu.executed_instructions(), 100);
    assert_eq!(ctx.cpu.pc(), FAKE_ENTRY + 400);
    assert_eq!(ctx.time.reported_progress(), TimeInterval::from_microseconds(1));
    assert_eq!(fake_core("fake-cpu-engine-0").lock().unwrap().loads, vec![0x1234_5678]);

    ctx.cpu.dispose();
    assert!(fake_core("fake-cpu-engine-0").lock().unwrap().disposed);
}
