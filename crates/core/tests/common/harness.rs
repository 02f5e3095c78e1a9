use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tempo_core::bus::{BusController, FlatBus};
use tempo_core::common::CpuError;
use tempo_core::config::CpuConfig;
use tempo_core::cpu::{Cpu, HaltArguments, HaltReason, InterruptDecoder, TranslationCpu};
use tempo_core::engine::{ExecutionEngine, SyntheticEngine, SyntheticEngineConfig};
use tempo_core::time::TimeHandle;
use tracing_subscriber::EnvFilter;

use crate::common::mocks::time::ScriptedTimeHandle;

pub const RAM_BASE: u64 = 0;
pub const RAM_SIZE: usize = 0x1_0000;
pub const ENTRY_PC: u64 = 0x1000;
pub const MACHINE: &str = "test";

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

/// Installs a test-writer subscriber once; `RUST_LOG` selects the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// 100 MIPS, so one microsecond is exactly 100 instructions.
pub fn cpu_config(id: u32) -> CpuConfig {
    CpuConfig {
        id,
        performance_in_mips: 100,
        pause_probe_timeout_ms: 2,
        ..CpuConfig::default()
    }
}

/// Four-instruction blocks starting at [`ENTRY_PC`].
pub fn engine_config() -> SyntheticEngineConfig {
    SyntheticEngineConfig {
        entry_pc: ENTRY_PC,
        block_size: 4,
        ..SyntheticEngineConfig::default()
    }
}

/// Polls `condition` every millisecond until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// Records every `Halted` event of a CPU.
#[derive(Clone, Default)]
pub struct HaltLog {
    events: Arc<Mutex<Vec<HaltArguments>>>,
}

impl HaltLog {
    pub fn attach(cpu: &Cpu) -> Self {
        let log = Self::default();
        let events = Arc::clone(&log.events);
        let _ = cpu.on_halted(move |args| {
            events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(*args);
        });
        log
    }

    pub fn events(&self) -> Vec<HaltArguments> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self, reason: HaltReason) -> usize {
        self.events().iter().filter(|e| e.reason == reason).count()
    }
}

/// A translation CPU on a flat bus, driven by a scripted time handle.
pub struct TestContext {
    pub bus: Arc<FlatBus>,
    pub cpu: TranslationCpu,
    pub time: Arc<ScriptedTimeHandle>,
    pub halts: HaltLog,
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_engine(engine_config())
    }

    pub fn with_engine(engine: SyntheticEngineConfig) -> Self {
        Self::build(&cpu_config(0), Box::new(SyntheticEngine::new(engine)), ScriptedTimeHandle::new())
    }

    pub fn build(
        config: &CpuConfig,
        engine: Box<dyn ExecutionEngine>,
        time: ScriptedTimeHandle,
    ) -> Self {
        Self::assemble(time, |bus| TranslationCpu::new(config, MACHINE, engine, bus))
    }

    /// A synthetic-engine CPU decoding interrupt lines with `decoder`.
    pub fn with_decoder(
        config: &CpuConfig,
        engine: SyntheticEngineConfig,
        decoder: Box<dyn InterruptDecoder>,
    ) -> Self {
        Self::assemble(ScriptedTimeHandle::new(), |bus| {
            TranslationCpu::with_decoder(
                config,
                MACHINE,
                Box::new(SyntheticEngine::new(engine)),
                bus,
                decoder,
            )
        })
    }

    fn assemble(
        time: ScriptedTimeHandle,
        make: impl FnOnce(Arc<dyn BusController>) -> Result<TranslationCpu, CpuError>,
    ) -> Self {
        init_tracing();
        let bus = Arc::new(FlatBus::new(RAM_BASE, RAM_SIZE));
        let cpu = make(Arc::clone(&bus) as Arc<dyn BusController>).unwrap();
        let time = Arc::new(time);
        cpu.set_time_handle(Arc::clone(&time) as Arc<dyn TimeHandle>);
        let halts = HaltLog::attach(&cpu);
        Self {
            bus,
            cpu,
            time,
            halts,
        }
    }

    /// Waits until the CPU thread is gone.
    pub fn wait_for_thread_exit(&self) -> bool {
        wait_until(WAIT, || !self.cpu.is_thread_running())
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        self.cpu.dispose();
    }
}

/// Minimal little-endian RISC-V ELF64 executable header.
pub fn elf64_image(entry: u64) -> Vec<u8> {
    let mut image = elf_ident(2);
    image.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    image.extend_from_slice(&0xF3u16.to_le_bytes());
    image.extend_from_slice(&1u32.to_le_bytes());
    image.extend_from_slice(&entry.to_le_bytes());
    image.extend_from_slice(&0u64.to_le_bytes()); // phoff
    image.extend_from_slice(&0u64.to_le_bytes()); // shoff
    image.extend_from_slice(&0u32.to_le_bytes());
    image.extend_from_slice(&64u16.to_le_bytes());
    image.extend_from_slice(&56u16.to_le_bytes());
    image.extend_from_slice(&0u16.to_le_bytes());
    image.extend_from_slice(&64u16.to_le_bytes());
    image.extend_from_slice(&0u16.to_le_bytes());
    image.extend_from_slice(&0u16.to_le_bytes());
    assert_eq!(image.len(), 64);
    image
}

/// Minimal little-endian RISC-V ELF32 executable header.
pub fn elf32_image(entry: u32) -> Vec<u8> {
    let mut image = elf_ident(1);
    image.extend_from_slice(&2u16.to_le_bytes());
    image.extend_from_slice(&0xF3u16.to_le_bytes());
    image.extend_from_slice(&1u32.to_le_bytes());
    image.extend_from_slice(&entry.to_le_bytes());
    image.extend_from_slice(&0u32.to_le_bytes());
    image.extend_from_slice(&0u32.to_le_bytes());
    image.extend_from_slice(&0u32.to_le_bytes());
    image.extend_from_slice(&52u16.to_le_bytes());
    image.extend_from_slice(&32u16.to_le_bytes());
    image.extend_from_slice(&0u16.to_le_bytes());
    image.extend_from_slice(&40u16.to_le_bytes());
    image.extend_from_slice(&0u16.to_le_bytes());
    image.extend_from_slice(&0u16.to_le_bytes());
    assert_eq!(image.len(), 52);
    image
}

fn elf_ident(class: u8) -> Vec<u8> {
    let mut ident = vec![0x7f, b'E', b'L', b'F', class, 1, 1, 0];
    ident.resize(16, 0);
    ident
}
