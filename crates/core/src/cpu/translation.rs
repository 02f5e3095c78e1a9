//! CPU flavour backed by a translation engine.
//!
//! [`TranslationBackend`] implements [`CpuBackend`] on top of an [`ExecutionEngine`]:
//! 1. **Engine access:** the CPU thread holds the engine for the duration of an
//!    engine call. Other threads read cached values, or queue actions that run on
//!    the CPU thread before the next call.
//! 2. **Hooks:** breakpoint hooks are activated in bulk before each call, run and
//!    deactivated when the engine stops at them, and reactivated at the next block.
//! 3. **Precise pause:** bus accesses run under the [`PauseGuard`], so watchpoints can
//!    cancel an access and pause before its side effect.
//! 4. **Interrupts:** lines are decoded into categories and aggregated before they
//!    reach the engine.

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, TryLockError, Weak};

use tracing::{debug, trace, warn};

use crate::bus::{Access, AccessWidth, BusController};
use crate::common::CpuError;
use crate::config::CpuConfig;
use crate::engine::{EngineHost, EngineLink, EngineResult, ExecutionEngine};
use crate::tracer::ExecutionTracer;

use super::guard::PauseGuard;
use super::hooks::{HookCallback, HookTable};
use super::interrupts::{DefaultInterruptDecoder, InterruptAggregator, InterruptDecoder};
use super::{
    Cpu, CpuBackend, CpuSnapshot, ExecutionMode, ExecutionResult, HaltArguments,
};

/// Block hook: `(cpu, first pc, size or executed count)`.
pub type BlockHook = Arc<dyn Fn(&TranslationCpu, u64, u32) + Send + Sync>;

type QueuedAction = Box<dyn FnOnce(&mut dyn ExecutionEngine) + Send>;

/// The [`CpuBackend`] of a [`TranslationCpu`].
pub struct TranslationBackend {
    me: Weak<Self>,
    cpu_id: u32,
    architecture: String,
    engine: Mutex<Option<Box<dyn ExecutionEngine>>>,
    link: Arc<EngineLink>,
    queued: Mutex<VecDeque<QueuedAction>>,
    cached_pc: AtomicU64,
    total_executed: AtomicU64,
    hooks: HookTable,
    guard: PauseGuard,
    interrupts: InterruptAggregator,
    decoder: Box<dyn InterruptDecoder>,
    block_begin_hook: RwLock<Option<BlockHook>>,
    block_finished_hook: RwLock<Option<BlockHook>>,
    inside_block_hook: AtomicBool,
    single_step: AtomicBool,
    waiting_for_interrupt: AtomicBool,
    tracer: RwLock<Option<Arc<ExecutionTracer>>>,
    bus: Arc<dyn BusController>,
    disable_interrupts_while_stepping: bool,
    synchronized_io: bool,
}

impl TranslationBackend {
    fn new(
        config: &CpuConfig,
        mut engine: Box<dyn ExecutionEngine>,
        bus: Arc<dyn BusController>,
        decoder: Box<dyn InterruptDecoder>,
    ) -> Arc<Self> {
        let link = Arc::new(EngineLink::new());
        engine.attach(Arc::clone(&link));
        let architecture = engine.architecture().to_string();
        let pc = engine.pc();
        Arc::new_cyclic(|me| Self {
            me: Weak::clone(me),
            cpu_id: config.id,
            architecture,
            engine: Mutex::new(Some(engine)),
            hooks: HookTable::new(Arc::clone(&link)),
            link,
            queued: Mutex::new(VecDeque::new()),
            cached_pc: AtomicU64::new(pc),
            total_executed: AtomicU64::new(0),
            guard: PauseGuard::new(),
            interrupts: InterruptAggregator::new(),
            decoder,
            block_begin_hook: RwLock::new(None),
            block_finished_hook: RwLock::new(None),
            inside_block_hook: AtomicBool::new(false),
            single_step: AtomicBool::new(false),
            waiting_for_interrupt: AtomicBool::new(false),
            tracer: RwLock::new(None),
            bus,
            disable_interrupts_while_stepping: config.disable_interrupts_while_stepping,
            synchronized_io: config.synchronized_io,
        })
    }

    fn lock_engine(&self) -> MutexGuard<'_, Option<Box<dyn ExecutionEngine>>> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `action` on the engine now if it is idle, otherwise before the next engine call.
    fn with_engine(&self, action: impl FnOnce(&mut dyn ExecutionEngine) + Send + 'static) {
        match self.engine.try_lock() {
            Ok(mut engine) => {
                if let Some(engine) = engine.as_mut() {
                    action(engine.as_mut());
                    self.cached_pc.store(engine.pc(), Ordering::Release);
                }
            }
            Err(TryLockError::Poisoned(poisoned)) => {
                if let Some(engine) = poisoned.into_inner().as_mut() {
                    action(engine.as_mut());
                }
            }
            Err(TryLockError::WouldBlock) => self.queue(Box::new(action)),
        }
    }

    fn queue(&self, action: QueuedAction) {
        self.queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(action);
        self.link.request_return();
    }

    fn update_block_begin_hook_present(&self) {
        let present = self.has_block_begin_hook()
            || self.single_step.load(Ordering::Acquire)
            || self.hooks.has_inactive();
        self.link.set_block_begin_hook_present(present);
    }

    fn has_block_begin_hook(&self) -> bool {
        self.block_begin_hook
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn activate_new_hooks(&self) {
        self.hooks.activate_new();
        self.update_block_begin_hook_present();
    }

    fn translation_cpu(&self, cpu: &Cpu) -> Option<TranslationCpu> {
        self.me.upgrade().map(|backend| TranslationCpu {
            cpu: cpu.clone(),
            backend,
        })
    }

    fn run_block_hook(&self, hook: &BlockHook, cpu: &TranslationCpu, pc: u64, value: u32) {
        self.inside_block_hook.store(true, Ordering::Release);
        hook(cpu, pc, value);
        self.inside_block_hook.store(false, Ordering::Release);
    }

    const fn map_result(result: EngineResult) -> ExecutionResult {
        match result {
            EngineResult::Ok => ExecutionResult::Ok,
            EngineResult::WaitingForInterrupt => ExecutionResult::WaitingForInterrupt,
            EngineResult::StoppedAtBreakpoint => ExecutionResult::StoppedAtBreakpoint,
            EngineResult::StoppedAtWatchpoint => ExecutionResult::StoppedAtWatchpoint,
            EngineResult::ReturnRequested => ExecutionResult::Interrupted,
            EngineResult::ExternalMmuFault => ExecutionResult::ExternalMmuFault,
        }
    }
}

impl CpuBackend for TranslationBackend {
    fn architecture(&self) -> &str {
        &self.architecture
    }

    fn execute_instructions(&self, cpu: &Cpu, budget: u64) -> (ExecutionResult, u64) {
        let Some(tcpu) = self.translation_cpu(cpu) else {
            return (ExecutionResult::Aborted, 0);
        };
        let mut slot = self.lock_engine();
        let Some(engine) = slot.as_mut() else {
            return (ExecutionResult::Aborted, 0);
        };

        let queued = std::mem::take(&mut *self.queued.lock().unwrap_or_else(PoisonError::into_inner));
        for action in queued {
            action(engine.as_mut());
        }
        self.activate_new_hooks();

        let budget32 = u32::try_from(budget).unwrap_or(u32::MAX);
        let mut context = ExecutionContext {
            backend: self,
            cpu: &tcpu,
        };
        self.guard.enter();
        let outcome = engine.execute(budget32, &mut context);
        self.guard.leave();

        let executed = engine.executed_instructions().min(budget);
        self.cached_pc.store(engine.pc(), Ordering::Release);
        drop(slot);
        let _ = self.total_executed.fetch_add(executed, Ordering::AcqRel);

        let result = match outcome {
            Ok(result) => {
                self.waiting_for_interrupt.store(
                    result == EngineResult::WaitingForInterrupt,
                    Ordering::Release,
                );
                Self::map_result(result)
            }
            Err(abort) => {
                warn!(cpu = self.cpu_id, reason = %abort.reason, "engine aborted");
                ExecutionResult::Aborted
            }
        };
        (result, executed)
    }

    fn execution_finished(&self, cpu: &Cpu, result: ExecutionResult) -> bool {
        if result != ExecutionResult::StoppedAtBreakpoint {
            return false;
        }
        let pc = self.pc();
        trace!(cpu = self.cpu_id, "stopped at breakpoint at {pc:#x}");
        if let Some(tcpu) = self.translation_cpu(cpu) {
            for hook in self.hooks.callbacks_at(pc) {
                hook(&tcpu, pc);
            }
        }
        self.hooks.deactivate(pc);
        self.update_block_begin_hook_present();
        true
    }

    fn request_return(&self) {
        self.link.request_return();
    }

    fn order_pause(&self, _cpu: &Cpu) -> Result<(), CpuError> {
        let inside_block_hook = self.inside_block_hook.load(Ordering::Acquire);
        if self.guard.may_order_pause(inside_block_hook) {
            Ok(())
        } else {
            Err(CpuError::PauseOutsideGuard(self.cpu_id))
        }
    }

    fn pc(&self) -> u64 {
        match self.engine.try_lock() {
            Ok(engine) => engine
                .as_ref()
                .map_or_else(|| self.cached_pc.load(Ordering::Acquire), |e| e.pc()),
            Err(_) => self.cached_pc.load(Ordering::Acquire),
        }
    }

    fn set_pc(&self, pc: u64) {
        self.cached_pc.store(pc, Ordering::Release);
        self.with_engine(move |engine| engine.set_pc(pc));
    }

    fn executed_instructions(&self) -> u64 {
        self.total_executed.load(Ordering::Acquire)
    }

    fn reset(&self) {
        let mut slot = self.lock_engine();
        if let Some(engine) = slot.as_mut() {
            engine.reset();
            self.cached_pc.store(engine.pc(), Ordering::Release);
        }
        drop(slot);
        self.total_executed.store(0, Ordering::Release);
        self.waiting_for_interrupt.store(false, Ordering::Release);
        self.interrupts.clear(&self.link);
    }

    fn execution_mode_changed(&self, mode: ExecutionMode) {
        self.single_step
            .store(mode.is_single_step(), Ordering::Release);
        self.update_block_begin_hook_present();
    }

    fn set_wfi_as_nop(&self, value: bool) {
        self.link.set_wfi_as_nop(value);
    }

    fn dispose(&self) {
        let engine = self.lock_engine().take();
        drop(engine);
        self.queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.hooks.clear();
        let tracer = self
            .tracer
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tracer) = tracer {
            if tracer.is_running() {
                if let Err(e) = tracer.stop() {
                    warn!(cpu = self.cpu_id, error = %e, "execution tracer failed while stopping");
                }
            }
        }
        debug!(cpu = self.cpu_id, "translation backend disposed");
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

impl std::fmt::Debug for TranslationBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslationBackend")
            .field("cpu_id", &self.cpu_id)
            .field("architecture", &self.architecture)
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

/// Host callbacks of one engine call.
struct ExecutionContext<'a> {
    backend: &'a TranslationBackend,
    cpu: &'a TranslationCpu,
}

impl EngineHost for ExecutionContext<'_> {
    fn block_begin(&mut self, pc: u64, size: u32) -> bool {
        let backend = self.backend;
        backend.cached_pc.store(pc, Ordering::Release);
        backend.hooks.reactivate();
        backend.update_block_begin_hook_present();

        let hook = backend
            .block_begin_hook
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            backend.run_block_hook(&hook, self.cpu, pc, size);
        }
        !(self.cpu.is_effectively_halted() || self.cpu.is_paused())
    }

    fn block_finished(&mut self, pc: u64, executed: u32) {
        let backend = self.backend;
        let hook = backend
            .block_finished_hook
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            backend.run_block_hook(&hook, self.cpu, pc, executed);
        }
        if let Some(tracer) = backend
            .tracer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            tracer.enqueue(pc, executed);
        }
    }

    fn read(&mut self, address: u64, width: AccessWidth) -> Option<u64> {
        let backend = self.backend;
        let _token = backend.guard.initialize();
        let watchpoints = backend.bus.watchpoints_at(address, Access::Read);
        if backend.guard.intercept(
            &watchpoints,
            &backend.link,
            backend.cpu_id,
            address,
            width,
            0,
        ) {
            return None;
        }
        Some(backend.bus.read(address, width, Some(backend.cpu_id)))
    }

    fn write(&mut self, address: u64, width: AccessWidth, value: u64) -> bool {
        let backend = self.backend;
        let _token = backend.guard.initialize();
        let watchpoints = backend.bus.watchpoints_at(address, Access::Write);
        if backend.guard.intercept(
            &watchpoints,
            &backend.link,
            backend.cpu_id,
            address,
            width,
            value,
        ) {
            return false;
        }
        backend.bus.write(address, width, value, Some(backend.cpu_id));
        true
    }
}

/// A [`Cpu`] driven by a translation engine.
///
/// Dereferences to [`Cpu`] for the lifecycle, stepping and time API.
#[derive(Clone)]
pub struct TranslationCpu {
    cpu: Cpu,
    backend: Arc<TranslationBackend>,
}

impl TranslationCpu {
    /// Creates a paused CPU around `engine`, decoding interrupts with the default decoder.
    ///
    /// # Arguments
    ///
    /// * `config` - Identity, performance and protocol tunables.
    /// * `machine_name` - Used in the CPU thread name.
    /// * `engine` - The engine instance owned by this CPU.
    /// * `bus` - System bus for guest accesses.
    pub fn new(
        config: &CpuConfig,
        machine_name: &str,
        engine: Box<dyn ExecutionEngine>,
        bus: Arc<dyn BusController>,
    ) -> Result<Self, CpuError> {
        Self::with_decoder(
            config,
            machine_name,
            engine,
            bus,
            Box::new(DefaultInterruptDecoder),
        )
    }

    /// Like [`TranslationCpu::new`] with an architecture-specific interrupt decoder.
    pub fn with_decoder(
        config: &CpuConfig,
        machine_name: &str,
        engine: Box<dyn ExecutionEngine>,
        bus: Arc<dyn BusController>,
        decoder: Box<dyn InterruptDecoder>,
    ) -> Result<Self, CpuError> {
        config.validate()?;
        let backend = TranslationBackend::new(config, engine, bus, decoder);
        let cpu = Cpu::new(
            config,
            machine_name,
            Arc::clone(&backend) as Arc<dyn CpuBackend>,
        )?;
        Ok(Self { cpu, backend })
    }

    /// Recovers the translation view of `cpu`, if it has a translation backend.
    pub fn from_cpu(cpu: &Cpu) -> Option<Self> {
        let backend = Arc::clone(cpu.backend())
            .into_any()
            .downcast::<TranslationBackend>()
            .ok()?;
        Some(Self {
            cpu: cpu.clone(),
            backend,
        })
    }

    /// The underlying CPU handle.
    pub const fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    /// Request table shared with the engine.
    pub fn link(&self) -> &Arc<EngineLink> {
        &self.backend.link
    }

    // ---- hooks -------------------------------------------------------------

    /// Registers a breakpoint hook. It takes effect from the next engine call.
    pub fn add_hook(&self, address: u64, hook: HookCallback) {
        self.backend.hooks.add(address, hook);
        self.backend.link.request_return();
    }

    /// Removes one hook. Warns and returns `false` if it is not registered at `address`.
    pub fn remove_hook(&self, address: u64, hook: &HookCallback) -> bool {
        let removed = self.backend.hooks.remove(address, hook);
        self.backend.update_block_begin_hook_present();
        removed
    }

    /// Removes every hook at `address`.
    pub fn remove_hooks_at(&self, address: u64) {
        self.backend.hooks.remove_at(address);
        self.backend.update_block_begin_hook_present();
    }

    /// Removes `hook` wherever it is registered.
    pub fn remove_hooks(&self, hook: &HookCallback) -> usize {
        let removed = self.backend.hooks.remove_callback(hook);
        self.backend.update_block_begin_hook_present();
        removed
    }

    /// Removes every hook.
    pub fn remove_all_hooks(&self) {
        self.backend.hooks.clear();
        self.backend.update_block_begin_hook_present();
    }

    /// Addresses with at least one hook.
    pub fn hook_addresses(&self) -> Vec<u64> {
        self.backend.hooks.addresses()
    }

    /// Sets or clears the hook run before every translated block.
    ///
    /// A pause ordered inside the hook stops at the block boundary.
    pub fn set_block_begin_hook(&self, hook: Option<BlockHook>) {
        *self
            .backend
            .block_begin_hook
            .write()
            .unwrap_or_else(PoisonError::into_inner) = hook;
        self.backend.update_block_begin_hook_present();
    }

    /// Sets or clears the hook run after every finished block.
    pub fn set_block_finished_hook(&self, hook: Option<BlockHook>) {
        *self
            .backend
            .block_finished_hook
            .write()
            .unwrap_or_else(PoisonError::into_inner) = hook;
    }

    /// Streams finished blocks into `tracer`. `None` detaches the current one.
    pub fn attach_tracer(&self, tracer: Option<Arc<ExecutionTracer>>) {
        *self
            .backend
            .tracer
            .write()
            .unwrap_or_else(PoisonError::into_inner) = tracer;
    }

    // ---- CPU-thread services -------------------------------------------

    /// Runs `action` on the CPU thread before the next engine call.
    pub fn invoke_on_cpu_thread<F>(&self, action: F)
    where
        F: FnOnce(&mut dyn ExecutionEngine) + Send + 'static,
    {
        self.backend.queue(Box::new(action));
    }

    /// Switches to stepping from inside the CPU thread and raises `Halted(args)`.
    ///
    /// Ignored with a warning on any other thread.
    pub fn enter_single_step_mode_safely(&self, args: HaltArguments, blocking: Option<bool>) -> bool {
        if !self.cpu.on_possessed_thread() {
            warn!(
                cpu = self.cpu.id(),
                "{}; ignoring",
                CpuError::WrongThread {
                    operation: "enter_single_step_mode_safely"
                }
            );
            return false;
        }
        let _ = self.cpu.change_execution_mode_to_single_step(blocking);
        self.cpu.emit_halted(args);
        true
    }

    /// Drops all translated code before the next engine call.
    pub fn clear_translation_cache(&self) {
        self.backend.link.request_cache_flush();
        self.backend.link.request_return();
    }

    // ---- interrupts ----------------------------------------------------------

    /// Drives interrupt line `number`.
    ///
    /// Lines are ignored before the CPU starts, and while stepping with
    /// `disable_interrupts_while_stepping` unless the guest waits for an interrupt.
    pub fn on_gpio(&self, number: i32, value: bool) -> Result<(), CpuError> {
        let category = self.backend.decoder.decode(number)?;
        let waiting = self.backend.waiting_for_interrupt.load(Ordering::Acquire);
        let masked = self.backend.disable_interrupts_while_stepping && self.cpu.is_single_step_mode();
        let forward = self.cpu.is_started() && (waiting || !masked);
        if !forward {
            trace!(cpu = self.cpu.id(), number, value, "interrupt line ignored");
            return Ok(());
        }
        let asserted = self
            .backend
            .interrupts
            .set(category, number, value, &self.backend.link);
        trace!(cpu = self.cpu.id(), number, value, ?category, asserted, "interrupt line changed");
        if !self.backend.synchronized_io {
            self.cpu.wake_from_idle();
        }
        Ok(())
    }

    // ---- snapshots -----------------------------------------------------------

    /// Captures the engine state. The CPU must be paused.
    pub fn export_snapshot(&self) -> Result<CpuSnapshot, CpuError> {
        if !self.cpu.is_paused() {
            return Err(CpuError::NotPaused(self.cpu.id()));
        }
        let slot = self.backend.lock_engine();
        let engine = slot
            .as_ref()
            .ok_or_else(|| CpuError::EngineState("engine disposed".to_string()))?;
        Ok(CpuSnapshot {
            architecture: self.backend.architecture.clone(),
            cpu_id: self.cpu.id(),
            pc: engine.pc(),
            executed_instructions: self.backend.executed_instructions(),
            skipped_instructions: self.cpu.skipped_instructions(),
            engine_state: engine.export_state(),
        })
    }

    /// Restores a snapshot taken from a CPU with the same architecture. The CPU
    /// must be paused.
    pub fn import_snapshot(&self, snapshot: &CpuSnapshot) -> Result<(), CpuError> {
        if !self.cpu.is_paused() {
            return Err(CpuError::NotPaused(self.cpu.id()));
        }
        if snapshot.architecture != self.backend.architecture {
            return Err(CpuError::SnapshotMismatch(format!(
                "snapshot of a {} CPU cannot be loaded into a {} CPU",
                snapshot.architecture, self.backend.architecture
            )));
        }
        let mut slot = self.backend.lock_engine();
        let engine = slot
            .as_mut()
            .ok_or_else(|| CpuError::EngineState("engine disposed".to_string()))?;
        engine
            .import_state(&snapshot.engine_state)
            .map_err(|e| CpuError::EngineState(e.reason))?;
        self.backend.cached_pc.store(engine.pc(), Ordering::Release);
        drop(slot);
        self.backend
            .total_executed
            .store(snapshot.executed_instructions, Ordering::Release);
        debug!(cpu = self.cpu.id(), pc = format_args!("{:#x}", snapshot.pc), "snapshot restored");
        Ok(())
    }
}

impl Deref for TranslationCpu {
    type Target = Cpu;

    fn deref(&self) -> &Cpu {
        &self.cpu
    }
}

impl std::fmt::Debug for TranslationCpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslationCpu")
            .field("cpu", &self.cpu)
            .field("architecture", &self.backend.architecture)
            .finish()
    }
}
