//! Per-CPU execution driver and time negotiation.
//!
//! A [`Cpu`] owns one OS thread at a time. The thread loops until the CPU is paused
//! or aborted:
//! 1. **Stepping:** In a stepping mode it announces `Halted(Step)` and waits on the
//!    [`Synchronizer`] for a step command.
//! 2. **Quantum:** It requests an interval from its [`TimeHandle`], converts it to an
//!    instruction budget and executes bounded bursts through the [`CpuBackend`].
//! 3. **Settlement:** It reports progress as it goes and settles the quantum with
//!    `report_back_and_continue` or `report_back_and_break`, carrying sub-tick residue.
//!
//! Pausing from the CPU thread only raises flags. Pausing from any other thread
//! additionally probes the time handle until the thread has exited.

use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

use object::Object;
use tracing::{debug, error, info, trace, warn};

use crate::common::{CpuError, EventList, SubscriptionId};
use crate::config::CpuConfig;
use crate::time::{
    ClockSource, HostTimeSync, NoLimitClock, QuantumAccount, Settlement, Sleeper, TimeHandle,
    TimeHandleEvent, TimeInterval, Unthrottled,
};

use super::core::{CpuCore, Transition};
use super::{
    Bitness, CpuBackend, CpuState, Endianness, ExecutionMode, ExecutionResult, HaltArguments,
    HaltReason, StateChange, Synchronizer,
};

/// Largest budget handed to a backend in one call.
const MAX_BURST: u64 = i32::MAX as u64;

#[derive(Debug, Default)]
struct ThreadSlot {
    handle: Option<JoinHandle<()>>,
    running: bool,
    restart_requested: bool,
    thread_id: Option<ThreadId>,
}

#[derive(Debug, Default)]
struct HaltState {
    requested: bool,
    current: bool,
    was_running_when_halted: bool,
}

struct AttachedTime {
    handle: Arc<dyn TimeHandle>,
    subscriptions: Vec<(TimeHandleEvent, SubscriptionId)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BurstResult {
    ExecutedInstructions,
    NothingExecuted,
    MmuFault,
    Aborted,
}

struct CpuInner {
    id: u32,
    model: String,
    thread_name: String,
    bitness: Bitness,
    endianness: Endianness,
    performance_in_mips: AtomicU64,
    never_wait_for_interrupt: AtomicBool,
    debugger_connected: AtomicBool,
    should_enter_debug_mode: AtomicBool,
    pause_probe_timeout: Duration,
    pause_probe_warn_after: u32,

    core: CpuCore,
    thread: Mutex<ThreadSlot>,
    thread_exited: Condvar,
    synchronizer: Synchronizer,
    step_lock: Mutex<()>,
    mode: Mutex<ExecutionMode>,
    halted: Mutex<HaltState>,
    current_halted: AtomicBool,
    state: Mutex<CpuState>,
    disposing: AtomicBool,

    time: RwLock<Option<AttachedTime>>,
    clock: RwLock<Arc<dyn ClockSource>>,
    host_sync: RwLock<Arc<dyn HostTimeSync>>,
    sleeper: Sleeper,
    account: Mutex<QuantumAccount>,
    skip_instructions: AtomicU64,
    skipped_instructions: AtomicU64,

    backend: Arc<dyn CpuBackend>,
    halted_event: EventList<HaltArguments>,
    state_changed: EventList<StateChange>,
}

/// Handle to a schedulable CPU. Clones refer to the same CPU.
#[derive(Clone)]
pub struct Cpu {
    inner: Arc<CpuInner>,
}

/// Non-owning counterpart of [`Cpu`].
#[derive(Clone, Default)]
pub struct WeakCpu(Weak<CpuInner>);

impl WeakCpu {
    /// The CPU, if it still exists.
    pub fn upgrade(&self) -> Option<Cpu> {
        self.0.upgrade().map(|inner| Cpu { inner })
    }
}

impl std::fmt::Debug for WeakCpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WeakCpu")
    }
}

impl Cpu {
    /// Creates a paused CPU in [`CpuState::InReset`].
    ///
    /// # Arguments
    ///
    /// * `config` - Identity, performance and protocol tunables.
    /// * `machine_name` - Used in the CPU thread name.
    /// * `backend` - The flavour that executes instructions.
    pub fn new(
        config: &CpuConfig,
        machine_name: &str,
        backend: Arc<dyn CpuBackend>,
    ) -> Result<Self, CpuError> {
        config.validate()?;
        let thread_name = format!("{machine_name}: {} cpu{}", config.model, config.id);
        let inner = CpuInner {
            id: config.id,
            model: config.model.clone(),
            thread_name,
            bitness: config.bitness,
            endianness: config.endianness,
            performance_in_mips: AtomicU64::new(config.performance_in_mips),
            never_wait_for_interrupt: AtomicBool::new(config.never_wait_for_interrupt),
            debugger_connected: AtomicBool::new(false),
            should_enter_debug_mode: AtomicBool::new(false),
            pause_probe_timeout: Duration::from_millis(config.pause_probe_timeout_ms),
            pause_probe_warn_after: config.pause_probe_warn_after.max(1),
            core: CpuCore::new(),
            thread: Mutex::new(ThreadSlot::default()),
            thread_exited: Condvar::new(),
            synchronizer: Synchronizer::new(),
            step_lock: Mutex::new(()),
            mode: Mutex::new(ExecutionMode::Continuous),
            halted: Mutex::new(HaltState::default()),
            current_halted: AtomicBool::new(false),
            state: Mutex::new(CpuState::InReset),
            disposing: AtomicBool::new(false),
            time: RwLock::new(None),
            clock: RwLock::new(Arc::new(NoLimitClock)),
            host_sync: RwLock::new(Arc::new(Unthrottled)),
            sleeper: Sleeper::new(),
            account: Mutex::new(QuantumAccount::new()),
            skip_instructions: AtomicU64::new(0),
            skipped_instructions: AtomicU64::new(0),
            backend,
            halted_event: EventList::new(),
            state_changed: EventList::new(),
        };
        let cpu = Self {
            inner: Arc::new(inner),
        };
        cpu.refresh_wfi_policy();
        debug!(cpu = cpu.id(), model = %cpu.model(), "CPU created");
        Ok(cpu)
    }

    /// Multiprocessing id.
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Model name.
    pub fn model(&self) -> &str {
        &self.inner.model
    }

    /// Instruction set name.
    pub fn architecture(&self) -> &str {
        self.inner.backend.architecture()
    }

    /// Register width.
    pub fn bitness(&self) -> Bitness {
        self.inner.bitness
    }

    /// Byte order.
    pub fn endianness(&self) -> Endianness {
        self.inner.endianness
    }

    /// Name given to the CPU thread.
    pub fn thread_name(&self) -> &str {
        &self.inner.thread_name
    }

    /// The flavour executing instructions.
    pub fn backend(&self) -> &Arc<dyn CpuBackend> {
        &self.inner.backend
    }

    /// Whether `other` is a handle to the same CPU.
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// A handle that does not keep the CPU alive.
    pub fn downgrade(&self) -> WeakCpu {
        WeakCpu(Arc::downgrade(&self.inner))
    }

    /// Instructions per microsecond.
    pub fn performance_in_mips(&self) -> u64 {
        self.inner.performance_in_mips.load(Ordering::Acquire)
    }

    /// Changes the performance rating. Zero is rejected.
    pub fn set_performance_in_mips(&self, mips: u64) -> Result<(), CpuError> {
        if mips == 0 {
            return Err(CpuError::InvalidConfig {
                field: "performance_in_mips",
                reason: "performance must be positive".to_string(),
            });
        }
        self.inner.performance_in_mips.store(mips, Ordering::Release);
        Ok(())
    }

    /// Whether wait-for-interrupt is treated as a no-op.
    pub fn never_wait_for_interrupt(&self) -> bool {
        self.inner.never_wait_for_interrupt.load(Ordering::Acquire)
    }

    /// Treat wait-for-interrupt as a no-op instead of idling.
    pub fn set_never_wait_for_interrupt(&self, value: bool) {
        self.inner
            .never_wait_for_interrupt
            .store(value, Ordering::Release);
        self.refresh_wfi_policy();
    }

    // ---- lifecycle -------------------------------------------------------

    /// Whether the CPU was resumed at least once since it was created or disposed.
    pub fn is_started(&self) -> bool {
        self.inner.core.is_started()
    }

    /// Whether the CPU is paused.
    pub fn is_paused(&self) -> bool {
        self.inner.core.is_paused()
    }

    /// Whether the CPU aborted.
    pub fn is_aborted(&self) -> bool {
        self.inner.core.is_aborted()
    }

    /// Emulation-level state.
    pub fn state(&self) -> CpuState {
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, new: CpuState) {
        let old = {
            let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            let old = *state;
            if old == new {
                return;
            }
            *state = new;
            old
        };
        if old == CpuState::InReset {
            self.inner.backend.on_leaving_reset_state();
        }
        debug!(cpu = self.id(), ?old, ?new, "state changed");
        self.inner.state_changed.emit(&StateChange {
            cpu_id: self.id(),
            old,
            new,
        });
    }

    /// Equivalent to [`Cpu::resume`].
    pub fn start(&self) {
        self.resume();
    }

    /// Resumes execution.
    ///
    /// No-op if the CPU is aborted or running, or if a blocking pause is in flight.
    pub fn resume(&self) {
        if self.time_handle().is_none() {
            warn!(cpu = self.id(), "cannot resume a CPU without a time handle");
            return;
        }
        let on_cpu_thread = self.on_possessed_thread();
        let resumed = self
            .inner
            .core
            .resume(on_cpu_thread, |transition| self.on_resume(transition));
        if resumed {
            if self.state() == CpuState::InReset && !self.is_effectively_halted() {
                self.set_state(CpuState::Running);
            }
            debug!(cpu = self.id(), "resumed");
        }
    }

    fn on_resume(&self, transition: &mut Transition<'_>) {
        self.inner
            .synchronizer
            .set_enabled(self.execution_mode().is_single_step());
        if let Err(e) = self.start_thread_locked() {
            error!(cpu = self.id(), error = %e, "cannot start the CPU thread");
            transition.set_paused(true);
        }
    }

    /// Pauses the CPU and raises `Halted(Pause)`.
    ///
    /// From a foreign thread this blocks until the CPU thread has stopped. From the
    /// CPU thread it only raises the pause flags; the thread stops at the next
    /// safe point.
    ///
    /// Returns [`CpuError::PauseOutsideGuard`] if called on the CPU thread while the
    /// engine executes, but neither inside a bus access nor inside a block hook.
    /// The CPU still pauses in that case.
    pub fn pause(&self) -> Result<(), CpuError> {
        self.pause_with(HaltArguments::new(HaltReason::Pause, self.id()), true)
    }

    pub(crate) fn pause_with(
        &self,
        args: HaltArguments,
        check_pause_guard: bool,
    ) -> Result<(), CpuError> {
        if self.is_aborted() || self.is_paused() {
            return Ok(());
        }
        let on_cpu_thread = self.on_possessed_thread();
        let Some(mut transition) = self.inner.core.lock_unless_pausing(on_cpu_thread) else {
            return Ok(());
        };
        if self.is_aborted() || self.is_paused() {
            return Ok(());
        }
        self.request_pause_locked(&mut transition);

        if on_cpu_thread {
            let ordered = if check_pause_guard {
                self.inner.backend.order_pause(self)
            } else {
                Ok(())
            };
            drop(transition);
            ordered?;
        } else {
            transition.mark_pause_in_progress();
            drop(transition);
            self.inner.synchronizer.set_enabled(false);
            trace!(cpu = self.id(), "waiting for the CPU thread to pause");
            self.wait_for_thread_exit();
            self.inner.core.finish_pause();
            trace!(cpu = self.id(), "paused");
        }

        self.emit_halted(args);
        Ok(())
    }

    /// Non-blocking pause request; safe from any thread and idempotent.
    pub fn request_pause(&self) {
        let mut transition = self.inner.core.lock();
        self.request_pause_locked(&mut transition);
    }

    fn request_pause_locked(&self, transition: &mut Transition<'_>) {
        transition.set_paused(true);
        trace!(cpu = self.id(), "requesting pause");
        self.inner.backend.request_return();
        self.inner.sleeper.interrupt();
        if let Some(handle) = self.time_handle() {
            let _ = handle.interrupt(Duration::ZERO);
        }
    }

    /// Probes the CPU thread until it exits, then joins it.
    fn wait_for_thread_exit(&self) {
        let mut attempts: u64 = 0;
        let mut slot = self.lock_thread();
        while slot.running {
            drop(slot);
            if let Some(handle) = self.time_handle() {
                let _ = handle.interrupt(self.inner.pause_probe_timeout);
            }
            self.inner.sleeper.interrupt();
            self.inner.backend.request_return();

            slot = self.lock_thread();
            if !slot.running {
                break;
            }
            slot = self
                .inner
                .thread_exited
                .wait_timeout(slot, self.inner.pause_probe_timeout)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
            attempts += 1;
            if attempts % u64::from(self.inner.pause_probe_warn_after) == 0 {
                warn!(
                    cpu = self.id(),
                    attempts, "CPU thread has not stopped yet; still probing"
                );
            }
        }
        let handle = slot.handle.take();
        drop(slot);
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(cpu = self.id(), "CPU thread terminated by a panic");
            }
        }
    }

    /// Clears the aborted flag, pauses and returns the CPU to [`CpuState::InReset`].
    pub fn reset(&self) -> Result<(), CpuError> {
        self.inner.core.clear_abort();
        self.pause_with(HaltArguments::new(HaltReason::Pause, self.id()), false)?;
        self.inner.backend.reset();
        self.inner
            .account
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .discard();
        self.inner.skip_instructions.store(0, Ordering::Release);
        self.set_state(CpuState::InReset);
        debug!(cpu = self.id(), "reset");
        Ok(())
    }

    /// Pauses with `Halted(Abort)`, joins the CPU thread and releases the time handle
    /// and the backend. Further lifecycle calls are no-ops.
    pub fn dispose(&self) {
        if self.inner.disposing.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(cpu = self.id(), "about to dispose CPU");
        self.inner.core.lock().set_started(false);
        let _ = self.pause_with(HaltArguments::new(HaltReason::Abort, self.id()), false);
        self.inner.core.abort();

        if !self.on_possessed_thread() {
            let handle = self.lock_thread().handle.take();
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    warn!(cpu = self.id(), "CPU thread terminated by a panic");
                }
            }
        }
        self.detach_time_handle();
        self.inner.backend.dispose();
        self.inner.halted_event.clear();
        self.inner.state_changed.clear();
    }

    /// Whether [`Cpu::dispose`] was called.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposing.load(Ordering::Acquire)
    }

    // ---- halting and execution modes -------------------------------------

    /// Whether a halt was requested with [`Cpu::set_halted`].
    pub fn is_halted(&self) -> bool {
        self.lock_halted().requested
    }

    /// Whether the CPU is effectively halted: requested, or stepping non-blocking
    /// between two steps.
    pub fn is_effectively_halted(&self) -> bool {
        self.inner.current_halted.load(Ordering::Acquire)
    }

    /// Requests or clears a halt.
    ///
    /// Halting a running CPU pauses it and remembers to resume it when the halt is
    /// cleared. Clearing the halt also leaves [`CpuState::InReset`].
    pub fn set_halted(&self, value: bool) {
        {
            let mut halted = self.lock_halted();
            if halted.requested == value {
                return;
            }
            halted.requested = value;
        }
        trace!(cpu = self.id(), value, "halted flag changed");
        let _ = self.update_halted_state(false);

        if value {
            if self.is_started() && !self.is_paused() {
                self.lock_halted().was_running_when_halted = true;
                let _ = self.pause_with(HaltArguments::new(HaltReason::Pause, self.id()), false);
            }
        } else {
            if self.state() == CpuState::InReset {
                self.set_state(CpuState::Running);
            }
            let was_running = std::mem::take(&mut self.lock_halted().was_running_when_halted);
            if was_running {
                self.resume();
            }
        }
    }

    /// Recomputes the effective halted state and gates the time handle with it.
    ///
    /// Returns `true` if the state changed.
    pub(crate) fn update_halted_state(&self, ignore_execution_mode: bool) -> bool {
        let mode = self.execution_mode();
        let mut halted = self.lock_halted();
        let should_be_halted = halted.requested
            || (mode == ExecutionMode::SingleStepNonBlocking && !ignore_execution_mode);
        if should_be_halted == halted.current {
            return false;
        }
        halted.current = should_be_halted;
        self.inner
            .current_halted
            .store(should_be_halted, Ordering::Release);
        if let Some(handle) = self.time_handle() {
            handle.set_deferred_enabled(!should_be_halted);
        }
        true
    }

    /// Current execution mode.
    pub fn execution_mode(&self) -> ExecutionMode {
        *self.inner.mode.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Changes the execution mode.
    pub fn set_execution_mode(&self, mode: ExecutionMode) {
        {
            let mut current = self.inner.mode.lock().unwrap_or_else(PoisonError::into_inner);
            if *current == mode {
                return;
            }
            *current = mode;
        }
        debug!(cpu = self.id(), %mode, "execution mode changed");
        self.inner.synchronizer.set_enabled(mode.is_single_step());
        let _ = self.update_halted_state(false);
        self.refresh_wfi_policy();
        self.inner.backend.execution_mode_changed(mode);
    }

    /// Whether the CPU is in one of the stepping modes.
    pub fn is_single_step_mode(&self) -> bool {
        self.execution_mode().is_single_step()
    }

    /// Switches to a stepping mode, keeping the current flavour unless `blocking`
    /// says otherwise. Returns whether the resulting mode is blocking.
    pub(crate) fn change_execution_mode_to_single_step(&self, blocking: Option<bool>) -> bool {
        let mode = self.execution_mode();
        let is_non_blocking = mode == ExecutionMode::SingleStepNonBlocking;
        if blocking == Some(is_non_blocking) {
            let target = if is_non_blocking {
                ExecutionMode::SingleStepBlocking
            } else {
                ExecutionMode::SingleStepNonBlocking
            };
            warn!(
                cpu = self.id(),
                from = %mode,
                to = %target,
                "changing current step configuration"
            );
        }
        let blocking = blocking.unwrap_or(!is_non_blocking);
        self.set_execution_mode(if blocking {
            ExecutionMode::SingleStepBlocking
        } else {
            ExecutionMode::SingleStepNonBlocking
        });
        blocking
    }

    /// Whether a debugger is attached.
    pub fn debugger_connected(&self) -> bool {
        self.inner.debugger_connected.load(Ordering::Acquire)
    }

    /// Marks a debugger as attached or detached.
    pub fn set_debugger_connected(&self, value: bool) {
        self.inner.debugger_connected.store(value, Ordering::Release);
        self.refresh_wfi_policy();
    }

    /// Whether debug mode was requested.
    pub fn should_enter_debug_mode(&self) -> bool {
        self.inner.should_enter_debug_mode.load(Ordering::Acquire)
    }

    /// Requests debug mode, which disables interrupt idling while a debugger steps
    /// the CPU. Warns if it cannot take effect yet.
    pub fn set_should_enter_debug_mode(&self, value: bool) {
        if value && !(self.debugger_connected() && self.is_single_step_mode()) {
            warn!(
                cpu = self.id(),
                "debug mode now has no effect; connect a debugger and switch to stepping mode"
            );
        }
        self.inner
            .should_enter_debug_mode
            .store(value, Ordering::Release);
        self.refresh_wfi_policy();
    }

    /// Debugger attached, debug mode requested and stepping.
    pub fn in_debug_mode(&self) -> bool {
        self.debugger_connected() && self.should_enter_debug_mode() && self.is_single_step_mode()
    }

    fn refresh_wfi_policy(&self) {
        let nop = self.never_wait_for_interrupt() || self.in_debug_mode();
        self.inner.backend.set_wfi_as_nop(nop);
    }

    // ---- stepping and skipping -------------------------------------------

    /// Executes `count` instructions in a stepping mode and returns the PC.
    ///
    /// `blocking` selects the stepping flavour; `None` keeps the current one. On a
    /// halted CPU, or when called from the CPU thread, this logs a warning and
    /// returns the PC unchanged.
    pub fn step(&self, count: u32, blocking: Option<bool>) -> u64 {
        if self.is_halted() {
            warn!(cpu = self.id(), "ignoring stepping on a halted CPU");
            return self.pc();
        }
        if self.on_possessed_thread() {
            warn!(cpu = self.id(), "ignoring stepping requested from the CPU thread");
            return self.pc();
        }
        let _serial = self
            .inner
            .step_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let _ = self.change_execution_mode_to_single_step(blocking);
        self.resume();
        trace!(cpu = self.id(), count, "stepping");

        if let Some(handle) = self.time_handle() {
            handle.set_deferred_enabled(true);
        }
        // Let virtual time be granted without clearing the halted state.
        if self.execution_mode() == ExecutionMode::SingleStepNonBlocking {
            let _ = self.update_halted_state(true);
        }

        self.inner.synchronizer.command_step(count);
        self.inner.synchronizer.wait_for_step_finished();

        let _ = self.update_halted_state(false);
        self.pc()
    }

    /// Skips `amount` of virtual time without executing.
    ///
    /// Only the CPU thread may do this; other callers are warned and ignored. If the
    /// time does not convert to a whole number of instructions, one more microsecond
    /// is skipped.
    pub fn skip_time(&self, amount: TimeInterval) -> bool {
        let mips = self.performance_in_mips();
        let (mut instructions, residuum) = amount.to_cpu_cycles(mips);
        if !residuum.is_empty() {
            instructions = instructions.saturating_add(mips);
            let (real, _) = TimeInterval::from_cpu_cycles(instructions, mips);
            warn!(
                cpu = self.id(),
                skipped = %real,
                "conversion from time to instructions is not exact"
            );
        }
        self.skip_instructions(instructions)
    }

    /// Skips `count` instructions of virtual time without executing them.
    ///
    /// Only the CPU thread may do this; other callers are warned and ignored.
    pub fn skip_instructions(&self, count: u64) -> bool {
        if !self.on_possessed_thread() {
            let violation = CpuError::WrongThread {
                operation: "skip_instructions",
            };
            warn!(cpu = self.id(), "{violation}; ignoring");
            return false;
        }
        let _ = self.inner.skip_instructions.fetch_add(count, Ordering::AcqRel);
        self.inner.backend.request_return();
        true
    }

    /// Instructions still to be skipped.
    pub fn pending_skip_instructions(&self) -> u64 {
        self.inner.skip_instructions.load(Ordering::Acquire)
    }

    /// Instructions skipped so far.
    pub fn skipped_instructions(&self) -> u64 {
        self.inner.skipped_instructions.load(Ordering::Acquire)
    }

    /// Instructions executed since reset.
    pub fn executed_instructions(&self) -> u64 {
        self.inner.backend.executed_instructions()
    }

    /// Instructions executed but not yet reported as time.
    pub fn executed_residuum(&self) -> u64 {
        self.inner
            .account
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .executed_residuum()
    }

    /// Synchronises buffered time with the time framework. Nothing is buffered by default.
    pub fn sync_time(&self) {}

    // ---- registers and images --------------------------------------------

    /// Program counter.
    pub fn pc(&self) -> u64 {
        self.inner.backend.pc()
    }

    /// Sets the program counter.
    pub fn set_pc(&self, pc: u64) {
        self.inner.backend.set_pc(pc);
    }

    /// Points the PC at the entry of an ELF image.
    ///
    /// Images wider than the CPU are rejected and leave the PC unchanged.
    pub fn init_from_elf(&self, image: &[u8]) -> Result<(), CpuError> {
        let file = object::File::parse(image)?;
        let elf_bits = if file.is_64() { 64 } else { 32 };
        let cpu_bits = self.bitness().bits();
        if elf_bits > cpu_bits {
            return Err(CpuError::UnsupportedElf { elf_bits, cpu_bits });
        }
        let entry = file.entry();
        info!(cpu = self.id(), "setting PC value to {entry:#x}");
        self.set_pc(entry);
        Ok(())
    }

    // ---- time framework --------------------------------------------------

    /// The attached time handle.
    pub fn time_handle(&self) -> Option<Arc<dyn TimeHandle>> {
        self.inner
            .time
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|attached| Arc::clone(&attached.handle))
    }

    /// Attaches a time handle, disposing the previous one.
    ///
    /// The handle is enabled unless the CPU is halted. Its `PauseRequested` event
    /// requests a pause; its `StartRequested` event starts the CPU thread.
    pub fn set_time_handle(&self, handle: Arc<dyn TimeHandle>) {
        trace!(cpu = self.id(), "setting a new time handle");
        self.detach_time_handle();

        let halted = self.lock_halted();
        let weak = Arc::downgrade(&self.inner);
        let on_pause = {
            let weak = Weak::clone(&weak);
            handle.subscribe(
                TimeHandleEvent::PauseRequested,
                Box::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        Self { inner }.request_pause();
                    }
                }),
            )
        };
        let on_start = handle.subscribe(
            TimeHandleEvent::StartRequested,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    Self { inner }.start_cpu_thread();
                }
            }),
        );
        handle.set_enabled(!halted.current);
        *self.inner.time.write().unwrap_or_else(PoisonError::into_inner) = Some(AttachedTime {
            handle,
            subscriptions: vec![
                (TimeHandleEvent::PauseRequested, on_pause),
                (TimeHandleEvent::StartRequested, on_start),
            ],
        });
    }

    fn detach_time_handle(&self) {
        let previous = self
            .inner
            .time
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(previous) = previous {
            for (event, id) in previous.subscriptions {
                let _ = previous.handle.unsubscribe(event, id);
            }
            previous.handle.dispose();
        }
    }

    /// Sets the clock whose nearest limit bounds every burst.
    pub fn set_clock_source(&self, clock: Arc<dyn ClockSource>) {
        *self.inner.clock.write().unwrap_or_else(PoisonError::into_inner) = clock;
    }

    /// Sets the relation between virtual and host time used for idle sleeping.
    pub fn set_host_time_sync(&self, host_sync: Arc<dyn HostTimeSync>) {
        *self
            .inner
            .host_sync
            .write()
            .unwrap_or_else(PoisonError::into_inner) = host_sync;
    }

    fn clock(&self) -> Arc<dyn ClockSource> {
        Arc::clone(&self.inner.clock.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn host_sync(&self) -> Arc<dyn HostTimeSync> {
        Arc::clone(
            &self
                .inner
                .host_sync
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    /// Wakes the CPU from an interrupt-wait sleep.
    pub fn wake_from_idle(&self) {
        self.inner.sleeper.interrupt();
    }

    // ---- events ------------------------------------------------------------

    /// Subscribes to `Halted`.
    pub fn on_halted<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&HaltArguments) + Send + Sync + 'static,
    {
        self.inner.halted_event.subscribe(callback)
    }

    /// Unsubscribes from `Halted`.
    pub fn remove_halted_handler(&self, id: SubscriptionId) -> bool {
        self.inner.halted_event.unsubscribe(id)
    }

    /// Subscribes to `StateChanged`.
    pub fn on_state_changed<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.inner.state_changed.subscribe(callback)
    }

    /// Unsubscribes from `StateChanged`.
    pub fn remove_state_changed_handler(&self, id: SubscriptionId) -> bool {
        self.inner.state_changed.unsubscribe(id)
    }

    pub(crate) fn emit_halted(&self, args: HaltArguments) {
        self.inner.halted_event.emit(&args);
    }

    // ---- thread ownership ------------------------------------------------

    fn lock_thread(&self) -> MutexGuard<'_, ThreadSlot> {
        self.inner
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_halted(&self) -> MutexGuard<'_, HaltState> {
        self.inner
            .halted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the caller runs on the CPU thread.
    pub fn on_possessed_thread(&self) -> bool {
        let current = std::thread::current().id();
        self.lock_thread().thread_id == Some(current)
    }

    /// Whether a CPU thread currently exists.
    pub fn is_thread_running(&self) -> bool {
        self.lock_thread().running
    }

    /// Starts the CPU thread on behalf of the time source.
    ///
    /// Backs off if a blocking pause is in flight, or the CPU is paused or aborted.
    fn start_cpu_thread(&self) {
        let on_cpu_thread = self.on_possessed_thread();
        let Some(mut transition) = self.inner.core.lock_unless_pausing(on_cpu_thread) else {
            trace!(cpu = self.id(), "start request lost against a pending pause");
            return;
        };
        if self.is_aborted() || self.is_paused() {
            return;
        }
        if let Err(e) = self.start_thread_locked() {
            error!(cpu = self.id(), error = %e, "cannot start the CPU thread");
            transition.set_paused(true);
        }
    }

    /// Spawns the CPU thread, or asks the exiting one to restart its loop.
    ///
    /// Must be called with the pause lock held.
    fn start_thread_locked(&self) -> Result<(), CpuError> {
        let mut slot = self.lock_thread();
        if self.is_aborted() {
            return Ok(());
        }
        if slot.running {
            trace!(cpu = self.id(), "CPU thread still running; requesting restart");
            slot.restart_requested = true;
            return Ok(());
        }
        if let Some(previous) = slot.handle.take() {
            if previous.join().is_err() {
                warn!(cpu = self.id(), "previous CPU thread terminated by a panic");
            }
        }
        if let Some(handle) = self.time_handle() {
            handle.set_sink_active(true);
        }
        let cpu = self.clone();
        let handle = std::thread::Builder::new()
            .name(self.inner.thread_name.clone())
            .spawn(move || cpu.thread_body())
            .map_err(|e| {
                if let Some(handle) = self.time_handle() {
                    handle.set_sink_active(false);
                }
                CpuError::ThreadSpawn(e)
            })?;
        slot.thread_id = Some(handle.thread().id());
        slot.handle = Some(handle);
        slot.running = true;
        slot.restart_requested = false;
        trace!(cpu = self.id(), "CPU thread started");
        Ok(())
    }

    fn thread_body(self) {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            loop {
                self.execution_loop();

                let mut slot = self.lock_thread();
                if slot.restart_requested {
                    slot.restart_requested = false;
                    trace!(cpu = self.id(), "restarting the CPU loop");
                    continue;
                }
                // Deactivate under the slot lock so a successor thread cannot
                // activate the sink before this one lets go of it.
                if let Some(handle) = self.time_handle() {
                    handle.set_sink_active(false);
                }
                slot.running = false;
                slot.thread_id = None;
                self.inner.thread_exited.notify_all();
                break;
            }
        }));

        if let Err(payload) = outcome {
            error!(cpu = self.id(), "CPU loop terminated by a fault");
            if let Some(handle) = self.time_handle() {
                handle.set_sink_active(false);
            }
            {
                let mut slot = self.lock_thread();
                slot.running = false;
                slot.thread_id = None;
                slot.restart_requested = false;
                self.inner.thread_exited.notify_all();
            }
            resume_unwind(payload);
        }
    }

    fn execution_loop(&self) {
        while !self.is_paused() && !self.is_aborted() {
            let single_step = self.is_single_step_mode();
            if single_step {
                let handle = self.time_handle();
                if let Some(handle) = &handle {
                    handle.set_sink_active(false);
                }
                let pc = self.pc();
                trace!(cpu = self.id(), "waiting for a step command (PC={pc:#010x})");
                self.emit_halted(HaltArguments::at(HaltReason::Step, self.id(), pc));
                let commanded = self.inner.synchronizer.wait_for_step_command();
                if let Some(handle) = &handle {
                    handle.set_sink_active(true);
                }
                if !commanded {
                    continue;
                }
            }

            let result = self.run_burst(single_step);

            if single_step {
                match result {
                    BurstResult::NothingExecuted => {}
                    BurstResult::MmuFault => {
                        trace!(cpu = self.id(), "interrupting stepping due to an external MMU fault");
                        self.inner.synchronizer.step_interrupted();
                    }
                    BurstResult::ExecutedInstructions | BurstResult::Aborted => {
                        self.inner.synchronizer.step_finished();
                    }
                }
            }
        }
        if self.is_single_step_mode() {
            // Nobody will acknowledge the remaining steps.
            self.inner.synchronizer.step_interrupted();
        }
    }

    /// Requests one interval and executes it.
    fn run_burst(&self, single_step: bool) -> BurstResult {
        let Some(handle) = self.time_handle() else {
            return BurstResult::NothingExecuted;
        };
        let Some(interval) = handle.request_time_interval() else {
            trace!(cpu = self.id(), "no interval granted");
            return BurstResult::NothingExecuted;
        };
        trace!(cpu = self.id(), ticks = interval.ticks(), "interval granted");

        let mips = self.performance_in_mips();
        let mut account = std::mem::take(
            &mut *self
                .inner
                .account
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let initial_residuum = account.executed_residuum();
        let initial_elapsed = handle.total_elapsed_time();

        if !account.begin(interval, mips, single_step) {
            trace!(cpu = self.id(), "not enough time granted, reporting continue");
            handle.report_back_and_continue(interval);
            self.store_account(account);
            return BurstResult::NothingExecuted;
        }

        let report = |account: &mut QuantumAccount, instructions: u64| {
            if let Some(elapsed) = account.record_progress(instructions, mips) {
                handle.report_progress(elapsed);
            }
        };

        let clock = self.clock();
        let host_sync = self.host_sync();
        let mut mmu_fault = false;
        while !self.is_paused() && !self.is_effectively_halted() && account.instructions_left() > 0
        {
            trace!(
                cpu = self.id(),
                left = account.instructions_left(),
                "CPU burst in progress"
            );
            let mut to_execute = account
                .instructions_to_nearest_limit(clock.nearest_limit_in(), mips)
                .min(account.instructions_left());

            let skip = self.inner.skip_instructions.load(Ordering::Acquire);
            if skip > 0 {
                let amount = skip.min(to_execute);
                trace!(cpu = self.id(), amount, "skipping instructions");
                to_execute -= amount;
                let _ = self
                    .inner
                    .skip_instructions
                    .fetch_sub(amount, Ordering::AcqRel);
                let _ = self
                    .inner
                    .skipped_instructions
                    .fetch_add(amount, Ordering::AcqRel);
                report(&mut account, amount);
            }

            let to_execute = to_execute.min(MAX_BURST);
            let mut result = ExecutionResult::Ok;
            if to_execute > 0 {
                let (outcome, executed) = self.inner.backend.execute_instructions(self, to_execute);
                trace!(cpu = self.id(), executed, ?outcome, "engine returned");
                debug_assert!(
                    executed <= to_execute,
                    "engine executed more instructions than it was asked to"
                );
                report(&mut account, executed.min(to_execute));
                result = outcome;
            }

            if self.inner.backend.execution_finished(self, result) {
                break;
            }

            match result {
                ExecutionResult::WaitingForInterrupt => {
                    if !self.in_debug_mode() && !self.never_wait_for_interrupt() {
                        let mut to_skip = account
                            .instructions_to_nearest_limit(clock.nearest_limit_in(), mips)
                            .min(account.instructions_left());
                        let ahead = host_sync.virtual_time_ahead_of_host();
                        if !host_sync.advance_immediately() && !ahead.is_empty() {
                            // Do not run ahead of the host while idling.
                            let (idle, cycles_residuum) =
                                TimeInterval::from_cpu_cycles(to_skip, mips);
                            let (_, slept) =
                                self.inner.sleeper.sleep(idle.min(ahead).to_duration(), false);
                            to_skip = TimeInterval::from_duration(slept)
                                .to_cpu_cycles(mips)
                                .0
                                .saturating_add(cycles_residuum)
                                .min(to_skip);
                        }
                        report(&mut account, to_skip);
                    }
                }
                ExecutionResult::ExternalMmuFault => {
                    trace!(cpu = self.id(), "external MMU fault");
                    mmu_fault = true;
                    break;
                }
                ExecutionResult::Aborted => {
                    debug!(cpu = self.id(), "CPU abort detected, halting");
                    self.inner.core.abort();
                    self.emit_halted(HaltArguments::at(HaltReason::Abort, self.id(), self.pc()));
                    break;
                }
                ExecutionResult::Interrupted | ExecutionResult::StoppedAtWatchpoint => {
                    trace!(cpu = self.id(), ?result, "burst interrupted");
                    break;
                }
                ExecutionResult::Ok | ExecutionResult::StoppedAtBreakpoint => {}
            }
        }

        let ahead = host_sync.virtual_time_ahead_of_host();
        if !host_sync.advance_immediately() && !ahead.is_empty() {
            // Keep a pending wakeup for the idle handling of the next burst.
            let _ = self.inner.sleeper.sleep(ahead.to_duration(), true);
        }

        if self.is_aborted() {
            trace!(cpu = self.id(), "aborted, reporting continue");
            handle.report_back_and_continue(TimeInterval::EMPTY);
            account.discard();
            self.store_account(account);
            self.set_state(CpuState::Aborted);
            return BurstResult::Aborted;
        }
        if self.is_effectively_halted() {
            trace!(cpu = self.id(), "halted, reporting continue");
            handle.report_back_and_continue(TimeInterval::EMPTY);
            account.discard();
        } else {
            match account.settle(mips) {
                Settlement::Break(time_left) => {
                    trace!(cpu = self.id(), %time_left, "reporting break");
                    handle.report_back_and_break(time_left);
                }
                Settlement::Continue(time_left) => {
                    trace!(cpu = self.id(), %time_left, "finished, reporting continue");
                    handle.report_back_and_continue(time_left);
                }
            }
        }
        let residuum = account.executed_residuum();
        self.store_account(account);

        if mmu_fault {
            BurstResult::MmuFault
        } else if residuum == initial_residuum && handle.total_elapsed_time() == initial_elapsed {
            BurstResult::NothingExecuted
        } else {
            BurstResult::ExecutedInstructions
        }
    }

    fn store_account(&self, account: QuantumAccount) {
        *self
            .inner
            .account
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = account;
    }
}

impl std::fmt::Debug for Cpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cpu")
            .field("id", &self.inner.id)
            .field("model", &self.inner.model)
            .field("started", &self.is_started())
            .field("paused", &self.is_paused())
            .field("aborted", &self.is_aborted())
            .field("mode", &self.execution_mode())
            .finish_non_exhaustive()
    }
}
