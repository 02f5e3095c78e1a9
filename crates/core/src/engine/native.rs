//! Explicit FFI binding table for native translation engines.
//!
//! A native engine is a C library instantiated once per CPU. The scheduler
//! talks to it through [`EngineBindings`], a `#[repr(C)]` table of function
//! pointers, and the library calls back through [`HostCallbacks`].
//!
//! Callbacks carry no context pointer. They reach the executing CPU through a
//! thread-local trampoline that is only set for the duration of `execute`, so a
//! callback arriving outside an `execute` call is answered with a neutral value.

use std::cell::Cell;
use std::collections::BTreeSet;
use std::ffi::{CString, c_char, c_void};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr::NonNull;
use std::sync::Arc;

use tracing::{debug, error};

use crate::bus::AccessWidth;
use crate::common::{CpuError, InstanceCounter};

use super::{EngineAbort, EngineHost, EngineLink, EngineResult, ExecutionEngine};

/// Callbacks the native library makes into the host. All return `0` for "no"/"stop".
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct HostCallbacks {
    /// A block at `pc` with `size` instructions is about to run; non-zero to continue.
    pub block_begin: unsafe extern "C" fn(pc: u64, size: u32) -> u32,
    /// A block at `pc` retired `executed` instructions.
    pub block_finished: unsafe extern "C" fn(pc: u64, executed: u32),
    /// Guest load of `width` bytes; returns non-zero and fills `value` on success.
    pub read: unsafe extern "C" fn(address: u64, width: u32, value: *mut u64) -> u32,
    /// Guest store of `width` bytes; returns non-zero on success.
    pub write: unsafe extern "C" fn(address: u64, width: u32, value: u64) -> u32,
    /// Polled at block boundaries; non-zero when the engine must return.
    pub should_return: unsafe extern "C" fn() -> u32,
}

/// Function table exported by a native engine library.
///
/// `execute` returns one of the [`EngineResult`] codes, or a negative value when
/// the engine aborted.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EngineBindings {
    /// Creates an instance named `name`; returns null on failure.
    pub init: unsafe extern "C" fn(name: *const c_char, callbacks: *const HostCallbacks) -> *mut c_void,
    /// Destroys an instance.
    pub dispose: unsafe extern "C" fn(ctx: *mut c_void),
    /// Runs at most `budget` instructions.
    pub execute: unsafe extern "C" fn(ctx: *mut c_void, budget: i32) -> i32,
    /// Instructions retired by the last `execute`.
    pub get_executed_instructions: unsafe extern "C" fn(ctx: *mut c_void) -> u64,
    /// Reads the program counter.
    pub get_pc: unsafe extern "C" fn(ctx: *mut c_void) -> u64,
    /// Writes the program counter.
    pub set_pc: unsafe extern "C" fn(ctx: *mut c_void, pc: u64),
    /// Power-on reset.
    pub reset: unsafe extern "C" fn(ctx: *mut c_void),
    /// Makes the running `execute` return at the next block boundary.
    pub set_return_request: unsafe extern "C" fn(ctx: *mut c_void),
    /// Installs a breakpoint.
    pub add_breakpoint: unsafe extern "C" fn(ctx: *mut c_void, address: u64),
    /// Removes a breakpoint.
    pub remove_breakpoint: unsafe extern "C" fn(ctx: *mut c_void, address: u64),
    /// Drives an interrupt category line.
    pub set_irq: unsafe extern "C" fn(ctx: *mut c_void, category: u32, value: u32),
    /// Enables the block-begin callback.
    pub set_block_begin_hook_present: unsafe extern "C" fn(ctx: *mut c_void, present: u32),
    /// Treats wait-for-interrupt as a no-op.
    pub set_wfi_as_nop: unsafe extern "C" fn(ctx: *mut c_void, value: u32),
    /// Drops all translated code.
    pub flush_translation_cache: unsafe extern "C" fn(ctx: *mut c_void),
    /// Size of the exported state blob.
    pub get_state_size: unsafe extern "C" fn(ctx: *mut c_void) -> u64,
    /// Copies the state into `buffer`.
    pub export_state: unsafe extern "C" fn(ctx: *mut c_void, buffer: *mut u8, len: u64),
    /// Restores the state from `buffer`; returns non-zero on success.
    pub import_state: unsafe extern "C" fn(ctx: *mut c_void, buffer: *const u8, len: u64) -> i32,
    /// Guest page size.
    pub get_page_size: unsafe extern "C" fn(ctx: *mut c_void) -> u64,
}

#[derive(Clone, Copy)]
struct ActiveCall {
    host: *mut (dyn EngineHost + 'static),
    link: *const EngineLink,
}

thread_local! {
    static ACTIVE_CALL: Cell<Option<ActiveCall>> = const { Cell::new(None) };
}

/// Publishes the host for the callbacks of one `execute` call.
struct ActiveCallGuard {
    previous: Option<ActiveCall>,
}

impl ActiveCallGuard {
    fn enter(host: &mut dyn EngineHost, link: &EngineLink) -> Self {
        let host: *mut (dyn EngineHost + '_) = host;
        // SAFETY: only the lifetime is erased. The pointer is removed from the
        // thread-local when the guard drops, which happens before `host` and
        // `link` go out of scope in `NativeEngine::execute`.
        let host: *mut (dyn EngineHost + 'static) = unsafe { std::mem::transmute(host) };
        let call = ActiveCall {
            host,
            link: std::ptr::from_ref(link),
        };
        let previous = ACTIVE_CALL.with(|active| active.replace(Some(call)));
        Self { previous }
    }
}

impl Drop for ActiveCallGuard {
    fn drop(&mut self) {
        ACTIVE_CALL.with(|active| active.set(self.previous));
    }
}

fn with_active<R>(neutral: R, f: impl FnOnce(&mut dyn EngineHost, &EngineLink) -> R) -> R {
    let Some(call) = ACTIVE_CALL.with(Cell::get) else {
        return neutral;
    };
    // SAFETY: the pointers were published by `ActiveCallGuard` on this thread and
    // stay valid until it drops; callbacks run synchronously inside `execute`.
    let (host, link) = unsafe { (&mut *call.host, &*call.link) };
    match catch_unwind(AssertUnwindSafe(|| f(host, link))) {
        Ok(result) => result,
        Err(_) => {
            error!("host callback panicked inside the native engine");
            neutral
        }
    }
}

const fn width_from_bytes(bytes: u32) -> Option<AccessWidth> {
    match bytes {
        1 => Some(AccessWidth::Byte),
        2 => Some(AccessWidth::Word),
        4 => Some(AccessWidth::DoubleWord),
        8 => Some(AccessWidth::QuadWord),
        _ => None,
    }
}

unsafe extern "C" fn host_block_begin(pc: u64, size: u32) -> u32 {
    with_active(0, |host, _| u32::from(host.block_begin(pc, size)))
}

unsafe extern "C" fn host_block_finished(pc: u64, executed: u32) {
    with_active((), |host, _| host.block_finished(pc, executed));
}

unsafe extern "C" fn host_read(address: u64, width: u32, value: *mut u64) -> u32 {
    let Some(width) = width_from_bytes(width) else {
        return 0;
    };
    with_active(0, |host, _| match host.read(address, width) {
        Some(read) if !value.is_null() => {
            // SAFETY: the engine passes a valid, writable pointer.
            unsafe { value.write(read) };
            1
        }
        _ => 0,
    })
}

unsafe extern "C" fn host_write(address: u64, width: u32, value: u64) -> u32 {
    let Some(width) = width_from_bytes(width) else {
        return 0;
    };
    with_active(0, |host, _| u32::from(host.write(address, width, value)))
}

unsafe extern "C" fn host_should_return() -> u32 {
    with_active(1, |_, link| u32::from(link.take_return_request()))
}

static HOST_CALLBACKS: HostCallbacks = HostCallbacks {
    block_begin: host_block_begin,
    block_finished: host_block_finished,
    read: host_read,
    write: host_write,
    should_return: host_should_return,
};

/// An engine instance living in a native library.
pub struct NativeEngine {
    bindings: EngineBindings,
    context: NonNull<c_void>,
    name: String,
    architecture: String,
    link: Arc<EngineLink>,
    synced_generation: Option<u64>,
    installed: BTreeSet<u64>,
    synced_irq: u32,
}

// SAFETY: the native context is only touched by the thread holding the engine,
// which the CPU guards with a mutex.
unsafe impl Send for NativeEngine {}

impl NativeEngine {
    /// Instantiates the library, naming the instance `"{architecture}-engine-{n}"`.
    ///
    /// # Safety
    ///
    /// Every function pointer in `bindings` must be valid for the lifetime of the
    /// returned engine and follow the documented contract.
    ///
    /// # Arguments
    ///
    /// * `bindings` - The library's function table.
    /// * `architecture` - Instruction set name.
    /// * `counter` - Orchestrator-owned counter providing the instance number.
    pub unsafe fn new(
        bindings: EngineBindings,
        architecture: &str,
        counter: &InstanceCounter,
    ) -> Result<Self, CpuError> {
        let name = format!("{architecture}-engine-{}", counter.allocate());
        let c_name = CString::new(name.clone())
            .map_err(|_| CpuError::Construction(format!("invalid engine name `{name}`")))?;
        // SAFETY: guaranteed by the caller; the callback table is a static.
        let raw = unsafe { (bindings.init)(c_name.as_ptr(), &raw const HOST_CALLBACKS) };
        let context = NonNull::new(raw)
            .ok_or_else(|| CpuError::Construction(format!("engine `{name}` failed to initialise")))?;
        debug!(engine = %name, "native engine loaded");
        Ok(Self {
            bindings,
            context,
            name,
            architecture: architecture.to_string(),
            link: Arc::new(EngineLink::new()),
            synced_generation: None,
            installed: BTreeSet::new(),
            synced_irq: 0,
        })
    }

    /// Instance name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn ctx(&self) -> *mut c_void {
        self.context.as_ptr()
    }

    /// Pushes requests recorded in the link into the library.
    fn sync_link(&mut self) {
        let ctx = self.ctx();
        let b = self.bindings;
        // SAFETY: `ctx` is a live instance created by `init`; see `new`.
        unsafe {
            if self.link.take_cache_flush() {
                (b.flush_translation_cache)(ctx);
            }
            if self.link.take_return_request() {
                (b.set_return_request)(ctx);
            }
            let generation = self.link.breakpoint_generation();
            if self.synced_generation != Some(generation) {
                let wanted: BTreeSet<u64> = self.link.breakpoints().into_iter().collect();
                for address in self.installed.difference(&wanted) {
                    (b.remove_breakpoint)(ctx, *address);
                }
                for address in wanted.difference(&self.installed) {
                    (b.add_breakpoint)(ctx, *address);
                }
                self.installed = wanted;
                self.synced_generation = Some(generation);
            }
            let irq = self.link.irq_mask();
            let changed = irq ^ self.synced_irq;
            for bit in (0..u32::BITS).map(|b| 1u32 << b).filter(|bit| changed & bit != 0) {
                (b.set_irq)(ctx, bit, u32::from(irq & bit != 0));
            }
            self.synced_irq = irq;
            (b.set_block_begin_hook_present)(ctx, u32::from(self.link.block_begin_hook_present()));
            (b.set_wfi_as_nop)(ctx, u32::from(self.link.wfi_as_nop()));
        }
    }
}

impl ExecutionEngine for NativeEngine {
    fn attach(&mut self, link: Arc<EngineLink>) {
        self.link = link;
        self.synced_generation = None;
    }

    fn execute(
        &mut self,
        budget: u32,
        host: &mut dyn EngineHost,
    ) -> Result<EngineResult, EngineAbort> {
        self.sync_link();
        let budget = i32::try_from(budget).unwrap_or(i32::MAX);
        let link = Arc::clone(&self.link);
        let code = {
            let _call = ActiveCallGuard::enter(host, &link);
            // SAFETY: live instance; callbacks are published for this call only.
            unsafe { (self.bindings.execute)(self.ctx(), budget) }
        };
        if code < 0 {
            return Err(EngineAbort::new(format!(
                "{} aborted with code {code}",
                self.name
            )));
        }
        EngineResult::from_code(code.unsigned_abs())
            .ok_or_else(|| EngineAbort::new(format!("{} returned unknown code {code:#x}", self.name)))
    }

    fn executed_instructions(&self) -> u64 {
        // SAFETY: live instance.
        unsafe { (self.bindings.get_executed_instructions)(self.ctx()) }
    }

    fn pc(&self) -> u64 {
        // SAFETY: live instance.
        unsafe { (self.bindings.get_pc)(self.ctx()) }
    }

    fn set_pc(&mut self, pc: u64) {
        // SAFETY: live instance.
        unsafe { (self.bindings.set_pc)(self.ctx(), pc) }
    }

    fn reset(&mut self) {
        // SAFETY: live instance.
        unsafe { (self.bindings.reset)(self.ctx()) }
        self.installed.clear();
        self.synced_generation = None;
        self.synced_irq = 0;
    }

    fn export_state(&self) -> Vec<u8> {
        // SAFETY: live instance; the buffer is exactly `get_state_size` bytes.
        unsafe {
            let size = (self.bindings.get_state_size)(self.ctx());
            let mut buffer = vec![0u8; usize::try_from(size).unwrap_or(0)];
            (self.bindings.export_state)(self.ctx(), buffer.as_mut_ptr(), buffer.len() as u64);
            buffer
        }
    }

    fn import_state(&mut self, state: &[u8]) -> Result<(), EngineAbort> {
        // SAFETY: live instance; the buffer outlives the call.
        let ok = unsafe { (self.bindings.import_state)(self.ctx(), state.as_ptr(), state.len() as u64) };
        if ok == 0 {
            return Err(EngineAbort::new(format!("{} rejected the state blob", self.name)));
        }
        self.synced_generation = None;
        Ok(())
    }

    fn page_size(&self) -> u64 {
        // SAFETY: live instance.
        unsafe { (self.bindings.get_page_size)(self.ctx()) }
    }

    fn architecture(&self) -> &str {
        &self.architecture
    }
}

impl Drop for NativeEngine {
    fn drop(&mut self) {
        debug!(engine = %self.name, "disposing native engine");
        // SAFETY: the instance is live and never used after this point.
        unsafe { (self.bindings.dispose)(self.ctx()) }
    }
}

impl std::fmt::Debug for NativeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeEngine")
            .field("name", &self.name)
            .field("installed_breakpoints", &self.installed)
            .finish_non_exhaustive()
    }
}
