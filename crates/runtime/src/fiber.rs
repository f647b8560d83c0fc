//! Stackful fibers: hand-written context switches over raw native stacks.
//!
//! A fiber owns an `mmap`-backed stack with a guard page, a saved stack
//! pointer, and a side channel for the arguments/return values that cross
//! `resume`/`yield` (the switch itself passes nothing in registers other
//! than the two stack pointers). Only one fiber runs at a time; the
//! scheduler here is a thread-local table indexed by `FiberId`, not a
//! general-purpose work-stealing scheduler.
//!
//! The assembly is adapted from the register-window save/restore used by
//! a production Ruby implementation's fiber switch: x86_64 saves
//! rbx/rbp/r12-r15, aarch64 saves the callee-saved x19-x28 pair plus the
//! frame pointer/link register pair. Argument transport does not ride in
//! registers across the switch; it goes through `FiberInner::transfer`.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use bumpalo::Bump;
use thiserror::Error;

use rbcore::heap::RootSource;
use rbcore::{Symbol, Value};

use crate::block::Block;
use crate::error::{RResult, RaisedException, RubyError};

const DEFAULT_STACK_SIZE: usize = 256 * 1024;
const PAGE_SIZE: usize = 4096;

fn configured_stack_size() -> usize {
    std::env::var("RUBYRT_FIBER_STACK_SIZE")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|&n| n > 0)
        .map(|n| n.div_ceil(PAGE_SIZE) * PAGE_SIZE)
        .unwrap_or(DEFAULT_STACK_SIZE)
}

fn configured_registry_size() -> usize {
    std::env::var("RUBYRT_FIBER_REGISTRY_SIZE")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|&n| n > 0)
        .unwrap_or(1024)
}

#[derive(Debug, Error)]
pub enum FiberError {
    #[error("dead fiber called")]
    DeadFiberCalled,
    #[error("attempt to resume the current fiber")]
    DoubleResume,
    #[error("can't yield from root fiber")]
    YieldFromRoot,
    #[error("Fiber storage can only be accessed from the Fiber it belongs to")]
    StorageWrongFiber,
    #[error("storage must be a hash")]
    StorageNotHash,
    #[error("storage must not be frozen")]
    StorageFrozen,
    #[error("mmap failed for fiber stack")]
    StackAllocationFailed,
    #[error("fiber registry is full")]
    RegistryFull,
}

impl From<FiberError> for RubyError {
    fn from(e: FiberError) -> RubyError {
        match e {
            FiberError::StorageWrongFiber => RubyError::ArgumentError(e.to_string()),
            FiberError::StorageNotHash => RubyError::TypeError(e.to_string()),
            FiberError::StorageFrozen => RubyError::FrozenError(e.to_string()),
            _ => RubyError::FiberError(e.to_string()),
        }
    }
}

fn raise_fiber_error(e: FiberError) -> RaisedException {
    RaisedException {
        error: e.into(),
        exception: None,
        backtrace: Vec::new(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

impl FiberId {
    fn next() -> FiberId {
        FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn root() -> FiberId {
        FiberId(0)
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Created,
    Resumed,
    Suspended,
    Terminated,
}

/// A raw `mmap`-backed native stack with a `PROT_NONE` guard page at the
/// low address: a runaway fiber faults instead of corrupting whatever
/// mapping happens to sit below it.
struct FiberStack {
    base: *mut libc::c_void,
    len: usize,
}

impl FiberStack {
    fn new(size: usize) -> Result<FiberStack, FiberError> {
        let len = size + PAGE_SIZE;
        unsafe {
            let base = libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if base == libc::MAP_FAILED {
                return Err(FiberError::StackAllocationFailed);
            }
            if libc::mprotect(base, PAGE_SIZE, libc::PROT_NONE) != 0 {
                libc::munmap(base, len);
                return Err(FiberError::StackAllocationFailed);
            }
            Ok(FiberStack { base, len })
        }
    }

    /// Highest usable address (stack grows down from here).
    fn top(&self) -> usize {
        (self.base as usize + self.len) & !0xf
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base, self.len);
        }
    }
}

unsafe extern "C" {
    fn rb_fiber_switch(save_sp_slot: *mut usize, load_sp: usize);
}

#[cfg(target_arch = "x86_64")]
std::arch::global_asm!(
    ".globl rb_fiber_switch",
    "rb_fiber_switch:",
    "push rbx",
    "push rbp",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, rsi",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbp",
    "pop rbx",
    "ret",
);

#[cfg(target_arch = "aarch64")]
std::arch::global_asm!(
    ".globl rb_fiber_switch",
    "rb_fiber_switch:",
    "stp x29, x30, [sp, #-16]!",
    "stp x19, x20, [sp, #-16]!",
    "stp x21, x22, [sp, #-16]!",
    "stp x23, x24, [sp, #-16]!",
    "stp x25, x26, [sp, #-16]!",
    "stp x27, x28, [sp, #-16]!",
    "mov x2, sp",
    "str x2, [x0]",
    "mov sp, x1",
    "ldp x27, x28, [sp], #16",
    "ldp x25, x26, [sp], #16",
    "ldp x23, x24, [sp], #16",
    "ldp x21, x22, [sp], #16",
    "ldp x19, x20, [sp], #16",
    "ldp x29, x30, [sp], #16",
    "ret",
);

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("fiber context switch is only implemented for x86_64 and aarch64");

/// Lay down a fake register-save frame at the top of a fresh stack so
/// that the very first switch into it behaves like any other: the
/// epilogue's `ret` lands on `entry` with zeroed callee-saved registers.
fn prepare_stack(stack: &FiberStack, entry: extern "C" fn() -> !) -> usize {
    unsafe {
        let mut sp = stack.top();

        #[cfg(target_arch = "x86_64")]
        {
            sp -= 8;
            *(sp as *mut u64) = entry as usize as u64;
            for _ in 0..6 {
                sp -= 8;
                *(sp as *mut u64) = 0;
            }
        }

        #[cfg(target_arch = "aarch64")]
        {
            // Mirrors the stp/ldp pairing order of rb_fiber_switch: the
            // pair pushed first (x29, x30) is popped last, so x30 lands
            // in the link register for the final `ret`.
            sp -= 16;
            *(sp as *mut u64) = 0; // x29
            *((sp + 8) as *mut u64) = entry as usize as u64; // x30 (lr)
            for _ in 0..5 {
                sp -= 16;
                *(sp as *mut u64) = 0;
                *((sp + 8) as *mut u64) = 0;
            }
        }

        sp
    }
}

struct FiberInner {
    id: FiberId,
    status: Cell<Status>,
    stack: Option<FiberStack>,
    sp: Cell<usize>,
    start_of_stack: usize,
    end_of_stack: Cell<usize>,
    /// The resumer currently waiting for this fiber; `None` once this
    /// fiber has yielded (or terminated) control back to it, which also
    /// doubles as the "already being resumed" guard in [`resume`].
    previous: Cell<Option<FiberId>>,
    block: RefCell<Option<Block>>,
    transfer: RefCell<Vec<Value>>,
    error: RefCell<Option<RaisedException>>,
    storage: RefCell<Option<HashMap<Symbol, Value>>>,
    arena: RefCell<Bump>,
}

struct Scheduler {
    fibers: RefCell<HashMap<FiberId, Box<FiberInner>>>,
    current: Cell<FiberId>,
}

impl Scheduler {
    fn new() -> Scheduler {
        let root = Box::new(FiberInner {
            id: FiberId::root(),
            status: Cell::new(Status::Resumed),
            stack: None,
            sp: Cell::new(0),
            start_of_stack: root_stack_approximation(),
            end_of_stack: Cell::new(0),
            previous: Cell::new(None),
            block: RefCell::new(None),
            transfer: RefCell::new(Vec::new()),
            error: RefCell::new(None),
            storage: RefCell::new(None),
            arena: RefCell::new(Bump::new()),
        });
        let mut fibers = HashMap::new();
        fibers.insert(FiberId::root(), root);
        Scheduler {
            fibers: RefCell::new(fibers),
            current: Cell::new(FiberId::root()),
        }
    }
}

/// Address of a stack local in whatever function called `Scheduler::new`,
/// used as the root fiber's `start_of_stack`: the real OS thread stack
/// has no separate owner to record it up front the way a `create`d
/// fiber's `mmap`ed stack does, so this stands in as a generous
/// high-address bound for [`FiberRootSource::scan_ranges`] to pair with
/// a near-top local address taken at collection time.
fn root_stack_approximation() -> usize {
    let marker: usize = 0;
    &marker as *const usize as usize
}

thread_local! {
    static SCHEDULER: Scheduler = Scheduler::new();
    static ROOT_SOURCE_INSTALLED: Cell<bool> = const { Cell::new(false) };
}

/// Registers this thread's fiber scheduler as a GC root source. `rbcore`
/// keeps one process-wide `ROOT_SOURCES` list rather than a per-thread
/// one, so every registered `FiberRootSource` (stateless; it always
/// reads whichever thread is currently scanning) would otherwise be
/// invoked redundantly on every thread's collection once two or more
/// threads had installed one. The thread-local flag here keeps this
/// thread's registration to exactly one entry.
pub fn install_root_source() {
    ROOT_SOURCE_INSTALLED.with(|installed| {
        if !installed.get() {
            rbcore::heap::register_root_source(Box::new(FiberRootSource));
            installed.set(true);
        }
    });
}

struct FiberRootSource;

impl RootSource for FiberRootSource {
    fn scan_ranges(&self, visit: &mut dyn FnMut(usize, usize)) {
        SCHEDULER.with(|sched| {
            let map = sched.fibers.borrow();
            let active = sched.current.get();
            for fiber in map.values() {
                if fiber.id == active {
                    // This function runs synchronously inside `collect`,
                    // on whichever native stack is actually live right
                    // now (the root OS thread stack or a fiber's mmap'd
                    // one) — so a local taken here is exactly the "near
                    // top" bound the active fiber's own range needs.
                    let marker: usize = 0;
                    visit(&marker as *const usize as usize, fiber.start_of_stack);
                    continue;
                }
                if fiber.status.get() == Status::Created {
                    // Never started: nothing meaningful is on the stack yet.
                    continue;
                }
                let end = fiber.end_of_stack.get();
                if end == 0 {
                    continue;
                }
                visit(end, fiber.start_of_stack);
            }
        });
    }

    fn scan_values(&self, visit: &mut dyn FnMut(Value)) {
        SCHEDULER.with(|sched| {
            let map = sched.fibers.borrow();
            for fiber in map.values() {
                for &v in fiber.transfer.borrow().iter() {
                    visit(v);
                }
                if let Some(table) = fiber.storage.borrow().as_ref() {
                    for &v in table.values() {
                        visit(v);
                    }
                }
            }
        });
    }
}

pub fn current() -> FiberId {
    SCHEDULER.with(|s| s.current.get())
}

pub fn is_alive(id: FiberId) -> bool {
    SCHEDULER.with(|s| {
        s.fibers
            .borrow()
            .get(&id)
            .map(|f| f.status.get() != Status::Terminated)
            .unwrap_or(false)
    })
}

pub fn status(id: FiberId) -> Option<Status> {
    SCHEDULER.with(|s| s.fibers.borrow().get(&id).map(|f| f.status.get()))
}

/// Creates a new, not-yet-started fiber running `block`. `storage` seeds
/// the fiber-local storage table (validated by the caller: non-frozen
/// hash with symbol keys, per the storage contract).
pub fn create(block: Block, storage: Option<HashMap<Symbol, Value>>) -> Result<FiberId, FiberError> {
    let live = SCHEDULER.with(|s| {
        s.fibers
            .borrow()
            .values()
            .filter(|f| f.status.get() != Status::Terminated)
            .count()
    });
    if live >= configured_registry_size() {
        return Err(FiberError::RegistryFull);
    }
    let stack = FiberStack::new(configured_stack_size())?;
    let sp = prepare_stack(&stack, fiber_trampoline);
    let start_of_stack = stack.top();
    let id = FiberId::next();
    let inner = Box::new(FiberInner {
        id,
        status: Cell::new(Status::Created),
        stack: Some(stack),
        sp: Cell::new(sp),
        start_of_stack,
        end_of_stack: Cell::new(0),
        previous: Cell::new(None),
        block: RefCell::new(Some(block)),
        transfer: RefCell::new(Vec::new()),
        error: RefCell::new(None),
        storage: RefCell::new(storage),
        arena: RefCell::new(Bump::new()),
    });
    SCHEDULER.with(|s| s.fibers.borrow_mut().insert(id, inner));
    Ok(id)
}

/// Transfers control to `id`, delivering `args` either as the block's
/// entry arguments (first resume) or as the return value of the `yield`
/// call currently suspended inside it. Returns the values passed to the
/// next `yield` (or the block's final return value, on termination).
pub fn resume(id: FiberId, args: Vec<Value>) -> RResult<Vec<Value>> {
    let current_id = current();

    let (current_ptr, target_ptr) = SCHEDULER.with(|sched| {
        let map = sched.fibers.borrow();
        let target = map.get(&id).expect("unknown fiber id");
        if target.status.get() == Status::Terminated {
            return Err(raise_fiber_error(FiberError::DeadFiberCalled));
        }
        if target.previous.get().is_some() {
            return Err(raise_fiber_error(FiberError::DoubleResume));
        }
        let current = map.get(&current_id).expect("current fiber missing");
        let current_ptr = current.as_ref() as *const FiberInner as *mut FiberInner;
        let target_ptr = target.as_ref() as *const FiberInner as *mut FiberInner;
        Ok((current_ptr, target_ptr))
    })?;

    unsafe {
        *(*target_ptr).transfer.borrow_mut() = args;
        (*target_ptr).previous.set(Some(current_id));
        (*target_ptr).status.set(Status::Resumed);
        (*current_ptr).status.set(Status::Suspended);

        let marker: usize = 0;
        (*current_ptr)
            .end_of_stack
            .set(&marker as *const usize as usize);

        SCHEDULER.with(|s| s.current.set(id));

        rb_fiber_switch(
            (*current_ptr).sp.as_ptr(),
            (*target_ptr).sp.get(),
        );
    }

    // Control returns here once `current_id` is resumed again.
    let (error, values) = SCHEDULER.with(|s| {
        let map = s.fibers.borrow();
        let me = map.get(&current_id).unwrap();
        (me.error.borrow_mut().take(), me.transfer.borrow().clone())
    });
    if let Some(err) = error {
        return Err(err);
    }
    Ok(values)
}

/// Suspends the current fiber, handing `args` back to whoever resumed
/// it. Returns once this fiber is resumed again.
pub fn yield_now(args: Vec<Value>) -> RResult<Vec<Value>> {
    let current_id = current();
    let previous_id = SCHEDULER.with(|s| {
        let map = s.fibers.borrow();
        map.get(&current_id).unwrap().previous.get()
    });
    let previous_id = match previous_id {
        Some(p) => p,
        None => return Err(raise_fiber_error(FiberError::YieldFromRoot)),
    };
    switch_back(current_id, previous_id, Status::Suspended, args);

    let (error, values) = SCHEDULER.with(|s| {
        let map = s.fibers.borrow();
        let me = map.get(&current_id).unwrap();
        (me.error.borrow_mut().take(), me.transfer.borrow().clone())
    });
    if let Some(err) = error {
        return Err(err);
    }
    Ok(values)
}

fn switch_back(from_id: FiberId, to_id: FiberId, from_status: Status, args: Vec<Value>) {
    let (from_ptr, to_ptr) = SCHEDULER.with(|sched| {
        let map = sched.fibers.borrow();
        let from = map.get(&from_id).unwrap();
        let to = map.get(&to_id).unwrap();
        (
            from.as_ref() as *const FiberInner as *mut FiberInner,
            to.as_ref() as *const FiberInner as *mut FiberInner,
        )
    });
    unsafe {
        *(*to_ptr).transfer.borrow_mut() = args;
        (*from_ptr).status.set(from_status);
        (*from_ptr).previous.set(None);

        let marker: usize = 0;
        (*from_ptr)
            .end_of_stack
            .set(&marker as *const usize as usize);

        SCHEDULER.with(|s| s.current.set(to_id));

        rb_fiber_switch((*from_ptr).sp.as_ptr(), (*to_ptr).sp.get());
    }
}

extern "C" fn fiber_trampoline() -> ! {
    let id = current();
    let block = SCHEDULER.with(|s| {
        let map = s.fibers.borrow();
        let fiber = map.get(&id).unwrap();
        fiber.block.borrow_mut().take().expect("fiber started with no block")
    });
    let args = SCHEDULER.with(|s| {
        let map = s.fibers.borrow();
        map.get(&id).unwrap().transfer.borrow().clone()
    });

    let result = block.call(&args);

    let (return_args, error) = match result {
        Ok(v) => (vec![v], None),
        Err(e) => (Vec::new(), Some(e)),
    };

    let previous_id = SCHEDULER.with(|s| {
        let map = s.fibers.borrow();
        let fiber = map.get(&id).unwrap();
        fiber.status.set(Status::Terminated);
        *fiber.error.borrow_mut() = error;
        fiber.previous.get().expect("terminating fiber has no resumer")
    });

    switch_back(id, previous_id, Status::Terminated, return_args);
    unreachable!("a terminated fiber must never be resumed again")
}

/// Reads a fiber-local storage key, falling through the dynamic resumer
/// chain (the same chain `resume`/`yield` maintain) when the current
/// fiber has no storage table of its own. Only callable for the fiber
/// currently running.
pub fn storage_get(id: FiberId, name: Symbol) -> Result<Value, FiberError> {
    if id != current() {
        return Err(FiberError::StorageWrongFiber);
    }
    SCHEDULER.with(|s| {
        let map = s.fibers.borrow();
        let mut cursor = Some(id);
        while let Some(cur) = cursor {
            let fiber = map.get(&cur).unwrap();
            if let Some(table) = fiber.storage.borrow().as_ref() {
                return Ok(table.get(&name).copied().unwrap_or_else(Value::nil));
            }
            cursor = fiber.previous.get();
        }
        Ok(Value::nil())
    })
}

pub fn storage_set(id: FiberId, name: Symbol, value: Value) -> Result<(), FiberError> {
    if id != current() {
        return Err(FiberError::StorageWrongFiber);
    }
    SCHEDULER.with(|s| {
        let map = s.fibers.borrow();
        let fiber = map.get(&id).unwrap();
        fiber
            .storage
            .borrow_mut()
            .get_or_insert_with(HashMap::new)
            .insert(name, value);
    });
    Ok(())
}

/// Runs `f` with the currently-running fiber's bump arena, for
/// allocating `Env` locals (see `crate::env::Env`).
pub fn with_current_arena<R>(f: impl FnOnce(&Bump) -> R) -> R {
    SCHEDULER.with(|s| {
        let map = s.fibers.borrow();
        let fiber = map.get(&s.current.get()).unwrap();
        let arena = fiber.arena.borrow();
        f(&arena)
    })
}

/// A typed handle onto a scheduled fiber. The free functions above do
/// the actual work against a bare `FiberId`; `Fiber` exists so call
/// sites outside this module (dispatch, the `Fiber` native methods) read
/// as method calls on a value instead of free-function soup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fiber(FiberId);

impl Fiber {
    pub fn current() -> Fiber {
        Fiber(current())
    }

    pub fn create(block: Block, storage: Option<HashMap<Symbol, Value>>) -> Result<Fiber, FiberError> {
        create(block, storage).map(Fiber)
    }

    pub fn id(self) -> FiberId {
        self.0
    }

    pub fn is_alive(self) -> bool {
        is_alive(self.0)
    }

    pub fn status(self) -> Option<Status> {
        status(self.0)
    }

    pub fn resume(self, args: Vec<Value>) -> RResult<Vec<Value>> {
        resume(self.0, args)
    }

    /// Suspends whichever fiber is currently running. Associated rather
    /// than a method, since "the current fiber" is always implicit, not
    /// a `Fiber` value the caller necessarily has in hand.
    pub fn yield_now(args: Vec<Value>) -> RResult<Vec<Value>> {
        yield_now(args)
    }

    pub fn storage_get(self, name: Symbol) -> Result<Value, FiberError> {
        storage_get(self.0, name)
    }

    pub fn storage_set(self, name: Symbol, value: Value) -> Result<(), FiberError> {
        storage_set(self.0, name, value)
    }

    /// Runs `f` against the currently-running fiber's bump arena; see
    /// `crate::env::Env`'s doc comment for why call-frame locals are
    /// allocated here instead of on the global heap.
    pub fn arena<R>(f: impl FnOnce(&Bump) -> R) -> R {
        with_current_arena(f)
    }
}

#[cfg(feature = "diagnostics")]
pub fn dump_diagnostics() {
    use std::io::Write;
    SCHEDULER.with(|s| {
        let map = s.fibers.borrow();
        let mut out = std::io::stderr().lock();
        let _ = writeln!(out, "\n=== Fiber Diagnostics ===");
        let _ = writeln!(out, "Current: {:?}", s.current.get());
        for fiber in map.values() {
            let _ = writeln!(out, "  {:?}: {:?}", fiber.id, fiber.status.get());
        }
        let _ = writeln!(out, "=== End Fiber Diagnostics ===\n");
    });
}
