//! Process management.
//!
//! Flat ring-0 kernel threads over one shared address space. PCBs live in a
//! fixed arena ([`table`]); the scheduler in [`crate::sched`] drives state
//! transitions. This module owns creation, teardown and the resource
//! accounting (stacks from the heap, one program image window).

pub mod loader;
pub mod pcb;
pub mod table;

pub use pcb::{Pcb, Pid, ProcessState, IDLE_PID, STACK_CANARY};
pub use table::{ProcessTable, MAX_PROCESSES};

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch::x86::context::Context;
use crate::error::{KernelError, KernelResult, SchedError};
use crate::sync::IrqMutex;

/// Default stack for kernel threads.
pub const DEFAULT_STACK_SIZE: usize = 16 * 1024;

/// The process arena; shared with the scheduler.
pub(crate) static TABLE: IrqMutex<ProcessTable> = IrqMutex::new(ProcessTable::new());

/// PID of the thread currently executing.
pub(crate) static CURRENT: AtomicU32 = AtomicU32::new(0);

/// Exit codes of reaped processes, polled by the shell's job table.
static EXIT_CODES: IrqMutex<BTreeMap<Pid, i32>> = IrqMutex::new(BTreeMap::new());

/// Entry signature for argument-less kernel threads.
pub type EntryFn = extern "C" fn() -> i32;
/// Entry signature for threads that take one 32-bit argument.
pub type EntryArgFn = extern "C" fn(u32) -> i32;

fn alloc_stack(size: usize) -> *mut u8 {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    {
        crate::mm::heap::KERNEL_HEAP.alloc(size)
    }
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    {
        Vec::leak(alloc::vec![0u8; size]).as_mut_ptr()
    }
}

fn release_stack(base: usize) {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    // SAFETY: `base` came from KERNEL_HEAP.alloc in alloc_stack and is
    // released exactly once, at reap time.
    unsafe {
        crate::mm::heap::KERNEL_HEAP.free(base as *mut u8)
    };
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    let _ = base; // hosted stacks are leaked test fixtures
}

fn build_context(stack_ptr: *mut u8, stack_size: usize, entry_addr: usize, arg: u32) -> Context {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    {
        use crate::arch::x86::context;
        // SAFETY: the stack region was just allocated and is exclusively
        // ours until the PCB is inserted.
        let stack = unsafe { core::slice::from_raw_parts_mut(stack_ptr, stack_size) };
        let esp = context::prime_stack(
            stack,
            stack_ptr as usize as u32,
            entry_addr as u32,
            arg,
            context::trampoline_eip(),
        );
        Context {
            esp,
            eip: context::resume_eip(),
        }
    }
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    {
        // Hosted builds never dispatch; the context is bookkeeping only.
        let _ = (stack_ptr, stack_size, entry_addr, arg);
        Context { esp: 0, eip: 0 }
    }
}

fn create_raw(entry_addr: usize, arg: u32, name: &str, stack_size: usize) -> KernelResult<Pid> {
    let stack_size = stack_size.max(4096);
    let stack_ptr = alloc_stack(stack_size);
    if stack_ptr.is_null() {
        return Err(KernelError::OutOfMemory {
            requested: stack_size,
        });
    }
    // SAFETY: fresh allocation, large enough for one canary word.
    unsafe { (stack_ptr as *mut u32).write(STACK_CANARY) };

    let context = build_context(stack_ptr, stack_size, entry_addr, arg);
    let pid = TABLE.lock().insert(Pcb {
        pid: 0,
        name: String::from(name),
        state: ProcessState::Ready,
        context,
        stack_base: stack_ptr as usize,
        stack_size,
        image_base: 0,
        image_size: 0,
        exit_code: 0,
    })?;
    log::info!("process: created pid {} ({})", pid, name);
    Ok(pid)
}

/// Spawn a kernel thread.
pub fn create(entry: EntryFn, name: &str, stack_size: usize) -> KernelResult<Pid> {
    create_raw(entry as usize, 0, name, stack_size)
}

/// Spawn a kernel thread whose entry receives `arg` (the ELF loader passes
/// the syscall table pointer this way).
pub fn create_with_arg(entry: EntryArgFn, name: &str, stack_size: usize, arg: u32) -> KernelResult<Pid> {
    create_raw(entry as usize, arg, name, stack_size)
}

/// Adopt the already-running boot thread into the table (no stack
/// allocation; it runs on the boot stack).
pub fn register_current(name: &str) -> KernelResult<Pid> {
    let pid = TABLE.lock().insert(Pcb {
        pid: 0,
        name: String::from(name),
        state: ProcessState::Running,
        context: Context { esp: 0, eip: 0 },
        stack_base: 0,
        stack_size: 0,
        image_base: 0,
        image_size: 0,
        exit_code: 0,
    })?;
    CURRENT.store(pid, Ordering::SeqCst);
    Ok(pid)
}

/// PID of the caller.
pub fn current_pid() -> Pid {
    CURRENT.load(Ordering::SeqCst)
}

/// Attach a loaded image range to a PCB (freed once, at reap).
pub fn set_image(pid: Pid, base: usize, size: usize) -> KernelResult<()> {
    let mut table = TABLE.lock();
    let pcb = table.get_mut(pid).ok_or(KernelError::ProcessNotFound { pid })?;
    pcb.image_base = base;
    pcb.image_size = size;
    Ok(())
}

/// Mark a process terminated. Killing the idle process is a refused no-op;
/// killing the caller does not return (on hardware).
pub fn kill(pid: Pid) -> KernelResult<()> {
    if pid == IDLE_PID {
        return Err(SchedError::IdleIsImmortal.into());
    }
    {
        let mut table = TABLE.lock();
        let pcb = table.get_mut(pid).ok_or(KernelError::ProcessNotFound { pid })?;
        pcb.state = ProcessState::Terminated;
        EXIT_CODES.lock().insert(pid, pcb.exit_code);
    }
    if pid == current_pid() {
        crate::sched::schedule();
    }
    Ok(())
}

/// Terminate the calling process with `code`. Never returns on hardware;
/// hosted builds fall through for tests.
pub fn exit_current(code: i32) {
    let pid = current_pid();
    {
        let mut table = TABLE.lock();
        if let Some(pcb) = table.get_mut(pid) {
            pcb.state = ProcessState::Terminated;
            pcb.exit_code = code;
            EXIT_CODES.lock().insert(pid, code);
        }
    }
    crate::sched::schedule();
}

/// Trampoline landing point: the entry function returned with `code` in
/// eax.
#[cfg(all(target_arch = "x86", target_os = "none"))]
#[no_mangle]
pub extern "C" fn task_exit(code: i32) -> ! {
    exit_current(code);
    unreachable!("terminated process was rescheduled");
}

/// Kill the process owning a faulting instruction (fault isolation path).
/// Called from exception context.
pub fn exit_from_fault(pid: Pid) {
    {
        let mut table = TABLE.lock();
        if let Some(pcb) = table.get_mut(pid) {
            pcb.state = ProcessState::Terminated;
            pcb.exit_code = -1;
            EXIT_CODES.lock().insert(pid, -1);
        }
    }
    if pid == current_pid() {
        crate::sched::schedule();
    }
}

/// PID whose loaded image covers `addr`, for page-fault attribution.
pub fn image_containing(addr: u32) -> Option<Pid> {
    TABLE
        .lock()
        .iter()
        .find(|p| p.state != ProcessState::Terminated && p.image_contains(addr as usize))
        .map(|p| p.pid)
}

/// Take the recorded exit code of a finished process, if any.
pub fn take_exit_code(pid: Pid) -> Option<i32> {
    EXIT_CODES.lock().remove(&pid)
}

/// True while the PID refers to a live (non-reaped) process.
pub fn is_alive(pid: Pid) -> bool {
    TABLE
        .lock()
        .get(pid)
        .is_some_and(|p| p.state != ProcessState::Terminated)
}

/// Snapshot for the shell's `ps`.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub name: String,
    pub state: ProcessState,
    pub stack_size: usize,
}

pub fn processes() -> Vec<ProcessInfo> {
    TABLE
        .lock()
        .iter()
        .map(|p| ProcessInfo {
            pid: p.pid,
            name: p.name.clone(),
            state: p.state,
            stack_size: p.stack_size,
        })
        .collect()
}

/// Free a reaped PCB's stack and image window. Called by the scheduler
/// with the table lock held.
pub(crate) fn release_resources(pcb: &Pcb) {
    if pcb.stack_base != 0 {
        release_stack(pcb.stack_base);
    }
    if pcb.image_size != 0 {
        loader::release_image(pcb.image_base);
    }
}
