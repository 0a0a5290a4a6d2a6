//! Round-robin scheduler.
//!
//! Single core, preemptive at the timer tick, cooperative at explicit
//! yield points. The selection logic lives in
//! [`ProcessTable::select_next`](crate::process::table::ProcessTable); this
//! module owns the state transitions and the actual stack switch.
//!
//! Preemption discipline: the timer IRQ calls [`timer_preempt`]. While a
//! critical section holds the preemption gate, the request is parked in a
//! deferred flag that the next voluntary suspension point
//! ([`check_reschedule`]) honors.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::process::{self, ProcessState, STACK_CANARY};

static ACTIVE: AtomicBool = AtomicBool::new(false);
static NEED_RESCHED: AtomicBool = AtomicBool::new(false);
/// Nesting count of preemption-disabled sections.
static PREEMPT_GATE: AtomicU32 = AtomicU32::new(0);

/// Spawn the idle thread (PID 1) and arm the scheduler.
pub fn init() -> crate::error::KernelResult<()> {
    let pid = process::create(idle_main, "idle", 8 * 1024)?;
    debug_assert_eq!(pid, process::IDLE_PID);
    ACTIVE.store(true, Ordering::SeqCst);
    log::info!("sched: round-robin active, idle is pid {}", pid);
    Ok(())
}

/// True once `init` ran.
pub fn is_active() -> bool {
    ACTIVE.load(Ordering::SeqCst)
}

extern "C" fn idle_main() -> i32 {
    loop {
        crate::arch::halt();
    }
}

/// Enter a no-preemption region (compositor frame publish, etc.).
pub fn preempt_disable() {
    PREEMPT_GATE.fetch_add(1, Ordering::SeqCst);
}

/// Leave a no-preemption region; a parked reschedule fires at the next
/// voluntary check, not here.
pub fn preempt_enable() {
    PREEMPT_GATE.fetch_sub(1, Ordering::SeqCst);
}

/// Timer-IRQ tail hook: reschedule now, or park the request while the
/// gate is held.
pub fn timer_preempt() {
    if !is_active() {
        return;
    }
    if PREEMPT_GATE.load(Ordering::SeqCst) > 0 {
        NEED_RESCHED.store(true, Ordering::SeqCst);
        return;
    }
    schedule();
}

/// Voluntary suspension point: honor a parked reschedule.
pub fn check_reschedule() {
    if NEED_RESCHED.swap(false, Ordering::SeqCst) {
        schedule();
    }
}

/// True if a deferred reschedule is parked (diagnostics/tests).
pub fn resched_pending() -> bool {
    NEED_RESCHED.load(Ordering::SeqCst)
}

/// Give up the CPU voluntarily.
pub fn yield_now() {
    if !is_active() {
        return;
    }
    let pid = process::current_pid();
    {
        let mut table = process::TABLE.lock();
        if let Some(pcb) = table.get_mut(pid) {
            if pcb.state == ProcessState::Running {
                pcb.state = ProcessState::Ready;
            }
        }
    }
    schedule();
}

/// Validate every live stack's canary word. Corruption panics; a smashed
/// stack is not survivable.
fn check_stack_canaries(table: &crate::process::ProcessTable) {
    for pcb in table.iter() {
        if !pcb.has_canary() || pcb.state == ProcessState::Terminated {
            continue;
        }
        // SAFETY: stack_base points at a live stack allocation owned by
        // this PCB; the canary word was written at creation.
        let word = unsafe { (pcb.stack_base as *const u32).read() };
        if word != STACK_CANARY {
            panic!(
                "stack canary smashed: pid {} ({}) base {:#x}",
                pcb.pid, pcb.name, pcb.stack_base
            );
        }
    }
}

/// Where a dying process's final context store lands.
#[cfg(all(target_arch = "x86", target_os = "none"))]
static mut DISCARDED_ESP: u32 = 0;

/// Pick the next process and switch to it.
///
/// The pick and all state transitions happen with interrupts disabled.
/// The interrupt flag is captured before masking so the caller's state is
/// restored on the way out — including after this stack is resumed again
/// much later.
pub fn schedule() {
    if !is_active() {
        return;
    }
    let were_enabled = crate::arch::interrupts_enabled();
    crate::arch::disable_interrupts();

    let current = process::current_pid();
    let mut switch: Option<(*mut u32, u32, u32)> = None;
    {
        let mut table = process::TABLE.lock();
        check_stack_canaries(&table);
        table.reap(process::release_resources);

        let next = table.select_next(current);
        let current_running = table
            .get(current)
            .is_some_and(|p| p.state == ProcessState::Running);

        // Only the current process runnable: no switch.
        if !(next == current && current_running) {
            if let Some(pcb) = table.get_mut(current) {
                if pcb.state == ProcessState::Running {
                    pcb.state = ProcessState::Ready;
                }
            }
            let next_pcb = table.get_mut(next).expect("select_next returned live pid");
            next_pcb.state = ProcessState::Running;
            let new_context = next_pcb.context;
            process::CURRENT.store(next, Ordering::SeqCst);

            let old_slot: *mut u32 = match table.get_mut(current) {
                Some(pcb) => &mut pcb.context.esp as *mut u32,
                // Terminated and reaped: the final ESP is discarded.
                #[cfg(all(target_arch = "x86", target_os = "none"))]
                // SAFETY: only the address is taken; the cell exists for
                // exactly this purpose.
                None => unsafe { core::ptr::addr_of_mut!(DISCARDED_ESP) },
                #[cfg(not(all(target_arch = "x86", target_os = "none")))]
                None => core::ptr::null_mut(),
            };
            switch = Some((old_slot, new_context.esp, new_context.eip));
        }
    }

    if let Some((_old_slot, _esp, _eip)) = switch {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        // SAFETY: the slot points into the static process table (or the
        // discard cell), and the target context was primed by create or a
        // previous switch. Interrupts stay masked across the switch; the
        // target's saved EFLAGS take over on resume.
        unsafe {
            crate::arch::x86::context::context_switch(_old_slot, _esp, _eip);
        }
    }

    if were_enabled {
        crate::arch::enable_interrupts();
    }
}
