//! Kernel tick source.
//!
//! IRQ0 fires at [`TICK_HZ`] and advances a monotonic 64-bit tick counter;
//! everything time-related in the kernel (uptime, sleeps, cache LRU stamps,
//! cursor blink, scheduler preemption) derives from it.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::RegisterFrame;

/// Tick frequency programmed into the PIT.
pub const TICK_HZ: u32 = 100;

/// Milliseconds represented by one tick.
pub const MS_PER_TICK: u64 = 1000 / TICK_HZ as u64;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Install the IRQ0 handler and start counting.
pub fn init() -> crate::error::KernelResult<()> {
    crate::irq::install(0, timer_irq)?;
    log::info!("timer: ticking at {} Hz", TICK_HZ);
    Ok(())
}

fn timer_irq(_frame: &mut RegisterFrame) {
    on_tick();
}

/// Advance the clock by one tick and give the scheduler its preemption
/// point. Called from the timer IRQ tail; tests drive it directly.
pub fn on_tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
    crate::sched::timer_preempt();
}

/// Ticks since boot.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Monotonic uptime in milliseconds.
pub fn uptime_ms() -> u64 {
    ticks() * MS_PER_TICK
}

/// Sleep for at least `ms` milliseconds, halting between ticks and letting
/// other processes run.
pub fn sleep_ms(ms: u64) {
    let target = ticks() + ms.div_ceil(MS_PER_TICK).max(1);
    while ticks() < target {
        crate::sched::check_reschedule();
        crate::arch::halt();
    }
}

/// Busy-delay of at least one tick; for microsecond-scale device settling.
pub fn delay_us(us: u64) {
    let wait_ticks = (us / (MS_PER_TICK * 1000)).max(1);
    let target = ticks() + wait_ticks;
    while ticks() < target {
        crate::arch::pause();
    }
}

/// Two-phase square wave used for the terminal cursor blink.
pub fn blink_phase() -> bool {
    const BLINK_TICKS: u64 = 50; // half a second per phase
    (ticks() / BLINK_TICKS) % 2 == 0
}
