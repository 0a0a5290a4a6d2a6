//! CupidOS kernel library.
//!
//! A small 32-bit x86 kernel: one flat ring-0 address space, preemptive
//! round-robin kernel threads, a VFS with RAM/dev/FAT16 backends, a
//! compositing desktop, and the Cupid toolchain (CupidC + CupidASM) that
//! lowers source straight to i386 machine code.
//!
//! The library builds for two targets: the bare-metal i386 kernel, and the
//! development host, where the hardware-free logic layer (allocators,
//! filesystems, compositor, toolchain, scheduler bookkeeping) runs under
//! the standard test harness.

#![no_std]
#![cfg_attr(all(target_arch = "x86", target_os = "none"), feature(alloc_error_handler))]

extern crate alloc;

// Host target: link std and use the system allocator so unit tests can
// allocate normally. On bare metal the canary heap in `mm::heap` is the
// global allocator.
#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
pub mod bootinfo;
pub mod cupid;
pub mod desktop;
pub mod drivers;
pub mod elf;
pub mod error;
pub mod fs;
pub mod graphics;
pub mod irq;
pub mod logger;
pub mod mm;
pub mod process;
pub mod sched;
pub mod serial;
pub mod services;
pub mod sync;
pub mod syscall;
pub mod timer;

/// Heap allocation failure in a no_std kernel is unrecoverable.
#[cfg(all(target_arch = "x86", target_os = "none"))]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("kernel allocation failed: {:?}", layout);
}
