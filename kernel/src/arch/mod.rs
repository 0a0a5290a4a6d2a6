//! Architecture support.
//!
//! The kernel targets 32-bit x86 only. Structure definitions (register
//! frames, descriptor tables, priming layouts) compile on every target so the
//! logic layer can be unit-tested on the build host; the inline-assembly
//! surface is confined to bare-metal builds.

pub mod x86;

pub use x86::cpu::{disable_interrupts, enable_interrupts, halt, interrupts_enabled, pause};
pub use x86::frame::RegisterFrame;

/// Architecture init: descriptor tables, PIC remap, timer programming.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn init() {
    x86::idt::init();
    x86::pic::init();
    x86::pit::init();
    log::info!("arch: IDT loaded, PIC remapped to 0x20, PIT at {} Hz", crate::timer::TICK_HZ);
}
