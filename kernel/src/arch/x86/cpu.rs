//! CPU-level primitives: interrupt flag control, halting, timestamps.
//!
//! Hosted builds (unit tests) get inert stand-ins so the locking layer above
//! compiles unchanged.

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod imp {
    use core::arch::asm;

    /// True if IF is set in EFLAGS.
    #[inline]
    pub fn interrupts_enabled() -> bool {
        let eflags: u32;
        // SAFETY: pushfd/pop only touches the stack slot it creates.
        unsafe {
            asm!("pushfd", "pop {}", out(reg) eflags, options(preserves_flags));
        }
        eflags & (1 << 9) != 0
    }

    /// Clear IF.
    #[inline]
    pub fn disable_interrupts() {
        // SAFETY: cli is always safe in ring 0.
        unsafe { asm!("cli", options(nomem, nostack)) };
    }

    /// Set IF.
    #[inline]
    pub fn enable_interrupts() {
        // SAFETY: sti is always safe in ring 0.
        unsafe { asm!("sti", options(nomem, nostack)) };
    }

    /// Halt until the next interrupt.
    #[inline]
    pub fn halt() {
        // SAFETY: hlt resumes on the next unmasked interrupt.
        unsafe { asm!("hlt", options(nomem, nostack)) };
    }

    /// Spin-loop hint.
    #[inline]
    pub fn pause() {
        core::hint::spin_loop();
    }

    /// Read the timestamp counter.
    #[inline]
    pub fn rdtsc() -> u64 {
        let lo: u32;
        let hi: u32;
        // SAFETY: rdtsc only writes edx:eax.
        unsafe {
            asm!("rdtsc", out("eax") lo, out("edx") hi, options(nomem, nostack, preserves_flags));
        }
        ((hi as u64) << 32) | lo as u64
    }

    /// Read CR2 (page-fault linear address).
    #[inline]
    pub fn read_cr2() -> u32 {
        let value: u32;
        // SAFETY: CR2 reads have no side effects in ring 0.
        unsafe {
            asm!("mov {}, cr2", out(reg) value, options(nomem, nostack, preserves_flags));
        }
        value
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
mod imp {
    //! Hosted stand-ins. Interrupts report as disabled so `IrqMutex` never
    //! tries to "re-enable" them.

    #[inline]
    pub fn interrupts_enabled() -> bool {
        false
    }

    #[inline]
    pub fn disable_interrupts() {}

    #[inline]
    pub fn enable_interrupts() {}

    #[inline]
    pub fn halt() {
        core::hint::spin_loop();
    }

    #[inline]
    pub fn pause() {
        core::hint::spin_loop();
    }

    #[inline]
    pub fn rdtsc() -> u64 {
        0
    }

    #[inline]
    pub fn read_cr2() -> u32 {
        0
    }
}

pub use imp::*;

/// Halt forever. Used by the panic path after state has been dumped.
pub fn halt_loop() -> ! {
    loop {
        disable_interrupts();
        halt();
    }
}
