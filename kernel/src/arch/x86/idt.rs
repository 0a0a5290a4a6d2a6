//! Interrupt Descriptor Table.
//!
//! The stage-2 loader leaves us in protected mode with a flat GDT (code
//! selector 0x08, data 0x10); the kernel owns the 256-entry IDT. Vectors
//! 0-31 are CPU exceptions, 32-47 are the remapped PIC lines. Each populated
//! vector points at a tiny assembly stub that normalizes the stack into a
//! [`RegisterFrame`](super::frame::RegisterFrame) and calls
//! `interrupt_dispatch`.

/// Flat-model kernel code selector installed by the stage-2 loader.
pub const KERNEL_CODE_SELECTOR: u16 = 0x08;

/// Number of vectors with entry stubs (32 exceptions + 16 IRQs).
pub const STUB_COUNT: usize = 48;

/// One 8-byte i386 gate descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct GateDescriptor {
    offset_low: u16,
    selector: u16,
    zero: u8,
    type_attr: u8,
    offset_high: u16,
}

impl GateDescriptor {
    /// Non-present gate; stray software interrupts through it fault cleanly.
    pub const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            zero: 0,
            type_attr: 0,
            offset_high: 0,
        }
    }

    /// Present ring-0 32-bit interrupt gate (type_attr 0x8E).
    pub fn interrupt_gate(handler: u32) -> Self {
        Self {
            offset_low: (handler & 0xFFFF) as u16,
            selector: KERNEL_CODE_SELECTOR,
            zero: 0,
            type_attr: 0x8E,
            offset_high: (handler >> 16) as u16,
        }
    }

    /// Reassemble the 32-bit handler address.
    pub fn handler(&self) -> u32 {
        (self.offset_high as u32) << 16 | self.offset_low as u32
    }

    /// Present bit.
    pub fn is_present(&self) -> bool {
        self.type_attr & 0x80 != 0
    }
}

/// The descriptor table plus the pseudo-descriptor `lidt` consumes.
#[repr(C)]
pub struct Idt {
    entries: [GateDescriptor; 256],
}

// Consumed by `lidt` on the bare-metal target only.
#[cfg_attr(
    not(all(target_arch = "x86", target_os = "none")),
    allow(dead_code)
)]
#[repr(C, packed)]
struct IdtPointer {
    limit: u16,
    base: u32,
}

impl Idt {
    pub fn new() -> Self {
        Self {
            entries: [GateDescriptor::missing(); 256],
        }
    }

    pub fn set_gate(&mut self, vector: usize, handler: u32) {
        self.entries[vector] = GateDescriptor::interrupt_gate(handler);
    }

    pub fn gate(&self, vector: usize) -> &GateDescriptor {
        &self.entries[vector]
    }

    /// Load this table into IDTR.
    ///
    /// # Safety
    /// `self` must live for the rest of the kernel's lifetime and every
    /// present gate must point at a valid entry stub.
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    pub unsafe fn load(&'static self) {
        let pointer = IdtPointer {
            limit: (core::mem::size_of::<Idt>() - 1) as u16,
            base: self as *const _ as u32,
        };
        // SAFETY: the pointer references a 'static table per the caller's
        // contract.
        unsafe {
            core::arch::asm!("lidt [{}]", in(reg) &pointer, options(nostack, preserves_flags));
        }
    }
}

impl Default for Idt {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Entry stubs (bare metal only)
// ---------------------------------------------------------------------------

// Exception vectors where the CPU pushes an error code itself; all other
// stubs push a dummy zero so the frame layout is uniform.
#[cfg(all(target_arch = "x86", target_os = "none"))]
core::arch::global_asm!(
    r#"
.intel_syntax noprefix
.section .text

.altmacro
.macro ISR_STUB n
isr_stub_\n:
    .if (\n == 8) || (\n == 10) || (\n == 11) || (\n == 12) || (\n == 13) || (\n == 14) || (\n == 17)
    .else
    push 0
    .endif
    push \n
    jmp isr_common
.endm

.set vec, 0
.rept 48
    ISR_STUB %vec
    .set vec, vec + 1
.endr

isr_common:
    pusha
    push esp
    call interrupt_dispatch
    add esp, 4
    popa
    add esp, 8
    iretd

.section .rodata
.macro STUB_ADDR n
    .long isr_stub_\n
.endm
.global ISR_STUB_TABLE
ISR_STUB_TABLE:
.set vec, 0
.rept 48
    STUB_ADDR %vec
    .set vec, vec + 1
.endr
"#
);

#[cfg(all(target_arch = "x86", target_os = "none"))]
extern "C" {
    /// Addresses of `isr_stub_0` .. `isr_stub_47`, emitted by the block above.
    static ISR_STUB_TABLE: [u32; STUB_COUNT];
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
lazy_static::lazy_static! {
    static ref IDT: Idt = {
        let mut idt = Idt::new();
        // SAFETY: ISR_STUB_TABLE is link-time constant data.
        let stubs = unsafe { &ISR_STUB_TABLE };
        for (vector, &stub) in stubs.iter().enumerate() {
            idt.set_gate(vector, stub);
        }
        idt
    };
}

/// Build and load the IDT.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn init() {
    // SAFETY: the lazy_static table is 'static and every gate points at a
    // stub from ISR_STUB_TABLE.
    unsafe { IDT.load() };
}
