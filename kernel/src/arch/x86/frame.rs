//! Saved register frame.
//!
//! Built by the ISR entry stubs with `pusha`; the field order below must
//! match the push sequence exactly, because panic and fault-isolation code
//! reads registers out of it positionally.

/// Registers as they sit on the stack when the common ISR stub hands control
/// to Rust. Ascending field order equals ascending stack addresses.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct RegisterFrame {
    // pusha, pushed last -> lowest addresses
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    /// ESP value pusha captured (before the pusha itself); informational.
    pub esp_at_pusha: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    // pushed by the per-vector stub
    pub vector: u32,
    pub error_code: u32,
    // pushed by the CPU on interrupt entry
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
}

impl RegisterFrame {
    /// A zeroed frame, for tests and synthetic dispatch.
    pub const fn zeroed() -> Self {
        Self {
            edi: 0,
            esi: 0,
            ebp: 0,
            esp_at_pusha: 0,
            ebx: 0,
            edx: 0,
            ecx: 0,
            eax: 0,
            vector: 0,
            error_code: 0,
            eip: 0,
            cs: 0,
            eflags: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn frame_layout_matches_stub_pushes() {
        // 8 GP registers + vector + error code + 3-word iret frame.
        assert_eq!(size_of::<RegisterFrame>(), 13 * 4);
        assert_eq!(offset_of!(RegisterFrame, edi), 0);
        assert_eq!(offset_of!(RegisterFrame, eax), 28);
        assert_eq!(offset_of!(RegisterFrame, vector), 32);
        assert_eq!(offset_of!(RegisterFrame, error_code), 36);
        assert_eq!(offset_of!(RegisterFrame, eip), 40);
        assert_eq!(offset_of!(RegisterFrame, eflags), 48);
    }
}
