//! IRQ dispatch and exception handling.
//!
//! The assembly stubs normalize every interrupt into a [`RegisterFrame`] and
//! call [`interrupt_dispatch`]. Exceptions (vectors 0-31) are fatal to the
//! kernel — with one exception: a fault whose EIP lies inside a loaded
//! program image kills only that process. PIC lines route through a 16-slot
//! handler registry; unregistered lines hit a default handler that logs and
//! acknowledges.

use crate::arch::x86::pic;
use crate::arch::RegisterFrame;
use crate::sync::IrqMutex;
use crate::error::{KernelError, KernelResult};

/// Handler signature for a PIC line.
pub type IrqHandler = fn(&mut RegisterFrame);

/// Page size used for the null-dereference classification.
const NULL_ZONE: u32 = 4096;

struct Registry {
    handlers: [Option<IrqHandler>; pic::IRQ_LINES as usize],
    /// Dispatch counters, surfaced by the shell's `irqs` builtin.
    counts: [u64; pic::IRQ_LINES as usize],
    unhandled: u64,
}

static REGISTRY: IrqMutex<Registry> = IrqMutex::new(Registry {
    handlers: [None; pic::IRQ_LINES as usize],
    counts: [0; pic::IRQ_LINES as usize],
    unhandled: 0,
});

/// Register a handler for an IRQ line and unmask it.
pub fn install(line: u8, handler: IrqHandler) -> KernelResult<()> {
    if line >= pic::IRQ_LINES {
        return Err(KernelError::InvalidArgument {
            name: "line",
            value: "IRQ line out of range",
        });
    }
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    pic::set_mask(line);
    REGISTRY.lock().handlers[line as usize] = Some(handler);
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    pic::clear_mask(line);
    log::info!("irq: installed handler for line {}", line);
    Ok(())
}

/// Remove a handler and mask its line again.
pub fn uninstall(line: u8) {
    if line >= pic::IRQ_LINES {
        return;
    }
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    pic::set_mask(line);
    REGISTRY.lock().handlers[line as usize] = None;
}

/// Dispatch count for one line.
pub fn dispatch_count(line: u8) -> u64 {
    REGISTRY
        .lock()
        .counts
        .get(line as usize)
        .copied()
        .unwrap_or(0)
}

/// Count of IRQs that arrived with no registered handler.
pub fn unhandled_count() -> u64 {
    REGISTRY.lock().unhandled
}

/// Entry point called by the common assembly stub.
///
/// Runs with interrupts disabled (interrupt gate); must not allocate.
#[no_mangle]
pub extern "C" fn interrupt_dispatch(frame: &mut RegisterFrame) {
    let vector = frame.vector;
    if vector < 32 {
        handle_exception(frame);
        return;
    }

    if let Some(line) = pic::vector_to_irq(vector) {
        let handler = {
            let mut registry = REGISTRY.lock();
            registry.counts[line as usize] += 1;
            registry.handlers[line as usize]
        };
        match handler {
            Some(h) => h(frame),
            None => {
                REGISTRY.lock().unhandled += 1;
                log::warn!("irq: unhandled line {} (vector {:#04x})", line, vector);
            }
        }
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        pic::send_eoi(line);
    } else {
        log::warn!("irq: stray vector {:#04x}", vector);
    }
}

/// Human-readable mnemonic for the exception vectors we can name.
fn exception_name(vector: u32) -> &'static str {
    match vector {
        0 => "divide error",
        1 => "debug",
        3 => "breakpoint",
        4 => "overflow",
        5 => "bound range",
        6 => "invalid opcode",
        7 => "device not available",
        8 => "double fault",
        10 => "invalid TSS",
        11 => "segment not present",
        12 => "stack fault",
        13 => "general protection fault",
        14 => "page fault",
        16 => "x87 FP error",
        17 => "alignment check",
        18 => "machine check",
        19 => "SIMD FP error",
        _ => "exception",
    }
}

/// Decoded page-fault error bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFaultInfo {
    pub address: u32,
    pub present: bool,
    pub write: bool,
    pub user: bool,
}

impl PageFaultInfo {
    pub fn decode(error_code: u32, address: u32) -> Self {
        Self {
            address,
            present: error_code & 1 != 0,
            write: error_code & 2 != 0,
            user: error_code & 4 != 0,
        }
    }

    /// Faulting address within the first page -> almost certainly a null
    /// (or near-null field) dereference.
    pub fn is_null_deref(&self) -> bool {
        self.address < NULL_ZONE
    }
}

fn handle_exception(frame: &mut RegisterFrame) {
    let name = exception_name(frame.vector);

    if frame.vector == 14 {
        let info = PageFaultInfo::decode(frame.error_code, crate::arch::x86::cpu::read_cr2());
        log::error!(
            "page fault at {:#010x} (eip={:#010x}, {}, {}{})",
            info.address,
            frame.eip,
            if info.present {
                "protection"
            } else {
                "not present"
            },
            if info.write { "write" } else { "read" },
            if info.is_null_deref() {
                ", null dereference"
            } else {
                ""
            },
        );
    } else {
        log::error!(
            "{} (vector {}) at eip={:#010x}, error={:#x}",
            name,
            frame.vector,
            frame.eip,
            frame.error_code
        );
    }

    // A fault inside a loaded program image is fatal to that program only.
    if let Some(pid) = crate::process::image_containing(frame.eip) {
        log::error!("terminating process {} after {}", pid, name);
        crate::process::exit_from_fault(pid);
        return;
    }

    exception_panic(frame, name);
}

/// Dump the frame and halt. The kernel never recovers from its own faults.
fn exception_panic(frame: &RegisterFrame, name: &'static str) -> ! {
    serial_println!("\n*** KERNEL {} ***", name);
    serial_println!(
        "eip={:#010x} cs={:#06x} eflags={:#010x} err={:#x}",
        frame.eip,
        frame.cs,
        frame.eflags,
        frame.error_code
    );
    serial_println!(
        "eax={:#010x} ebx={:#010x} ecx={:#010x} edx={:#010x}",
        frame.eax,
        frame.ebx,
        frame.ecx,
        frame.edx
    );
    serial_println!(
        "esi={:#010x} edi={:#010x} ebp={:#010x} esp={:#010x}",
        frame.esi,
        frame.edi,
        frame.ebp,
        frame.esp_at_pusha
    );
    panic!("unrecoverable exception: {}", name);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_frame: &mut RegisterFrame) {}

    #[test]
    fn install_rejects_out_of_range_line() {
        assert!(install(16, noop).is_err());
        assert!(install(15, noop).is_ok());
        uninstall(15);
    }

    #[test]
    fn dispatch_routes_to_registered_handler() {
        use core::sync::atomic::{AtomicU32, Ordering};
        static HITS: AtomicU32 = AtomicU32::new(0);
        fn counting(_frame: &mut RegisterFrame) {
            HITS.fetch_add(1, Ordering::Relaxed);
        }

        install(5, counting).unwrap();
        let mut frame = RegisterFrame::zeroed();
        frame.vector = 0x25;
        interrupt_dispatch(&mut frame);
        assert_eq!(HITS.load(Ordering::Relaxed), 1);
        assert!(dispatch_count(5) >= 1);
        uninstall(5);
    }

    #[test]
    fn dispatch_counts_unhandled_lines() {
        let before = unhandled_count();
        let mut frame = RegisterFrame::zeroed();
        frame.vector = 0x26; // line 6, nothing registered
        interrupt_dispatch(&mut frame);
        assert_eq!(unhandled_count(), before + 1);
    }

    #[test]
    fn page_fault_decode_reads_error_bits() {
        let info = PageFaultInfo::decode(0b011, 0x10);
        assert!(info.present);
        assert!(info.write);
        assert!(!info.user);
        assert!(info.is_null_deref());

        let far = PageFaultInfo::decode(0, 0x0040_0000);
        assert!(!far.is_null_deref());
    }
}
