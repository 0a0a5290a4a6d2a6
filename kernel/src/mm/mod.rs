//! Memory management: physical page bitmap and the tracked kernel heap.

pub mod heap;
pub mod pmm;
pub mod tracker;

pub use pmm::PAGE_SIZE;

/// Fixed physical layout carved out at boot. The stage-2 loader drops the
/// kernel at 1 MiB; everything below that (real-mode IVT, BIOS data, the
/// loader itself) stays reserved forever.
pub const LOW_MEMORY_END: u32 = 0x0010_0000;

/// Maximum footprint reserved for the kernel image + BSS.
pub const KERNEL_IMAGE_END: u32 = 0x0030_0000;

/// Boot kernel stack: one 16 KiB region directly under the program window.
pub const KERNEL_STACK_BASE: u32 = 0x003F_C000;
pub const KERNEL_STACK_SIZE: u32 = 0x4000;

/// Window where ELF program images are loaded (and where the AOT toolchain
/// links them). Reserved from the PMM so page allocation never collides
/// with a running program.
pub const PROGRAM_WINDOW_BASE: u32 = 0x0040_0000;
pub const PROGRAM_WINDOW_END: u32 = 0x0080_0000;

/// Initialize the physical allocator over `ram_bytes` of RAM and mark every
/// fixed region reserved, then seed the heap with its first region.
pub fn init(ram_bytes: u32, framebuffer: Option<(u32, u32)>) -> crate::error::KernelResult<()> {
    pmm::init(ram_bytes)?;
    pmm::reserve_range(0, LOW_MEMORY_END)?;
    pmm::reserve_range(LOW_MEMORY_END, KERNEL_IMAGE_END)?;
    pmm::reserve_range(KERNEL_STACK_BASE, KERNEL_STACK_BASE + KERNEL_STACK_SIZE)?;
    pmm::reserve_range(PROGRAM_WINDOW_BASE, PROGRAM_WINDOW_END)?;
    if let Some((fb_base, fb_len)) = framebuffer {
        // The aperture may live above the managed window (common for VBE
        // LFB at 0xE0000000); reserving is a no-op in that case.
        let _ = pmm::reserve_range(fb_base, fb_base.saturating_add(fb_len));
    }

    heap::init()?;
    log::info!(
        "mm: {} pages managed, {} free after reservations",
        pmm::total_pages(),
        pmm::free_pages()
    );
    Ok(())
}
