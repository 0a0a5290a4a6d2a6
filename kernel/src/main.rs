//! Kernel binary entry point.
//!
//! The stage-2 loader drops us here in 32-bit protected mode with a flat
//! GDT, interrupts off, and the boot-info block filled in. Bring-up order
//! matters: serial first so panics are visible, then memory, interrupts,
//! drivers, filesystems, graphics, and finally the scheduler with the
//! desktop and shell threads.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod kernel {
    use core::panic::PanicInfo;

    use cupid_kernel::{
        arch, bootinfo, desktop, drivers, fs, graphics, logger, mm, process, sched, serial,
        serial_println, timer,
    };

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        arch::disable_interrupts();
        serial_println!("\n*** KERNEL PANIC ***");
        serial_println!("{}", info);
        cupid_kernel::arch::x86::cpu::halt_loop();
    }

    #[no_mangle]
    pub extern "C" fn _start() -> ! {
        serial::init();
        logger::init();
        log::info!("CupidOS v{} booting", env!("CARGO_PKG_VERSION"));

        let boot = bootinfo::read();
        log::info!(
            "boot: {} MiB RAM, {}x{} framebuffer at {:#010x}",
            boot.ram_bytes / (1024 * 1024),
            boot.fb_width,
            boot.fb_height,
            boot.fb_addr
        );

        let fb_len = boot.fb_pitch * boot.fb_height;
        mm::init(boot.ram_bytes, Some((boot.fb_addr, fb_len))).expect("memory init failed");

        arch::init();
        timer::init().expect("timer init failed");
        drivers::keyboard::init().expect("keyboard init failed");
        drivers::mouse::init().expect("mouse init failed");

        fs::init();
        fs::mount_disk();

        // SAFETY: the loader negotiated this aperture; it covers
        // width*height 32-bit pixels.
        let framebuffer = unsafe {
            graphics::Framebuffer::new(
                boot.fb_addr as usize as *mut u32,
                boot.fb_width as usize,
                boot.fb_height as usize,
            )
        };
        graphics::compositor::init(framebuffer);

        // PID 1: idle. PID 2: this thread, the desktop. PID 3: the shell.
        sched::init().expect("scheduler init failed");
        let desktop_pid = process::register_current("desktop").expect("register desktop");
        debug_assert_eq!(desktop_pid, 2);
        desktop::init().expect("desktop init failed");
        let shell_pid = desktop::spawn_shell().expect("shell spawn failed");
        log::info!("desktop pid {}, shell pid {}", desktop_pid, shell_pid);

        arch::enable_interrupts();
        desktop::run();
    }
}

/// Hosted builds only exist so `cargo build` works on the development
/// machine; the kernel must be cross-compiled for bare-metal i386.
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
fn main() {
    eprintln!("cupid-kernel is a bare-metal i386 kernel; build for the i686-unknown-none target");
}
