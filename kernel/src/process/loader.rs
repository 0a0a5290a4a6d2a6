//! Program loading and exec.
//!
//! Validated ELF32 images are copied segment-by-segment into the reserved
//! program window, zero-filling each segment's `memsz` tail. The new
//! process starts at `e_entry` through the scheduler trampoline, receiving
//! the syscall table pointer as its single cdecl argument.

use alloc::string::String;
use alloc::vec::Vec;

use crate::elf::{self, Image};
use crate::error::{ElfError, FsError, KernelError, KernelResult};
use crate::mm::{PROGRAM_WINDOW_BASE, PROGRAM_WINDOW_END};
use crate::process::Pid;
use crate::sync::IrqMutex;

/// Live image spans inside the program window; overlapping loads are
/// refused so two programs cannot clobber each other.
static LIVE_IMAGES: IrqMutex<Vec<(usize, usize)>> = IrqMutex::new(Vec::new());

/// A successfully placed image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedImage {
    pub entry: u32,
    pub base: usize,
    pub size: usize,
}

fn overlaps(a_base: usize, a_size: usize, b_base: usize, b_size: usize) -> bool {
    a_base < b_base + b_size && b_base < a_base + a_size
}

/// Validate the image's placement and claim its span.
pub fn claim_span(image: &Image<'_>) -> KernelResult<LoadedImage> {
    let base = image.base() as usize;
    let size = image.size() as usize;

    for segment in &image.segments {
        let start = segment.vaddr as usize;
        let end = start + segment.memsz as usize;
        if start < PROGRAM_WINDOW_BASE as usize || end > PROGRAM_WINDOW_END as usize {
            return Err(ElfError::SegmentOutsideWindow.into());
        }
    }

    let mut live = LIVE_IMAGES.lock();
    if live.iter().any(|&(b, s)| overlaps(base, size, b, s)) {
        return Err(KernelError::InvalidArgument {
            name: "image",
            value: "program window span already in use",
        });
    }
    live.push((base, size));
    Ok(LoadedImage {
        entry: image.entry,
        base,
        size,
    })
}

/// Release a span claimed by [`claim_span`]. Called exactly once, when the
/// owning PCB is reaped.
pub fn release_image(base: usize) {
    LIVE_IMAGES.lock().retain(|&(b, _)| b != base);
}

/// Count of live images (diagnostics/tests).
pub fn live_image_count() -> usize {
    LIVE_IMAGES.lock().len()
}

/// Copy the segments into place.
///
/// # Safety
/// The span must have been claimed, and the program window must be backed
/// by reserved identity-mapped RAM.
#[cfg(all(target_arch = "x86", target_os = "none"))]
unsafe fn copy_segments(image: &Image<'_>) {
    for segment in &image.segments {
        let dst = segment.vaddr as usize as *mut u8;
        // SAFETY: claim_span verified the segment lies inside the reserved
        // window, which the PMM never hands to anyone else.
        unsafe {
            core::ptr::copy_nonoverlapping(segment.data.as_ptr(), dst, segment.data.len());
            core::ptr::write_bytes(
                dst.add(segment.data.len()),
                0,
                segment.memsz as usize - segment.data.len(),
            );
        }
    }
}

/// Load an ELF image from a VFS path and spawn a process running it.
///
/// The entry is invoked as `entry(table: *const CupidSyscallTable)` per
/// the program ABI.
pub fn exec(path: &str, stack_size: usize) -> KernelResult<Pid> {
    let file = {
        let vfs = crate::fs::get_vfs().read();
        crate::fs::read_all(&vfs, path).map_err(KernelError::Fs)?
    };
    exec_bytes(&file, program_name(path), stack_size)
}

/// Load an in-memory ELF image (used by `exec` and by the AOT test path).
pub fn exec_bytes(file: &[u8], name: &str, stack_size: usize) -> KernelResult<Pid> {
    let image = elf::parse(file).map_err(KernelError::Elf)?;
    let loaded = claim_span(&image)?;

    #[cfg(all(target_arch = "x86", target_os = "none"))]
    {
        // SAFETY: span claimed above; window is reserved RAM.
        unsafe { copy_segments(&image) };

        let table_ptr = crate::syscall::table_ptr() as u32;
        // SAFETY: the entry address points into the image we just copied;
        // the ABI is `extern "C" fn(u32) -> i32`.
        let entry: crate::process::EntryArgFn =
            unsafe { core::mem::transmute(loaded.entry as usize) };
        let pid = match crate::process::create_with_arg(entry, name, stack_size, table_ptr) {
            Ok(pid) => pid,
            Err(e) => {
                release_image(loaded.base);
                return Err(e);
            }
        };
        crate::process::set_image(pid, loaded.base, loaded.size)?;
        log::info!(
            "exec: {} at {:#x}..{:#x}, entry {:#x}, pid {}",
            name,
            loaded.base,
            loaded.base + loaded.size,
            loaded.entry,
            pid
        );
        Ok(pid)
    }

    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    {
        // Hosted builds validate and claim but cannot jump into i386 code.
        let _ = (name, stack_size);
        release_image(loaded.base);
        Err(KernelError::NotSupported {
            operation: "exec on hosted build",
        })
    }
}

/// Derive a process name from the final path component.
fn program_name(path: &str) -> &str {
    path.rsplit('/').next().filter(|s| !s.is_empty()).unwrap_or(path)
}

/// Map common exec failures onto shell-friendly errors.
pub fn exec_error_message(err: &KernelError) -> String {
    use core::fmt::Write;
    let mut msg = String::new();
    match err {
        KernelError::Fs(FsError::NotFound) => {
            let _ = write!(msg, "no such binary");
        }
        KernelError::Elf(e) => {
            let _ = write!(msg, "not a loadable program: {:?}", e);
        }
        other => {
            let _ = write!(msg, "{}", other);
        }
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::writer::write_exec;

    fn sample_image(base: u32, code_len: usize) -> Vec<u8> {
        let code = alloc::vec![0x90u8; code_len];
        write_exec(&code, base, &[], 0, base)
    }

    #[test]
    fn claim_and_release_round_trip() {
        let file = sample_image(0x40_0000, 64);
        let image = elf::parse(&file).unwrap();
        let before = live_image_count();

        let loaded = claim_span(&image).unwrap();
        assert_eq!(loaded.base, 0x40_0000);
        assert_eq!(loaded.size, 64);
        assert_eq!(live_image_count(), before + 1);

        release_image(loaded.base);
        assert_eq!(live_image_count(), before);
    }

    #[test]
    fn overlapping_images_are_refused() {
        let file = sample_image(0x48_0000, 128);
        let image = elf::parse(&file).unwrap();
        let loaded = claim_span(&image).unwrap();

        let second = sample_image(0x48_0000, 32);
        let second_image = elf::parse(&second).unwrap();
        assert!(claim_span(&second_image).is_err());

        release_image(loaded.base);
        assert!(claim_span(&second_image).is_ok());
        release_image(0x48_0000);
    }

    #[test]
    fn segments_outside_the_window_are_refused() {
        let below = sample_image(0x10_0000, 32);
        let image = elf::parse(&below).unwrap();
        assert_eq!(
            claim_span(&image).unwrap_err(),
            KernelError::Elf(ElfError::SegmentOutsideWindow)
        );

        let above = sample_image(0x7F_FFF0, 64); // straddles the window end
        let image = elf::parse(&above).unwrap();
        assert!(claim_span(&image).is_err());
    }

    #[test]
    fn program_name_takes_last_component() {
        assert_eq!(program_name("/disk/hello"), "hello");
        assert_eq!(program_name("hello"), "hello");
        assert_eq!(program_name("/a/b/c.elf"), "c.elf");
    }
}
