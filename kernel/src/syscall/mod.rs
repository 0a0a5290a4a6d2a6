//! Syscall table for loaded programs.
//!
//! There is no trap-based syscall path in a flat ring-0 system; programs
//! call straight through a versioned struct of function pointers whose
//! address the loader passes as their single entry argument. The first two
//! fields (`version`, `table_size`) let a program probe compatibility
//! before touching anything else. Field order is ABI: extend at the end,
//! never reorder, and bump `SYSCALL_VERSION` for breaking changes.

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::FsError;
use crate::fs::{FdTable, OpenFlags, SeekFrom};
use crate::sync::{IrqMutex, OnceLock};

/// Current ABI version.
pub const SYSCALL_VERSION: u32 = 1;

/// Descriptor table shared by all loaded programs (one flat kernel, one
/// descriptor namespace).
static FDTABLE: IrqMutex<FdTable> = IrqMutex::new(FdTable::new());

/// Arguments for the next program launch, set by the shell.
static PROGRAM_ARGS: IrqMutex<Vec<String>> = IrqMutex::new(Vec::new());

/// Console-clear hook installed by the desktop terminal.
static CLEAR_HOOK: OnceLock<fn()> = OnceLock::new();

/// `stat` output structure shared with programs.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CupidStat {
    pub size: u32,
    /// 0 = file, 1 = directory, 2 = device.
    pub kind: u32,
    pub mode: u32,
}

/// `readdir` output structure shared with programs.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CupidDirent {
    pub name: [u8; 64],
    pub kind: u32,
    pub size: u32,
}

/// The table itself. `#[repr(C)]`: offsets are the program ABI.
#[repr(C)]
pub struct CupidSyscallTable {
    pub version: u32,
    pub table_size: u32,

    // console
    pub console_print: extern "C" fn(*const u8),
    pub console_putchar: extern "C" fn(u32),
    pub console_print_int: extern "C" fn(i32),
    pub console_print_hex: extern "C" fn(u32),
    pub console_clear: extern "C" fn(),

    // heap
    pub heap_alloc: extern "C" fn(u32) -> *mut u8,
    pub heap_free: extern "C" fn(*mut u8),

    // string
    pub str_len: extern "C" fn(*const u8) -> u32,
    pub str_cmp: extern "C" fn(*const u8, *const u8) -> i32,

    // vfs
    pub fs_open: extern "C" fn(*const u8, u32) -> i32,
    pub fs_close: extern "C" fn(i32) -> i32,
    pub fs_read: extern "C" fn(i32, *mut u8, u32) -> i32,
    pub fs_write: extern "C" fn(i32, *const u8, u32) -> i32,
    pub fs_seek: extern "C" fn(i32, i32, u32) -> i32,
    pub fs_stat: extern "C" fn(*const u8, *mut CupidStat) -> i32,
    pub fs_readdir: extern "C" fn(i32, *mut CupidDirent) -> i32,
    pub fs_unlink: extern "C" fn(*const u8) -> i32,
    pub fs_mkdir: extern "C" fn(*const u8) -> i32,

    // process
    pub proc_exit: extern "C" fn(i32),
    pub proc_yield: extern "C" fn(),
    pub proc_getpid: extern "C" fn() -> u32,
    pub proc_kill: extern "C" fn(u32) -> i32,
    pub proc_sleep_ms: extern "C" fn(u32),

    // shell
    pub shell_execute: extern "C" fn(*const u8) -> i32,
    pub shell_cwd: extern "C" fn(*mut u8, u32) -> i32,

    // time
    pub time_uptime_ms: extern "C" fn() -> u32,

    // exec
    pub exec_spawn: extern "C" fn(*const u8) -> i32,

    // args
    pub args_count: extern "C" fn() -> u32,
    pub args_get: extern "C" fn(u32, *mut u8, u32) -> i32,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Longest C string a program may pass.
const MAX_CSTR: usize = 4096;

/// Borrow a NUL-terminated program string.
///
/// Returns `None` for null pointers, unterminated buffers, or non-UTF8.
fn cstr<'a>(ptr: *const u8) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    for len in 0..MAX_CSTR {
        // SAFETY: flat shared address space; the program handed us this
        // pointer and the scan is bounded.
        let byte = unsafe { ptr.add(len).read() };
        if byte == 0 {
            // SAFETY: bytes [0, len) were just read and are NUL-free.
            let slice = unsafe { core::slice::from_raw_parts(ptr, len) };
            return core::str::from_utf8(slice).ok();
        }
    }
    None
}

/// Stable negative codes for program-visible filesystem errors.
pub fn fs_error_code(e: FsError) -> i32 {
    match e {
        FsError::NotFound => -2,
        FsError::NotADirectory => -3,
        FsError::IsADirectory => -4,
        FsError::Io => -5,
        FsError::InvalidDescriptor => -6,
        FsError::AlreadyExists => -7,
        FsError::DirectoryNotEmpty => -8,
        FsError::NoSpace => -9,
        FsError::NotAFile => -10,
        FsError::ReadOnly => -11,
        FsError::NameTooLong => -12,
        FsError::InvalidPath => -13,
    }
}

// ---------------------------------------------------------------------------
// Implementations
// ---------------------------------------------------------------------------

extern "C" fn sys_console_print(text: *const u8) {
    if let Some(s) = cstr(text) {
        crate::print!("{}", s);
    }
}

extern "C" fn sys_console_putchar(ch: u32) {
    if let Some(c) = char::from_u32(ch) {
        crate::print!("{}", c);
    }
}

extern "C" fn sys_console_print_int(value: i32) {
    crate::print!("{}", value);
}

extern "C" fn sys_console_print_hex(value: u32) {
    crate::print!("{:#010x}", value);
}

extern "C" fn sys_console_clear() {
    if let Some(&hook) = CLEAR_HOOK.get() {
        hook();
    }
}

extern "C" fn sys_heap_alloc(size: u32) -> *mut u8 {
    crate::mm::heap::KERNEL_HEAP.alloc(size as usize)
}

extern "C" fn sys_heap_free(ptr: *mut u8) {
    // SAFETY: programs must only free pointers from sys_heap_alloc; the
    // heap's canaries catch most violations loudly.
    unsafe { crate::mm::heap::KERNEL_HEAP.free(ptr) };
}

extern "C" fn sys_str_len(s: *const u8) -> u32 {
    cstr(s).map_or(0, |s| s.len() as u32)
}

extern "C" fn sys_str_cmp(a: *const u8, b: *const u8) -> i32 {
    match (cstr(a), cstr(b)) {
        (Some(a), Some(b)) => match a.cmp(b) {
            core::cmp::Ordering::Less => -1,
            core::cmp::Ordering::Equal => 0,
            core::cmp::Ordering::Greater => 1,
        },
        _ => -1,
    }
}

extern "C" fn sys_fs_open(path: *const u8, flags: u32) -> i32 {
    let Some(path) = cstr(path) else {
        return fs_error_code(FsError::InvalidPath);
    };
    let flags = OpenFlags::from_bits(flags);
    let node = {
        let vfs = crate::fs::get_vfs().read();
        match vfs.open(path, flags) {
            Ok(node) => node,
            Err(e) => return fs_error_code(e),
        }
    };
    match FDTABLE.lock().insert(node, flags) {
        Ok(fd) => fd as i32,
        Err(e) => fs_error_code(e),
    }
}

extern "C" fn sys_fs_close(fd: i32) -> i32 {
    if fd < 0 {
        return fs_error_code(FsError::InvalidDescriptor);
    }
    match FDTABLE.lock().close(fd as usize) {
        Ok(()) => 0,
        Err(e) => fs_error_code(e),
    }
}

extern "C" fn sys_fs_read(fd: i32, buf: *mut u8, len: u32) -> i32 {
    if fd < 0 || buf.is_null() {
        return fs_error_code(FsError::InvalidDescriptor);
    }
    // SAFETY: flat address space; the program owns `buf..buf+len`.
    let slice = unsafe { core::slice::from_raw_parts_mut(buf, len as usize) };
    match FDTABLE.lock().read(fd as usize, slice) {
        Ok(n) => n as i32,
        Err(e) => fs_error_code(e),
    }
}

extern "C" fn sys_fs_write(fd: i32, buf: *const u8, len: u32) -> i32 {
    if fd < 0 || buf.is_null() {
        return fs_error_code(FsError::InvalidDescriptor);
    }
    // SAFETY: flat address space; the program owns `buf..buf+len`.
    let slice = unsafe { core::slice::from_raw_parts(buf, len as usize) };
    match FDTABLE.lock().write(fd as usize, slice) {
        Ok(n) => n as i32,
        Err(e) => fs_error_code(e),
    }
}

extern "C" fn sys_fs_seek(fd: i32, offset: i32, whence: u32) -> i32 {
    if fd < 0 {
        return fs_error_code(FsError::InvalidDescriptor);
    }
    let from = match whence {
        0 => SeekFrom::Start(offset.max(0) as usize),
        1 => SeekFrom::Current(offset as isize),
        2 => SeekFrom::End(offset as isize),
        _ => return fs_error_code(FsError::InvalidPath),
    };
    match FDTABLE.lock().seek(fd as usize, from) {
        Ok(pos) => pos as i32,
        Err(e) => fs_error_code(e),
    }
}

extern "C" fn sys_fs_stat(path: *const u8, out: *mut CupidStat) -> i32 {
    let Some(path) = cstr(path) else {
        return fs_error_code(FsError::InvalidPath);
    };
    if out.is_null() {
        return fs_error_code(FsError::InvalidPath);
    }
    let meta = {
        let vfs = crate::fs::get_vfs().read();
        match vfs.stat(path) {
            Ok(meta) => meta,
            Err(e) => return fs_error_code(e),
        }
    };
    let stat = CupidStat {
        size: meta.size as u32,
        kind: match meta.kind {
            crate::fs::NodeKind::File => 0,
            crate::fs::NodeKind::Directory => 1,
            crate::fs::NodeKind::Device => 2,
        },
        mode: meta.mode as u32,
    };
    // SAFETY: non-null out pointer owned by the caller.
    unsafe { out.write(stat) };
    0
}

extern "C" fn sys_fs_readdir(fd: i32, out: *mut CupidDirent) -> i32 {
    if fd < 0 || out.is_null() {
        return fs_error_code(FsError::InvalidDescriptor);
    }
    match FDTABLE.lock().readdir_next(fd as usize) {
        Ok(Some(entry)) => {
            let mut dirent = CupidDirent {
                name: [0; 64],
                kind: match entry.kind {
                    crate::fs::NodeKind::File => 0,
                    crate::fs::NodeKind::Directory => 1,
                    crate::fs::NodeKind::Device => 2,
                },
                size: entry.size as u32,
            };
            let n = entry.name.len().min(63);
            dirent.name[..n].copy_from_slice(&entry.name.as_bytes()[..n]);
            // SAFETY: non-null out pointer owned by the caller.
            unsafe { out.write(dirent) };
            1
        }
        Ok(None) => 0,
        Err(e) => fs_error_code(e),
    }
}

extern "C" fn sys_fs_unlink(path: *const u8) -> i32 {
    let Some(path) = cstr(path) else {
        return fs_error_code(FsError::InvalidPath);
    };
    let vfs = crate::fs::get_vfs().read();
    match vfs.unlink(path) {
        Ok(()) => 0,
        Err(e) => fs_error_code(e),
    }
}

extern "C" fn sys_fs_mkdir(path: *const u8) -> i32 {
    let Some(path) = cstr(path) else {
        return fs_error_code(FsError::InvalidPath);
    };
    let vfs = crate::fs::get_vfs().read();
    match vfs.mkdir(path) {
        Ok(()) => 0,
        Err(e) => fs_error_code(e),
    }
}

extern "C" fn sys_proc_exit(code: i32) {
    crate::process::exit_current(code);
}

extern "C" fn sys_proc_yield() {
    crate::sched::yield_now();
}

extern "C" fn sys_proc_getpid() -> u32 {
    crate::process::current_pid()
}

extern "C" fn sys_proc_kill(pid: u32) -> i32 {
    match crate::process::kill(pid) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

extern "C" fn sys_proc_sleep_ms(ms: u32) {
    crate::timer::sleep_ms(ms as u64);
}

extern "C" fn sys_shell_execute(cmd: *const u8) -> i32 {
    match cstr(cmd) {
        Some(line) => crate::services::shell::execute_line(line),
        None => -1,
    }
}

extern "C" fn sys_shell_cwd(buf: *mut u8, cap: u32) -> i32 {
    if buf.is_null() || cap == 0 {
        return -1;
    }
    let cwd = {
        let vfs = crate::fs::get_vfs().read();
        String::from(vfs.cwd())
    };
    let n = cwd.len().min(cap as usize - 1);
    // SAFETY: caller-owned buffer of `cap` bytes.
    unsafe {
        core::ptr::copy_nonoverlapping(cwd.as_ptr(), buf, n);
        buf.add(n).write(0);
    }
    n as i32
}

extern "C" fn sys_time_uptime_ms() -> u32 {
    crate::timer::uptime_ms() as u32
}

extern "C" fn sys_exec_spawn(path: *const u8) -> i32 {
    let Some(path) = cstr(path) else {
        return -1;
    };
    match crate::process::loader::exec(path, crate::process::DEFAULT_STACK_SIZE) {
        Ok(pid) => pid as i32,
        Err(_) => -1,
    }
}

extern "C" fn sys_args_count() -> u32 {
    PROGRAM_ARGS.lock().len() as u32
}

extern "C" fn sys_args_get(index: u32, buf: *mut u8, cap: u32) -> i32 {
    if buf.is_null() || cap == 0 {
        return -1;
    }
    let args = PROGRAM_ARGS.lock();
    let Some(arg) = args.get(index as usize) else {
        return -1;
    };
    let n = arg.len().min(cap as usize - 1);
    // SAFETY: caller-owned buffer of `cap` bytes.
    unsafe {
        core::ptr::copy_nonoverlapping(arg.as_ptr(), buf, n);
        buf.add(n).write(0);
    }
    n as i32
}

// ---------------------------------------------------------------------------
// The table instance
// ---------------------------------------------------------------------------

/// The one kernel syscall table. Written at link time, read-only forever.
pub static SYSCALL_TABLE: CupidSyscallTable = CupidSyscallTable {
    version: SYSCALL_VERSION,
    table_size: core::mem::size_of::<CupidSyscallTable>() as u32,
    console_print: sys_console_print,
    console_putchar: sys_console_putchar,
    console_print_int: sys_console_print_int,
    console_print_hex: sys_console_print_hex,
    console_clear: sys_console_clear,
    heap_alloc: sys_heap_alloc,
    heap_free: sys_heap_free,
    str_len: sys_str_len,
    str_cmp: sys_str_cmp,
    fs_open: sys_fs_open,
    fs_close: sys_fs_close,
    fs_read: sys_fs_read,
    fs_write: sys_fs_write,
    fs_seek: sys_fs_seek,
    fs_stat: sys_fs_stat,
    fs_readdir: sys_fs_readdir,
    fs_unlink: sys_fs_unlink,
    fs_mkdir: sys_fs_mkdir,
    proc_exit: sys_proc_exit,
    proc_yield: sys_proc_yield,
    proc_getpid: sys_proc_getpid,
    proc_kill: sys_proc_kill,
    proc_sleep_ms: sys_proc_sleep_ms,
    shell_execute: sys_shell_execute,
    shell_cwd: sys_shell_cwd,
    time_uptime_ms: sys_time_uptime_ms,
    exec_spawn: sys_exec_spawn,
    args_count: sys_args_count,
    args_get: sys_args_get,
};

/// Address handed to loaded programs.
pub fn table_ptr() -> *const CupidSyscallTable {
    &SYSCALL_TABLE as *const _
}

/// Install the console-clear hook (desktop terminal).
pub fn set_clear_hook(hook: fn()) {
    let _ = CLEAR_HOOK.set(hook);
}

/// Stash argv for the next program launch.
pub fn set_program_args(args: Vec<String>) {
    *PROGRAM_ARGS.lock() = args;
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn version_fields_lead_the_struct() {
        assert_eq!(offset_of!(CupidSyscallTable, version), 0);
        assert_eq!(offset_of!(CupidSyscallTable, table_size), 4);
        assert_eq!(SYSCALL_TABLE.version, 1);
        assert_eq!(
            SYSCALL_TABLE.table_size as usize,
            size_of::<CupidSyscallTable>()
        );
    }

    #[test]
    fn function_pointers_follow_in_declaration_order() {
        // The first pointer sits right after the two header words (padded
        // to pointer alignment); later pointers are contiguous.
        let first = offset_of!(CupidSyscallTable, console_print);
        assert_eq!(first % core::mem::align_of::<extern "C" fn(*const u8)>(), 0);
        let step = size_of::<usize>();
        assert_eq!(offset_of!(CupidSyscallTable, console_putchar), first + step);
        assert_eq!(
            offset_of!(CupidSyscallTable, console_print_int),
            first + 2 * step
        );
    }

    #[test]
    fn cstr_rejects_null_and_accepts_terminated() {
        assert_eq!(cstr(core::ptr::null()), None);
        let s = b"hello\0";
        assert_eq!(cstr(s.as_ptr()), Some("hello"));
    }

    #[test]
    fn error_codes_are_stable_and_negative() {
        assert_eq!(fs_error_code(FsError::NotFound), -2);
        assert_eq!(fs_error_code(FsError::Io), -5);
        for e in [
            FsError::NotFound,
            FsError::NoSpace,
            FsError::InvalidDescriptor,
            FsError::AlreadyExists,
        ] {
            assert!(fs_error_code(e) < 0);
        }
    }

    #[test]
    fn string_helpers_work_over_raw_pointers() {
        let a = b"abc\0";
        let b = b"abd\0";
        assert_eq!(sys_str_len(a.as_ptr()), 3);
        assert_eq!(sys_str_cmp(a.as_ptr(), a.as_ptr()), 0);
        assert_eq!(sys_str_cmp(a.as_ptr(), b.as_ptr()), -1);
        assert_eq!(sys_str_cmp(b.as_ptr(), a.as_ptr()), 1);
    }

    #[test]
    fn args_round_trip() {
        set_program_args(alloc::vec![String::from("hello"), String::from("-o")]);
        assert_eq!(sys_args_count(), 2);

        let mut buf = [0u8; 16];
        let n = sys_args_get(0, buf.as_mut_ptr(), buf.len() as u32);
        assert_eq!(n, 5);
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(buf[5], 0);

        assert_eq!(sys_args_get(9, buf.as_mut_ptr(), buf.len() as u32), -1);
        set_program_args(Vec::new());
    }
}
