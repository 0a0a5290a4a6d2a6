//! Kernel-wide error types.
//!
//! Every fallible kernel path returns one of these through `Result` rather
//! than a bare string or sentinel integer. Per-subsystem enums nest inside
//! [`KernelError`] so callers can match at whatever granularity they need.

use core::fmt;

/// Shorthand used throughout the kernel.
pub type KernelResult<T> = Result<T, KernelError>;

/// Top-level kernel error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Allocation failed (heap or physical pages).
    OutOfMemory { requested: usize },
    /// A caller-supplied argument is unusable.
    InvalidArgument {
        name: &'static str,
        value: &'static str,
    },
    /// The referenced process does not exist.
    ProcessNotFound { pid: u32 },
    /// Process table is full.
    ProcessLimit,
    /// Filesystem and descriptor errors.
    Fs(FsError),
    /// Scheduler errors.
    Sched(SchedError),
    /// ELF image validation/loading errors.
    Elf(ElfError),
    /// A hardware device reported a failure.
    Hardware { device: &'static str, code: u16 },
    /// Subsystem used before its `init()` ran.
    NotInitialized { subsystem: &'static str },
    /// Operation is not supported by this backend.
    NotSupported { operation: &'static str },
}

/// Filesystem-layer errors surfaced through the VFS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    NotFound,
    NotADirectory,
    IsADirectory,
    NotAFile,
    NoSpace,
    InvalidDescriptor,
    Io,
    AlreadyExists,
    DirectoryNotEmpty,
    ReadOnly,
    NameTooLong,
    InvalidPath,
}

/// Scheduler errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// PID 1 cannot be killed or exited.
    IdleIsImmortal,
    /// The target slot is not in a runnable state.
    NotRunnable { pid: u32 },
}

/// ELF32 loader errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    BadMagic,
    NotElf32,
    NotLittleEndian,
    NotExecutable,
    WrongMachine,
    NoLoadSegments,
    EntryOutsideImage,
    Truncated,
    SegmentOutsideWindow,
}

impl From<FsError> for KernelError {
    fn from(e: FsError) -> Self {
        KernelError::Fs(e)
    }
}

impl From<SchedError> for KernelError {
    fn from(e: SchedError) -> Self {
        KernelError::Sched(e)
    }
}

impl From<ElfError> for KernelError {
    fn from(e: ElfError) -> Self {
        KernelError::Elf(e)
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            FsError::NotFound => "no such file or directory",
            FsError::NotADirectory => "not a directory",
            FsError::IsADirectory => "is a directory",
            FsError::NotAFile => "not a regular file",
            FsError::NoSpace => "no space left on device",
            FsError::InvalidDescriptor => "bad file descriptor",
            FsError::Io => "I/O error",
            FsError::AlreadyExists => "file exists",
            FsError::DirectoryNotEmpty => "directory not empty",
            FsError::ReadOnly => "read-only filesystem",
            FsError::NameTooLong => "name too long",
            FsError::InvalidPath => "invalid path",
        };
        f.write_str(msg)
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::OutOfMemory { requested } => {
                write!(f, "out of memory (requested {} bytes)", requested)
            }
            KernelError::InvalidArgument { name, value } => {
                write!(f, "invalid argument {}: {}", name, value)
            }
            KernelError::ProcessNotFound { pid } => write!(f, "no such process: {}", pid),
            KernelError::ProcessLimit => f.write_str("process table full"),
            KernelError::Fs(e) => write!(f, "{}", e),
            KernelError::Sched(SchedError::IdleIsImmortal) => {
                f.write_str("the idle process cannot be killed")
            }
            KernelError::Sched(SchedError::NotRunnable { pid }) => {
                write!(f, "process {} is not runnable", pid)
            }
            KernelError::Elf(e) => write!(f, "bad ELF image: {:?}", e),
            KernelError::Hardware { device, code } => {
                write!(f, "hardware error on {}: {:#06x}", device, code)
            }
            KernelError::NotInitialized { subsystem } => {
                write!(f, "{} used before init", subsystem)
            }
            KernelError::NotSupported { operation } => {
                write!(f, "operation not supported: {}", operation)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fs_error_converts_into_kernel_error() {
        let e: KernelError = FsError::NotFound.into();
        assert_eq!(e, KernelError::Fs(FsError::NotFound));
    }

    #[test]
    fn display_is_human_readable() {
        extern crate alloc;
        use alloc::format;
        let e = KernelError::Fs(FsError::DirectoryNotEmpty);
        assert_eq!(format!("{}", e), "directory not empty");
    }
}
