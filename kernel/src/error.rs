//! Kernel error types
//!
//! Two layers of errors cross this crate. [`Errno`] is the numeric ABI
//! surfaced to user space by the syscall dispatcher. [`FaultError`] is the
//! typed outcome of the MMU fault path; the trap layer converts it to a
//! process-fatal signal or, at the copyin/copyout boundary, to an `Errno`.

use core::fmt;

/// System call error numbers.
///
/// The values are the OrcaOS user ABI; user-space `errno.h` is generated
/// from this table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "error numbers must be surfaced to the caller, not discarded"]
#[repr(i32)]
pub enum Errno {
    /// No such system call
    Enosys = 1,
    /// Out of memory
    Enomem = 2,
    /// No space left on device
    Enospc = 3,
    /// Invalid argument
    Einval = 4,
    /// Bad memory reference
    Efault = 5,
    /// Bad file descriptor
    Ebadf = 6,
    /// Too many open files in this process
    Emfile = 7,
    /// Hardware I/O error
    Eio = 8,
    /// No such process
    Esrch = 9,
    /// Operation only valid on a child process
    Echild = 10,
    /// Illegal seek (object does not support seeking)
    Espipe = 11,
    /// Argument list too long
    E2big = 12,
    /// Inappropriate ioctl (not a typewriter)
    Enoctty = 13,
    /// No such file or directory
    Enoent = 14,
    /// Not a directory
    Enotdir = 15,
    /// File exists
    Eexist = 16,
}

impl Errno {
    /// The raw errno value delivered in `v0` when `a3` is set.
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    /// Conventional name, for logs and test diagnostics.
    pub const fn name(self) -> &'static str {
        match self {
            Errno::Enosys => "ENOSYS",
            Errno::Enomem => "ENOMEM",
            Errno::Enospc => "ENOSPC",
            Errno::Einval => "EINVAL",
            Errno::Efault => "EFAULT",
            Errno::Ebadf => "EBADF",
            Errno::Emfile => "EMFILE",
            Errno::Eio => "EIO",
            Errno::Esrch => "ESRCH",
            Errno::Echild => "ECHILD",
            Errno::Espipe => "ESPIPE",
            Errno::E2big => "E2BIG",
            Errno::Enoctty => "ENOCTTY",
            Errno::Enoent => "ENOENT",
            Errno::Enotdir => "ENOTDIR",
            Errno::Eexist => "EEXIST",
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of a failed MMU fault.
///
/// The variants mirror the fault-handler contract: the first four are
/// process bugs the trap layer turns into a fatal signal, the last two are
/// resource/IO conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "fault errors decide whether the faulting process survives"]
pub enum FaultError {
    /// Fault taken with no current process or address space.
    NoAddressSpace,
    /// The faulting address lies in no segment.
    Segmentation,
    /// Write fault against a non-writable segment.
    Protection,
    /// Read-only trap; this kernel does not implement copy-on-write.
    InvalidOperation,
    /// No free frame and no evictable victim.
    OutOfMemory,
    /// The swap device failed while resolving the fault.
    SwapIo(Errno),
}

impl FaultError {
    /// Errno used when the fault surfaces at a syscall copy boundary.
    pub fn errno(self) -> Errno {
        match self {
            FaultError::NoAddressSpace | FaultError::Segmentation | FaultError::Protection => {
                Errno::Efault
            }
            FaultError::InvalidOperation => Errno::Einval,
            FaultError::OutOfMemory => Errno::Enomem,
            FaultError::SwapIo(_) => Errno::Eio,
        }
    }
}
