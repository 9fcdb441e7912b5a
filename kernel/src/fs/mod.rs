//! Filesystem seam
//!
//! The virtual filesystem proper is an external collaborator; the core
//! consumes it through the [`Vnode`] byte-stream interface and the
//! [`FileSystem`] open/lookup entry points. This module also carries the
//! console device, the in-memory filesystem used by tests and early boot,
//! and the per-process file handle machinery the file syscalls sit on.

use alloc::sync::Arc;

use crate::error::Errno;

pub mod console;
pub mod file;
pub mod ramfs;

pub use console::Console;
pub use file::{FileHandle, FileTable};

/// Maximum length of a path handed to the kernel.
pub const PATH_MAX: usize = 1024;

/// Maximum length of a single path component.
pub const NAME_MAX: usize = 255;

/// Per-process file table size.
pub const OPEN_MAX: usize = 128;

/// Path of the console device.
pub const CONSOLE_PATH: &str = "con:";

/// Filesystem object types the core distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    File,
    Directory,
    CharDevice,
    BlockDevice,
}

/// Stat result for a vnode.
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    pub size: u64,
    pub node_type: NodeType,
}

/// Open flags, decoded from the user ABI bits.
#[derive(Debug, Clone, Copy)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
    pub exclusive: bool,
}

impl OpenFlags {
    pub const O_RDONLY: u32 = 0;
    pub const O_WRONLY: u32 = 1;
    pub const O_RDWR: u32 = 2;
    pub const O_ACCMODE: u32 = 3;
    pub const O_CREAT: u32 = 4;
    pub const O_EXCL: u32 = 8;
    pub const O_TRUNC: u32 = 16;
    pub const O_NOCTTY: u32 = 64;

    pub fn read_only() -> Self {
        Self {
            read: true,
            write: false,
            create: false,
            truncate: false,
            exclusive: false,
        }
    }

    pub fn write_only() -> Self {
        Self {
            read: false,
            write: true,
            create: false,
            truncate: false,
            exclusive: false,
        }
    }

    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            create: false,
            truncate: false,
            exclusive: false,
        }
    }

    pub fn creating(mut self) -> Self {
        self.create = true;
        self
    }

    /// Decode the ABI bits. Unknown bits and the invalid access mode `3`
    /// are rejected.
    pub fn from_bits(bits: u32) -> Option<Self> {
        const KNOWN: u32 = OpenFlags::O_ACCMODE
            | OpenFlags::O_CREAT
            | OpenFlags::O_EXCL
            | OpenFlags::O_TRUNC
            | OpenFlags::O_NOCTTY;
        if bits & !KNOWN != 0 {
            return None;
        }
        let (read, write) = match bits & Self::O_ACCMODE {
            Self::O_RDONLY => (true, false),
            Self::O_WRONLY => (false, true),
            Self::O_RDWR => (true, true),
            _ => return None,
        };
        Some(Self {
            read,
            write,
            create: bits & Self::O_CREAT != 0,
            truncate: bits & Self::O_TRUNC != 0,
            exclusive: bits & Self::O_EXCL != 0,
        })
    }
}

/// Seek origin for `lseek`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

impl Whence {
    pub fn from_raw(raw: u32) -> Option<Whence> {
        match raw {
            0 => Some(Whence::Set),
            1 => Some(Whence::Cur),
            2 => Some(Whence::End),
            _ => None,
        }
    }
}

/// A filesystem object as a byte stream.
pub trait Vnode: Send + Sync {
    /// Read at `offset`; short reads are allowed, 0 means end-of-stream.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, Errno>;

    /// Write at `offset`; short writes are allowed.
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize, Errno>;

    fn stat(&self) -> Result<Stat, Errno>;

    /// Whether byte offsets are meaningful for this object. Console-style
    /// streams say no and `lseek` refuses them.
    fn is_seekable(&self) -> bool {
        true
    }
}

/// Name-space entry points of the external VFS.
pub trait FileSystem: Send + Sync {
    /// Open (and with `create` possibly make) the object at `path`.
    fn open(&self, path: &str, flags: OpenFlags) -> Result<Arc<dyn Vnode>, Errno>;

    /// Resolve `path` without opening it for I/O; used by `chdir`.
    fn lookup(&self, path: &str) -> Result<Arc<dyn Vnode>, Errno>;
}
