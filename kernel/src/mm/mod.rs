//! Memory management
//!
//! Bottom-up: the [`coremap`] owns physical frames, [`swap`] moves pages
//! between frames and the swap device, [`addrspace`] gives each process its
//! segments and page tables, [`tlb`] caches translations, [`fault`] ties
//! them together on an MMU miss, and [`usercopy`] is the checked boundary
//! syscalls use to touch user memory.

use bitflags::bitflags;

pub mod addrspace;
pub mod coremap;
pub mod fault;
pub mod swap;
pub mod tlb;
pub mod usercopy;

pub use coremap::{Coremap, FrameKind, FrameState};
pub use fault::vm_fault;

/// Size of a physical frame and of a virtual page.
pub const PAGE_SIZE: usize = 4096;

/// Mask selecting the page-number bits of an address.
pub const PAGE_MASK: u64 = !(PAGE_SIZE as u64 - 1);

/// First address above user space. User segments must end at or below
/// this; everything above belongs to the kernel.
pub const USER_SPACE_TOP: u64 = 0x8000_0000;

/// Initial user stack pointer (top of the stack segment, exclusive).
pub const USERSTACK: u64 = USER_SPACE_TOP;

/// Size of the fixed user stack segment.
pub const USERSTACKSIZE: usize = 1024 * PAGE_SIZE;

/// Lowest address of the user stack segment.
pub const USERSTACKBASE: u64 = USERSTACK - USERSTACKSIZE as u64;

/// Address where every user heap begins; the break moves up from here.
pub const USERHEAPSTART: u64 = 0x4000_0000;

/// Physical memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysicalAddress(pub u64);

impl PhysicalAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }

    pub const fn offset(&self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 % PAGE_SIZE as u64 == 0
    }
}

/// Virtual memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualAddress(pub u64);

impl VirtualAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn add(&self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }

    /// Round down to the containing page boundary.
    pub const fn page_align_down(&self) -> Self {
        Self(self.0 & PAGE_MASK)
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 % PAGE_SIZE as u64 == 0
    }

    /// Offset of this address within its page.
    pub const fn page_offset(&self) -> usize {
        (self.0 & !PAGE_MASK) as usize
    }
}

bitflags! {
    /// Access permissions of a segment.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentPerms: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl SegmentPerms {
    /// Read-write, the permission set of heap and stack segments.
    pub const fn rw() -> Self {
        Self::READ.union(Self::WRITE)
    }
}

/// Kind of MMU fault reported by the trap vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// A read was attempted.
    Read,
    /// A write was attempted.
    Write,
    /// A write hit a TLB entry without the dirty bit. This kernel does not
    /// implement copy-on-write, so the fault is invalid.
    ReadOnly,
}
