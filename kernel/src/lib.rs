//! OrcaOS Kernel Core
//!
//! This library provides the machine-independent core of the OrcaOS kernel:
//! physical frame management with demand paging and swap, per-process
//! address spaces, the software-managed TLB fault path, blocking
//! synchronization primitives, and the process/file system call layer.
//!
//! Boot, trap dispatch, device drivers, and the ELF loader live in the
//! platform layers; this crate consumes a [`arch::TrapFrame`] and fault
//! descriptions and exposes everything else through a single [`Kernel`]
//! value constructed at boot.

#![no_std]

extern crate alloc;

// On bare-metal x86_64 use the kernel heap allocator. On hosted targets
// (unit tests, coverage) delegate to the system allocator so that test code
// using Vec/String/alloc compiles and runs under the standard harness.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use linked_list_allocator::LockedHeap;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(not(target_os = "none"))]
extern crate std;

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

/// Get a reference to the kernel heap allocator so the boot layer can hand
/// it its heap region.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn get_allocator() -> &'static LockedHeap {
    &ALLOCATOR
}

pub mod arch;
pub mod error;
pub mod fs;
pub mod kernel;
pub mod mm;
pub mod process;
pub mod sched;
pub mod sync;
pub mod syscall;


pub use error::Errno;
pub use kernel::{Kernel, KernelConfig};
pub use mm::{FrameKind, PhysicalAddress, VirtualAddress, PAGE_SIZE};
