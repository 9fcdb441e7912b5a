//! MMU fault handler
//!
//! Every TLB miss lands here. The handler walks the current address
//! space's segments, materializes or revives the faulted page, and
//! installs the translation. Demand paging is demand-zero: a page's first
//! fault allocates a zero-filled frame; later faults may have to pull the
//! page back from swap.

use alloc::sync::Arc;

use super::{
    addrspace::PageEntry, FaultKind, SegmentPerms, VirtualAddress,
};
use crate::{
    error::{Errno, FaultError},
    kernel::Kernel,
    process::Process,
};

/// Resolve a fault of `kind` at `vaddr` for `curproc`.
///
/// The contract, in order: no process or address space fails outright;
/// the address must fall in a segment; a read materializes a clean page,
/// a write a dirty one (a write through an *existing* entry requires the
/// segment to be writable); a read-only trap is invalid because this
/// kernel has no copy-on-write; an on-disk page is swapped in; the
/// reference bit is set and the translation installed.
pub fn vm_fault(
    kernel: &Kernel,
    curproc: Option<&Arc<Process>>,
    kind: FaultKind,
    vaddr: VirtualAddress,
) -> Result<(), FaultError> {
    let process = curproc.ok_or(FaultError::NoAddressSpace)?;
    let aspace = process.address_space().ok_or(FaultError::NoAddressSpace)?;

    let fault_page = vaddr.page_align_down();
    let segment = aspace
        .find_segment(vaddr)
        .ok_or(FaultError::Segmentation)?;

    if kind == FaultKind::ReadOnly {
        // Copy-on-write does not exist here; a dirty-bit trap means the
        // TLB and page tables disagree.
        return Err(FaultError::InvalidOperation);
    }

    let page = match segment.lookup_page(fault_page) {
        Some(page) => {
            if kind == FaultKind::Write {
                if !segment.perms().contains(SegmentPerms::WRITE) {
                    return Err(FaultError::Protection);
                }
                page.mark_dirty();
            }
            page
        }
        None => {
            // Demand-zero. Allocate before publishing; a concurrent fault
            // on the same page may win the insert, in which case our
            // frame goes straight back.
            let paddr = kernel
                .swap
                .get_user_frame(&kernel.coremap, &kernel.tlb, None)
                .map_err(alloc_fault)?;
            let fresh = PageEntry::new_resident(fault_page, paddr, kind == FaultKind::Write);
            match segment.insert_page_if_absent(fresh) {
                Ok(page) => {
                    kernel.coremap.set_owner(paddr, &page);
                    page
                }
                Err(existing) => {
                    kernel.coremap.free_frames(paddr);
                    if kind == FaultKind::Write {
                        if !segment.perms().contains(SegmentPerms::WRITE) {
                            return Err(FaultError::Protection);
                        }
                        existing.mark_dirty();
                    }
                    existing
                }
            }
        }
    };

    page.busy().acquire();
    let resolved = (|| {
        if page.disk_slot().is_some() {
            kernel
                .swap
                .swap_in(&page, &kernel.coremap, &kernel.tlb)
                .map_err(swap_fault)?;
        }
        let paddr = page
            .resident_paddr()
            .expect("faulted page resident after swap-in");
        page.mark_used();
        kernel.tlb.insert(fault_page, paddr, true);
        Ok(())
    })();
    page.busy().release();
    resolved
}

fn alloc_fault(errno: Errno) -> FaultError {
    match errno {
        Errno::Eio => FaultError::SwapIo(Errno::Eio),
        _ => FaultError::OutOfMemory,
    }
}

fn swap_fault(errno: Errno) -> FaultError {
    match errno {
        Errno::Enomem | Errno::Enospc => FaultError::OutOfMemory,
        other => FaultError::SwapIo(other),
    }
}
