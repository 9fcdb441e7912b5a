//! Physical frame allocator (coremap)
//!
//! All post-boot physical RAM is managed as fixed-size frames by a single
//! coremap: one metadata entry per frame plus the frame contents
//! themselves. Boot sizing reserves room for the coremap array at the
//! start of the managed range and hands out whatever whole frames fit
//! after it.
//!
//! Frame metadata lives under one spinlock; frame *contents* are locked
//! per frame so that page copies and swap I/O never hold the coremap lock.

use alloc::{
    boxed::Box,
    sync::{Arc, Weak},
    vec::Vec,
};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use spin::Mutex as SpinMutex;

use super::{addrspace::PageEntry, PhysicalAddress, PAGE_SIZE};

/// State of one physical frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Not allocated.
    Free,
    /// Owned by the kernel (possibly part of a multi-frame block).
    Kernel,
    /// Backs one user page; `owner` points at the page entry.
    User,
}

/// Kind requested from [`Coremap::get_frames`]. `Free` is a state, never a
/// request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Kernel,
    User,
}

/// Coremap entry for one frame.
struct Frame {
    state: FrameState,
    /// Number of frames in the block, recorded only on the block's first
    /// frame; 0 on interior frames and on single free frames.
    block_size: u32,
    /// Back-reference to the owning page entry, User frames only.
    owner: Option<Weak<PageEntry>>,
}

impl Frame {
    const fn free() -> Self {
        Self {
            state: FrameState::Free,
            block_size: 0,
            owner: None,
        }
    }
}

/// The frame allocator.
pub struct Coremap {
    entries: SpinMutex<Vec<Frame>>,
    /// Frame contents, locked individually.
    data: Vec<SpinMutex<Box<[u8; PAGE_SIZE]>>>,
    /// Physical address of the first managed frame.
    page_base: PhysicalAddress,
    pages: usize,
    /// Clock hand for the eviction sweep.
    clock_hand: AtomicUsize,
    /// Set by `vm_bootstrap`; before this only the boot thread allocates.
    booted: AtomicBool,
}

/// Bytes consumed by `pages` frames plus their coremap array, the array
/// padded out to a page boundary.
fn managed_span(pages: usize) -> u64 {
    let map_bytes = pages * core::mem::size_of::<Frame>();
    let padding = PAGE_SIZE - (map_bytes % PAGE_SIZE);
    (map_bytes + padding + pages * PAGE_SIZE) as u64
}

impl Coremap {
    /// Size and build the coremap for the physical range
    /// `[first_free, last_addr)`.
    ///
    /// Solves for the largest `pages` such that the coremap array (padded
    /// to a page boundary) plus `pages` whole frames fit in the range. All
    /// frames start `Free`.
    pub fn bootstrap(first_free: PhysicalAddress, last_addr: PhysicalAddress) -> Coremap {
        assert!(
            last_addr > first_free,
            "coremap bootstrap with an empty physical range"
        );
        let addr_range = last_addr.as_u64() - first_free.as_u64();

        // Walk up until one more page no longer fits, then step back.
        let mut pages: usize = 1;
        while addr_range > managed_span(pages) {
            pages += 1;
        }
        pages -= 1;
        assert!(pages != 0, "physical range too small for a single frame");

        let map_bytes = pages * core::mem::size_of::<Frame>();
        let padding = PAGE_SIZE - (map_bytes % PAGE_SIZE);
        let page_base = first_free.offset((map_bytes + padding) as u64);

        let mut entries = Vec::with_capacity(pages);
        let mut data = Vec::with_capacity(pages);
        for _ in 0..pages {
            entries.push(Frame::free());
            data.push(SpinMutex::new(Box::new([0u8; PAGE_SIZE])));
        }

        log::info!(
            "coremap: managing {} frames at {:#x}",
            pages,
            page_base.as_u64()
        );

        Coremap {
            entries: SpinMutex::new(entries),
            data,
            page_base,
            pages,
            clock_hand: AtomicUsize::new(0),
            booted: AtomicBool::new(false),
        }
    }

    /// Number of managed frames.
    pub fn frame_count(&self) -> usize {
        self.pages
    }

    /// Physical address of the first managed frame.
    pub fn base(&self) -> PhysicalAddress {
        self.page_base
    }

    /// Mark the VM system live. Before this the boot thread is the only
    /// allocator, so the coremap lock is uncontended by construction.
    pub fn set_booted(&self) {
        self.booted.store(true, Ordering::Release);
    }

    pub fn is_booted(&self) -> bool {
        self.booted.load(Ordering::Acquire)
    }

    fn index_of(&self, paddr: PhysicalAddress) -> usize {
        assert!(paddr.is_page_aligned(), "unaligned frame address");
        assert!(
            paddr >= self.page_base,
            "frame address below the managed range"
        );
        let index = ((paddr.as_u64() - self.page_base.as_u64()) / PAGE_SIZE as u64) as usize;
        assert!(index < self.pages, "frame address above the managed range");
        index
    }

    fn paddr_of(&self, index: usize) -> PhysicalAddress {
        self.page_base.offset((index * PAGE_SIZE) as u64)
    }

    /// Allocate `npages` contiguous frames of the given kind by first-fit
    /// scan. Frames are zero-filled. Returns `None` when no free run of
    /// that length exists; the caller decides whether to evict (only ever
    /// for single-frame user requests).
    pub fn get_frames(&self, npages: usize, kind: FrameKind) -> Option<PhysicalAddress> {
        assert!(npages > 0, "zero-length frame request");
        let first = {
            let mut entries = self.entries.lock();
            let mut run = 0usize;
            let mut found = None;
            for i in 0..entries.len() {
                if entries[i].state == FrameState::Free {
                    run += 1;
                    if run == npages {
                        found = Some(i + 1 - npages);
                        break;
                    }
                } else {
                    run = 0;
                }
            }
            let first = found?;
            let state = match kind {
                FrameKind::Kernel => FrameState::Kernel,
                FrameKind::User => FrameState::User,
            };
            for entry in entries[first..first + npages].iter_mut() {
                entry.state = state;
                entry.block_size = 0;
                entry.owner = None;
            }
            entries[first].block_size = npages as u32;
            first
        };

        // The frames are ours now; zero them without the coremap lock.
        for i in first..first + npages {
            self.data[i].lock().fill(0);
        }
        Some(self.paddr_of(first))
    }

    /// Release the block starting at `paddr`.
    ///
    /// Releasing a frame that is free or the interior of a block is a
    /// kernel bug.
    pub fn free_frames(&self, paddr: PhysicalAddress) {
        let index = self.index_of(paddr);
        let mut entries = self.entries.lock();
        assert!(
            entries[index].state != FrameState::Free,
            "freeing a frame that is already free"
        );
        let block = entries[index].block_size as usize;
        assert!(block > 0, "freeing the interior of a multi-frame block");
        for entry in entries[index..index + block].iter_mut() {
            entry.state = FrameState::Free;
            entry.block_size = 0;
            entry.owner = None;
        }
    }

    /// Back-link a user frame to its page entry. Required before the frame
    /// can be considered for eviction.
    pub fn set_owner(&self, paddr: PhysicalAddress, owner: &Arc<PageEntry>) {
        let index = self.index_of(paddr);
        let mut entries = self.entries.lock();
        assert!(
            entries[index].state == FrameState::User,
            "owner back-link on a non-user frame"
        );
        entries[index].owner = Some(Arc::downgrade(owner));
    }

    /// Bytes currently allocated. A snapshot: concurrent allocation can
    /// change the value as soon as it is returned.
    pub fn used_bytes(&self) -> usize {
        let entries = self.entries.lock();
        entries
            .iter()
            .filter(|frame| frame.state != FrameState::Free)
            .count()
            * PAGE_SIZE
    }

    /// Allocate kernel heap pages. Veneer used by the tiny-object
    /// allocator above this one.
    pub fn alloc_kpages(&self, npages: usize) -> Option<PhysicalAddress> {
        self.get_frames(npages, FrameKind::Kernel)
    }

    /// Release kernel heap pages.
    pub fn free_kpages(&self, paddr: PhysicalAddress) {
        self.free_frames(paddr);
    }

    /// Run `f` over the contents of the frame at `paddr`.
    ///
    /// Holds only that frame's lock, so this is safe around swap I/O done
    /// into a bounce buffer but must not recurse into the same frame.
    pub fn with_frame<R>(&self, paddr: PhysicalAddress, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let index = self.index_of(paddr);
        let mut page = self.data[index].lock();
        f(&mut page[..])
    }

    /// Copy one frame's contents into another.
    pub fn copy_frame(&self, src: PhysicalAddress, dst: PhysicalAddress) {
        let src_index = self.index_of(src);
        let dst_index = self.index_of(dst);
        assert!(src_index != dst_index, "frame copied onto itself");
        // Lock in index order; copies from independent call sites cannot
        // deadlock.
        if src_index < dst_index {
            let src_page = self.data[src_index].lock();
            let mut dst_page = self.data[dst_index].lock();
            dst_page.copy_from_slice(&src_page[..]);
        } else {
            let mut dst_page = self.data[dst_index].lock();
            let src_page = self.data[src_index].lock();
            dst_page.copy_from_slice(&src_page[..]);
        }
    }

    /// Pick an eviction victim: clock sweep over user frames, clearing
    /// reference bits; after a full rotation with every page referenced,
    /// fall back to the first candidate seen. Kernel frames, unowned
    /// frames, and `skip` (the page being faulted on) are never chosen.
    pub fn find_victim(&self, skip: Option<&Arc<PageEntry>>) -> Option<Arc<PageEntry>> {
        let entries = self.entries.lock();
        let len = entries.len();
        if len == 0 {
            return None;
        }
        let start = self.clock_hand.load(Ordering::Relaxed) % len;
        let mut fallback: Option<(usize, Arc<PageEntry>)> = None;

        for step in 0..len {
            let i = (start + step) % len;
            if entries[i].state != FrameState::User {
                continue;
            }
            let Some(weak) = entries[i].owner.as_ref() else {
                continue;
            };
            let Some(page) = weak.upgrade() else {
                continue;
            };
            if let Some(skip_page) = skip {
                if Arc::ptr_eq(&page, skip_page) {
                    continue;
                }
            }
            if page.test_and_clear_used() {
                // Recently referenced: second chance.
                if fallback.is_none() {
                    fallback = Some((i, page));
                }
                continue;
            }
            self.clock_hand.store((i + 1) % len, Ordering::Relaxed);
            return Some(page);
        }

        // Everyone had the reference bit set; take the first candidate.
        fallback.map(|(i, page)| {
            self.clock_hand.store((i + 1) % len, Ordering::Relaxed);
            page
        })
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::VirtualAddress;

    fn small_coremap() -> Coremap {
        // 1 MiB of managed range starting at 16 MiB.
        Coremap::bootstrap(
            PhysicalAddress::new(0x0100_0000),
            PhysicalAddress::new(0x0110_0000),
        )
    }

    #[test]
    fn bootstrap_reserves_room_for_the_map() {
        let cm = small_coremap();
        // The sizing inequality must hold for the chosen count but fail
        // for one more page.
        let range = 0x0110_0000u64 - 0x0100_0000u64;
        assert!(managed_span(cm.frame_count()) <= range);
        assert!(managed_span(cm.frame_count() + 1) > range);
        assert_eq!(cm.used_bytes(), 0);
        assert!(cm.base() > PhysicalAddress::new(0x0100_0000));
        assert!(cm.base().is_page_aligned());
    }

    #[test]
    fn first_fit_is_contiguous_and_accounted() {
        let cm = small_coremap();
        let a = cm
            .get_frames(1, FrameKind::Kernel)
            .expect("fresh coremap should satisfy a single frame");
        let b = cm
            .get_frames(3, FrameKind::Kernel)
            .expect("fresh coremap should satisfy a 3-frame block");
        assert_eq!(b.as_u64(), a.as_u64() + PAGE_SIZE as u64);
        assert_eq!(cm.used_bytes(), 4 * PAGE_SIZE);

        cm.free_frames(b);
        assert_eq!(cm.used_bytes(), PAGE_SIZE);
        // The freed run is found again by first-fit.
        let c = cm
            .get_frames(2, FrameKind::Kernel)
            .expect("re-allocation from the freed run should succeed");
        assert_eq!(c, b);
        cm.free_frames(c);
        cm.free_frames(a);
        assert_eq!(cm.used_bytes(), 0);
    }

    #[test]
    fn multi_frame_request_fails_without_a_run() {
        let cm = small_coremap();
        let total = cm.frame_count();
        // Checkerboard the map so no two free frames are adjacent.
        let mut held = alloc::vec::Vec::new();
        for _ in 0..total {
            match cm.get_frames(1, FrameKind::Kernel) {
                Some(pa) => held.push(pa),
                None => break,
            }
        }
        for pa in held.iter().step_by(2) {
            cm.free_frames(*pa);
        }
        // Every free frame is isolated: a 2-frame request must fail, and
        // no eviction is attempted for multi-frame requests.
        assert!(cm.get_frames(2, FrameKind::Kernel).is_none());
        // Single frames still succeed.
        assert!(cm.get_frames(1, FrameKind::Kernel).is_some());
    }

    #[test]
    fn frames_are_zeroed_on_allocation() {
        let cm = small_coremap();
        let pa = cm
            .get_frames(1, FrameKind::Kernel)
            .expect("allocation should succeed");
        cm.with_frame(pa, |frame| frame.fill(0xAB));
        cm.free_frames(pa);
        let pb = cm
            .get_frames(1, FrameKind::Kernel)
            .expect("re-allocation should succeed");
        assert_eq!(pa, pb);
        cm.with_frame(pb, |frame| {
            assert!(frame.iter().all(|&b| b == 0), "stale bytes after realloc");
        });
    }

    #[test]
    #[should_panic(expected = "interior of a multi-frame block")]
    fn interior_free_asserts() {
        let cm = small_coremap();
        let pa = cm
            .get_frames(3, FrameKind::Kernel)
            .expect("3-frame block should fit");
        cm.free_frames(pa.offset(PAGE_SIZE as u64));
    }

    #[test]
    #[should_panic(expected = "already free")]
    fn double_free_asserts() {
        let cm = small_coremap();
        let pa = cm
            .get_frames(1, FrameKind::Kernel)
            .expect("allocation should succeed");
        cm.free_frames(pa);
        cm.free_frames(pa);
    }

    #[test]
    fn owner_backlink_round_trips_through_victim_scan() {
        let cm = small_coremap();
        let pa = cm
            .get_frames(1, FrameKind::User)
            .expect("user frame should be available");
        let pe = PageEntry::new_resident(VirtualAddress::new(0x4000_0000), pa, false);
        cm.set_owner(pa, &pe);

        // lru_used is clear, so the clock picks this page immediately.
        let victim = cm
            .find_victim(None)
            .expect("the only user frame should be the victim");
        assert!(Arc::ptr_eq(&victim, &pe));

        // With the page marked used, a single-candidate sweep falls back
        // to it after clearing the bit.
        pe.mark_used();
        let victim = cm
            .find_victim(None)
            .expect("fallback should still yield the only candidate");
        assert!(Arc::ptr_eq(&victim, &pe));

        // Skipping the page leaves nothing to evict.
        assert!(cm.find_victim(Some(&pe)).is_none());
    }

    #[test]
    fn kpage_veneer_matches_frame_calls() {
        let cm = small_coremap();
        let pa = cm.alloc_kpages(2).expect("kernel block should fit");
        assert_eq!(cm.used_bytes(), 2 * PAGE_SIZE);
        cm.free_kpages(pa);
        assert_eq!(cm.used_bytes(), 0);
    }
}
