//! Per-process address spaces
//!
//! An address space is an ordered list of segments; each segment owns a
//! page table mapping virtual page numbers to page entries. A page entry
//! is either resident in a physical frame or parked in a swap slot, and
//! carries the dirty and reference bits the paging policy reads.
//!
//! Page entries are shared (`Arc`) between the segment's page table and
//! the coremap's owner back-links; the coremap side holds a `Weak` so the
//! reference cycle the two back-pointers would otherwise form is broken.

use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use spin::Mutex as SpinMutex;

use super::{
    coremap::Coremap, swap::SwapManager, tlb::Tlb, PhysicalAddress, SegmentPerms, VirtualAddress,
    USERHEAPSTART, USERSTACK, USERSTACKBASE, USERSTACKSIZE, USER_SPACE_TOP,
};
use crate::{error::Errno, sync::Mutex};

/// Where a page's contents currently live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageResidency {
    /// Backed by the physical frame at this address.
    InMemory(PhysicalAddress),
    /// Parked in this swap slot; the slot's bitmap bit is set.
    OnDisk(u32),
}

#[derive(Debug)]
struct PageLocation {
    residency: PageResidency,
    dirty: bool,
}

/// One virtual page of a segment.
#[derive(Debug)]
pub struct PageEntry {
    vpn: VirtualAddress,
    location: SpinMutex<PageLocation>,
    /// Reference bit for the eviction clock.
    lru_used: AtomicBool,
    /// Serializes swap transitions on this page. Held across swap I/O, so
    /// it is a blocking lock, never a spinlock.
    busy: Mutex,
}

impl PageEntry {
    pub(crate) fn new_resident(
        vpn: VirtualAddress,
        paddr: PhysicalAddress,
        dirty: bool,
    ) -> Arc<PageEntry> {
        assert!(vpn.is_page_aligned(), "page entry with unaligned vpn");
        Arc::new(PageEntry {
            vpn,
            location: SpinMutex::new(PageLocation {
                residency: PageResidency::InMemory(paddr),
                dirty,
            }),
            lru_used: AtomicBool::new(false),
            busy: Mutex::new(),
        })
    }

    pub fn vpn(&self) -> VirtualAddress {
        self.vpn
    }

    pub fn residency(&self) -> PageResidency {
        self.location.lock().residency
    }

    pub fn resident_paddr(&self) -> Option<PhysicalAddress> {
        match self.residency() {
            PageResidency::InMemory(paddr) => Some(paddr),
            PageResidency::OnDisk(_) => None,
        }
    }

    pub fn disk_slot(&self) -> Option<u32> {
        match self.residency() {
            PageResidency::InMemory(_) => None,
            PageResidency::OnDisk(slot) => Some(slot),
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.location.lock().dirty
    }

    pub(crate) fn mark_dirty(&self) {
        self.location.lock().dirty = true;
    }

    /// Publish the in-memory -> on-disk transition. Done before the swap
    /// write so concurrent lookups already see the page as gone.
    pub(crate) fn set_on_disk(&self, slot: u32) {
        let mut location = self.location.lock();
        assert!(
            matches!(location.residency, PageResidency::InMemory(_)),
            "swap-out of a page that is not resident"
        );
        location.residency = PageResidency::OnDisk(slot);
    }

    pub(crate) fn set_in_memory(&self, paddr: PhysicalAddress) {
        self.location.lock().residency = PageResidency::InMemory(paddr);
    }

    /// Set the clock reference bit (page was touched).
    pub fn mark_used(&self) {
        self.lru_used.store(true, Ordering::Relaxed);
    }

    /// Read and clear the clock reference bit.
    pub(crate) fn test_and_clear_used(&self) -> bool {
        self.lru_used.swap(false, Ordering::Relaxed)
    }

    /// The swap-transition lock for this page.
    pub fn busy(&self) -> &Mutex {
        &self.busy
    }
}

/// A contiguous virtual-address range with uniform permissions.
#[derive(Debug)]
pub struct Segment {
    start: VirtualAddress,
    /// Bytes; heap segments grow and shrink through `sbrk`.
    size: AtomicUsize,
    perms: SegmentPerms,
    is_heap: bool,
    pages: SpinMutex<BTreeMap<u64, Arc<PageEntry>>>,
}

impl Segment {
    fn new(start: VirtualAddress, size: usize, perms: SegmentPerms, is_heap: bool) -> Arc<Segment> {
        Arc::new(Segment {
            start,
            size: AtomicUsize::new(size),
            perms,
            is_heap,
            pages: SpinMutex::new(BTreeMap::new()),
        })
    }

    pub fn start(&self) -> VirtualAddress {
        self.start
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// One past the last valid address.
    pub fn end(&self) -> VirtualAddress {
        self.start.add(self.size() as u64)
    }

    pub fn perms(&self) -> SegmentPerms {
        self.perms
    }

    pub fn is_heap(&self) -> bool {
        self.is_heap
    }

    pub fn contains(&self, vaddr: VirtualAddress) -> bool {
        vaddr >= self.start && vaddr.as_u64() < self.start.as_u64() + self.size() as u64
    }

    /// Adjust the segment length (heap only; serialized by the process's
    /// sbrk lock).
    pub(crate) fn set_size(&self, size: usize) {
        self.size.store(size, Ordering::Release);
    }

    pub fn lookup_page(&self, vpn: VirtualAddress) -> Option<Arc<PageEntry>> {
        self.pages.lock().get(&vpn.as_u64()).cloned()
    }

    pub(crate) fn insert_page(&self, page: Arc<PageEntry>) {
        let prior = self.pages.lock().insert(page.vpn().as_u64(), page);
        assert!(prior.is_none(), "page table slot inserted twice");
    }

    /// Insert unless another thread got there first; returns the winning
    /// entry either way.
    pub(crate) fn insert_page_if_absent(
        &self,
        page: Arc<PageEntry>,
    ) -> Result<Arc<PageEntry>, Arc<PageEntry>> {
        let mut pages = self.pages.lock();
        match pages.get(&page.vpn().as_u64()) {
            Some(existing) => Err(existing.clone()),
            None => {
                pages.insert(page.vpn().as_u64(), page.clone());
                Ok(page)
            }
        }
    }

    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }

    pub(crate) fn pages_snapshot(&self) -> Vec<Arc<PageEntry>> {
        self.pages.lock().values().cloned().collect()
    }

    pub(crate) fn take_all_pages(&self) -> Vec<Arc<PageEntry>> {
        let mut pages = self.pages.lock();
        let taken = core::mem::take(&mut *pages);
        taken.into_values().collect()
    }

    /// Remove and return every page whose vpn is at or above `vaddr`
    /// (heap shrink).
    pub(crate) fn remove_pages_from(&self, vaddr: VirtualAddress) -> Vec<Arc<PageEntry>> {
        let mut pages = self.pages.lock();
        let tail = pages.split_off(&vaddr.as_u64());
        tail.into_values().collect()
    }
}

/// A process's virtual memory: an ordered collection of segments.
pub struct AddressSpace {
    segments: SpinMutex<Vec<Arc<Segment>>>,
}

impl AddressSpace {
    /// Create an address space. User processes get a zero-length heap
    /// segment at `USERHEAPSTART`; the copy path creates without one and
    /// clones the source's heap instead.
    pub fn new(with_heap: bool) -> Arc<AddressSpace> {
        let aspace = Arc::new(AddressSpace {
            segments: SpinMutex::new(Vec::new()),
        });
        if with_heap {
            let heap = Segment::new(
                VirtualAddress::new(USERHEAPSTART),
                0,
                SegmentPerms::rw(),
                true,
            );
            aspace.segments.lock().push(heap);
        }
        aspace
    }

    /// Define a segment covering `[vaddr, vaddr + size)`.
    ///
    /// Rejected if an existing segment already contains `vaddr` or the
    /// range crosses into kernel space. The segment is non-resident until
    /// faulted.
    pub fn define_region(
        &self,
        vaddr: VirtualAddress,
        size: usize,
        perms: SegmentPerms,
    ) -> Result<Arc<Segment>, Errno> {
        if self.find_segment(vaddr).is_some() {
            return Err(Errno::Einval);
        }
        let end = vaddr.as_u64().checked_add(size as u64).ok_or(Errno::Einval)?;
        if end > USER_SPACE_TOP {
            return Err(Errno::Einval);
        }
        let segment = Segment::new(vaddr, size, perms, false);
        self.segments.lock().push(segment.clone());
        Ok(segment)
    }

    /// Define the fixed user stack segment and return the initial stack
    /// pointer (its top).
    pub fn define_stack(&self) -> Result<VirtualAddress, Errno> {
        self.define_region(
            VirtualAddress::new(USERSTACKBASE),
            USERSTACKSIZE,
            SegmentPerms::rw(),
        )?;
        Ok(VirtualAddress::new(USERSTACK))
    }

    /// Linear scan for the segment containing `vaddr`.
    pub fn find_segment(&self, vaddr: VirtualAddress) -> Option<Arc<Segment>> {
        self.segments
            .lock()
            .iter()
            .find(|segment| segment.contains(vaddr))
            .cloned()
    }

    /// The heap segment, if this address space has one.
    pub fn heap_segment(&self) -> Option<Arc<Segment>> {
        self.segments
            .lock()
            .iter()
            .find(|segment| segment.is_heap())
            .cloned()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.lock().len()
    }

    /// Total resident pages across all segments.
    pub fn resident_pages(&self) -> usize {
        let segments: Vec<Arc<Segment>> = self.segments.lock().clone();
        segments
            .iter()
            .flat_map(|segment| segment.pages_snapshot())
            .filter(|page| page.resident_paddr().is_some())
            .count()
    }

    /// Deep-copy every segment for `fork`: same bounds and permissions, a
    /// fresh physical frame per page, contents copied eagerly. A source
    /// page parked on disk is brought in first; swap slots are never
    /// shared between address spaces.
    pub fn copy(
        &self,
        coremap: &Coremap,
        swap: &SwapManager,
        tlb: &Tlb,
    ) -> Result<Arc<AddressSpace>, Errno> {
        let new_aspace = AddressSpace::new(false);
        let segments: Vec<Arc<Segment>> = self.segments.lock().clone();

        for segment in segments {
            let new_segment = Segment::new(
                segment.start(),
                segment.size(),
                segment.perms(),
                segment.is_heap(),
            );
            // Push before copying pages so an error path can tear the
            // partial copy down uniformly.
            new_aspace.segments.lock().push(new_segment.clone());

            for old_page in segment.pages_snapshot() {
                if let Err(errno) =
                    copy_page(&old_page, &segment, &new_segment, coremap, swap, tlb)
                {
                    new_aspace.destroy(coremap, swap, tlb);
                    return Err(errno);
                }
            }
        }
        Ok(new_aspace)
    }

    /// Free every page (frame or swap slot), every segment, and leave the
    /// address space empty. Explicit rather than `Drop`: teardown needs
    /// the coremap, swap, and TLB collaborators.
    pub fn destroy(&self, coremap: &Coremap, swap: &SwapManager, tlb: &Tlb) {
        let segments: Vec<Arc<Segment>> = {
            let mut segments = self.segments.lock();
            core::mem::take(&mut *segments)
        };
        for segment in segments {
            for page in segment.take_all_pages() {
                release_page(&page, coremap, swap, tlb);
            }
        }
    }

    /// Make this the translated address space: every TLB entry is
    /// invalidated so subsequent faults repopulate from these page tables.
    pub fn activate(&self, tlb: &Tlb) {
        tlb.invalidate_all();
    }

    /// Counterpart of [`AddressSpace::activate`] when a thread stops
    /// running in this address space. Nothing to do: the next `activate`
    /// flushes unconditionally.
    pub fn deactivate(&self) {}
}

/// Free one page's backing store. Used by teardown and heap shrink.
pub(crate) fn release_page(page: &Arc<PageEntry>, coremap: &Coremap, swap: &SwapManager, tlb: &Tlb) {
    page.busy().acquire();
    match page.residency() {
        PageResidency::InMemory(paddr) => {
            tlb.invalidate_frame(paddr);
            coremap.free_frames(paddr);
        }
        PageResidency::OnDisk(slot) => {
            swap.release_slot(slot);
        }
    }
    page.busy().release();
}

fn copy_page(
    old_page: &Arc<PageEntry>,
    segment: &Arc<Segment>,
    new_segment: &Arc<Segment>,
    coremap: &Coremap,
    swap: &SwapManager,
    tlb: &Tlb,
) -> Result<(), Errno> {
    old_page.busy().acquire();
    let copied = (|| {
        if old_page.disk_slot().is_some() {
            // Simplest correct policy: bring the source in, then copy.
            swap.swap_in(old_page, coremap, tlb)?;
        }
        let src = old_page
            .resident_paddr()
            .expect("source page resident after swap-in");
        let dst = swap.get_user_frame(coremap, tlb, Some(old_page))?;
        coremap.copy_frame(src, dst);
        Ok(dst)
    })();
    old_page.busy().release();

    let dst = copied?;
    let dirty = segment.perms().contains(SegmentPerms::WRITE);
    let new_page = PageEntry::new_resident(old_page.vpn(), dst, dirty);
    coremap.set_owner(dst, &new_page);
    new_segment.insert_page(new_page);
    Ok(())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::{swap::SwapManager, FrameKind, PAGE_SIZE};

    fn fixture() -> (Coremap, SwapManager, Tlb) {
        let coremap = Coremap::bootstrap(
            PhysicalAddress::new(0x0100_0000),
            PhysicalAddress::new(0x0110_0000),
        );
        (coremap, SwapManager::disabled(), Tlb::new())
    }

    fn fault_in_page(
        aspace: &Arc<AddressSpace>,
        coremap: &Coremap,
        vaddr: VirtualAddress,
        fill: u8,
    ) -> Arc<PageEntry> {
        let segment = aspace
            .find_segment(vaddr)
            .expect("address should fall in a segment");
        let paddr = coremap
            .get_frames(1, FrameKind::User)
            .expect("test coremap should have frames");
        coremap.with_frame(paddr, |frame| frame.fill(fill));
        let page = PageEntry::new_resident(vaddr.page_align_down(), paddr, true);
        coremap.set_owner(paddr, &page);
        segment.insert_page(page.clone());
        page
    }

    #[test]
    fn heap_segment_created_on_demand() {
        let with_heap = AddressSpace::new(true);
        let heap = with_heap.heap_segment().expect("user aspace gets a heap");
        assert_eq!(heap.start().as_u64(), USERHEAPSTART);
        assert_eq!(heap.size(), 0);
        assert!(heap.is_heap());

        let without = AddressSpace::new(false);
        assert!(without.heap_segment().is_none());
    }

    #[test]
    fn define_region_rejects_overlap_and_kernel_range() {
        let aspace = AddressSpace::new(true);
        aspace
            .define_region(
                VirtualAddress::new(0x1000_0000),
                4 * PAGE_SIZE,
                SegmentPerms::READ | SegmentPerms::EXEC,
            )
            .expect("disjoint region should be accepted");

        // Overlapping start address is refused.
        let clash = aspace.define_region(
            VirtualAddress::new(0x1000_1000),
            PAGE_SIZE,
            SegmentPerms::rw(),
        );
        assert_eq!(clash.unwrap_err(), Errno::Einval);

        // A range crossing the user/kernel split is refused.
        let high = aspace.define_region(
            VirtualAddress::new(USER_SPACE_TOP - PAGE_SIZE as u64),
            2 * PAGE_SIZE,
            SegmentPerms::rw(),
        );
        assert_eq!(high.unwrap_err(), Errno::Einval);
    }

    #[test]
    fn define_stack_yields_top_of_stack() {
        let aspace = AddressSpace::new(true);
        let sp = aspace.define_stack().expect("stack definition should work");
        assert_eq!(sp.as_u64(), USERSTACK);
        let segment = aspace
            .find_segment(VirtualAddress::new(USERSTACKBASE))
            .expect("stack base should be mapped");
        assert_eq!(segment.size(), USERSTACKSIZE);
        assert!(segment.perms().contains(SegmentPerms::WRITE));
        assert!(!segment.perms().contains(SegmentPerms::EXEC));
    }

    #[test]
    fn find_segment_is_range_exact() {
        let aspace = AddressSpace::new(false);
        aspace
            .define_region(VirtualAddress::new(0x1000_0000), PAGE_SIZE, SegmentPerms::rw())
            .expect("region should be accepted");
        assert!(aspace.find_segment(VirtualAddress::new(0x1000_0000)).is_some());
        assert!(aspace.find_segment(VirtualAddress::new(0x1000_0FFF)).is_some());
        assert!(aspace.find_segment(VirtualAddress::new(0x1000_1000)).is_none());
        assert!(aspace.find_segment(VirtualAddress::new(0x0FFF_F000)).is_none());
    }

    #[test]
    fn copy_is_eager_and_independent() {
        let (coremap, swap, tlb) = fixture();
        let parent = AddressSpace::new(true);
        parent
            .define_region(VirtualAddress::new(0x1000_0000), PAGE_SIZE, SegmentPerms::rw())
            .expect("region should be accepted");
        let parent_page = fault_in_page(
            &parent,
            &coremap,
            VirtualAddress::new(0x1000_0000),
            0x5A,
        );

        let child = parent
            .copy(&coremap, &swap, &tlb)
            .expect("copy should succeed with free frames");
        assert_eq!(child.segment_count(), parent.segment_count());
        let child_segment = child
            .find_segment(VirtualAddress::new(0x1000_0000))
            .expect("copied segment should exist");
        let child_page = child_segment
            .lookup_page(VirtualAddress::new(0x1000_0000))
            .expect("copied page should exist");

        let parent_pa = parent_page.resident_paddr().expect("parent resident");
        let child_pa = child_page.resident_paddr().expect("child resident");
        assert_ne!(parent_pa, child_pa, "copy must not share frames");

        // Same contents now; diverge after a write to the parent frame.
        coremap.with_frame(child_pa, |frame| assert!(frame.iter().all(|&b| b == 0x5A)));
        coremap.with_frame(parent_pa, |frame| frame.fill(0xA5));
        coremap.with_frame(child_pa, |frame| assert!(frame.iter().all(|&b| b == 0x5A)));

        // Heap flag survives the copy.
        assert!(child.heap_segment().is_some());

        child.destroy(&coremap, &swap, &tlb);
        parent.destroy(&coremap, &swap, &tlb);
        assert_eq!(coremap.used_bytes(), 0);
    }

    #[test]
    fn destroy_returns_every_frame() {
        let (coremap, swap, tlb) = fixture();
        let aspace = AddressSpace::new(true);
        aspace
            .define_region(
                VirtualAddress::new(0x1000_0000),
                8 * PAGE_SIZE,
                SegmentPerms::rw(),
            )
            .expect("region should be accepted");
        for i in 0..8u64 {
            fault_in_page(
                &aspace,
                &coremap,
                VirtualAddress::new(0x1000_0000 + i * PAGE_SIZE as u64),
                i as u8,
            );
        }
        assert_eq!(coremap.used_bytes(), 8 * PAGE_SIZE);
        aspace.destroy(&coremap, &swap, &tlb);
        assert_eq!(coremap.used_bytes(), 0);
        assert_eq!(aspace.segment_count(), 0);
    }
}
