//! Software-managed TLB cache
//!
//! The MMU raises a fault on every miss; the fault handler installs
//! translations here. Slots hold `(entryhi, entrylo)` pairs in the MIPS
//! style: the page-aligned virtual address, and the physical frame address
//! with the DIRTY and VALID bits in the low (page-offset) bits.
//!
//! The slot array lives under a spinlock, which models the
//! interrupts-disabled window the hardware requires while the TLB is
//! written.

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex as SpinMutex;

use super::{PhysicalAddress, VirtualAddress, PAGE_MASK};
use crate::arch::NUM_TLB;

/// Entry is live.
pub const TLBLO_VALID: u64 = 1 << 0;
/// Writes through this entry are permitted.
pub const TLBLO_DIRTY: u64 = 1 << 1;

#[derive(Debug, Clone, Copy)]
struct TlbEntry {
    hi: u64,
    lo: u64,
}

impl TlbEntry {
    const fn invalid() -> Self {
        Self { hi: 0, lo: 0 }
    }

    fn valid(&self) -> bool {
        self.lo & TLBLO_VALID != 0
    }

    fn frame(&self) -> u64 {
        self.lo & PAGE_MASK
    }
}

/// The translation cache.
pub struct Tlb {
    slots: SpinMutex<[TlbEntry; NUM_TLB]>,
    rng_state: AtomicU64,
}

impl Tlb {
    pub fn new() -> Self {
        Self {
            slots: SpinMutex::new([TlbEntry::invalid(); NUM_TLB]),
            rng_state: AtomicU64::new(0x9E37_79B9_7F4A_7C15),
        }
    }

    /// xorshift step for victim selection; quality does not matter, only
    /// that eviction is not systematically biased toward one slot.
    fn random(&self) -> u64 {
        let mut x = self.rng_state.load(Ordering::Relaxed);
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng_state.store(x, Ordering::Relaxed);
        x
    }

    /// Install a translation for the page containing `vaddr`.
    ///
    /// An existing entry for the same page is overwritten in place (two
    /// live entries for one page would be a machine check on real
    /// hardware). Otherwise the first invalid slot is used, and with all
    /// slots live a random victim is replaced.
    pub fn insert(&self, vaddr: VirtualAddress, paddr: PhysicalAddress, writable: bool) {
        let hi = vaddr.as_u64() & PAGE_MASK;
        let mut lo = (paddr.as_u64() & PAGE_MASK) | TLBLO_VALID;
        if writable {
            lo |= TLBLO_DIRTY;
        }
        let entry = TlbEntry { hi, lo };

        let mut slots = self.slots.lock();
        if let Some(slot) = slots.iter_mut().find(|slot| slot.valid() && slot.hi == hi) {
            *slot = entry;
            return;
        }
        if let Some(slot) = slots.iter_mut().find(|slot| !slot.valid()) {
            *slot = entry;
            return;
        }
        let victim = (self.random() % NUM_TLB as u64) as usize;
        slots[victim] = entry;
    }

    /// Invalidate every slot. Issued on address-space activation.
    pub fn invalidate_all(&self) {
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            *slot = TlbEntry::invalid();
        }
    }

    /// Drop any entry translating to the frame at `paddr`. Issued when a
    /// frame leaves memory (swap-out, heap shrink, teardown).
    pub fn invalidate_frame(&self, paddr: PhysicalAddress) {
        let frame = paddr.as_u64() & PAGE_MASK;
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            if slot.valid() && slot.frame() == frame {
                *slot = TlbEntry::invalid();
            }
        }
    }

    /// Look up the page containing `vaddr`. Returns the frame address and
    /// whether the entry permits writes. Test and diagnostic hook; real
    /// lookups happen in the MMU.
    pub fn probe(&self, vaddr: VirtualAddress) -> Option<(PhysicalAddress, bool)> {
        let hi = vaddr.as_u64() & PAGE_MASK;
        let slots = self.slots.lock();
        slots
            .iter()
            .find(|slot| slot.valid() && slot.hi == hi)
            .map(|slot| (PhysicalAddress::new(slot.frame()), slot.lo & TLBLO_DIRTY != 0))
    }

    /// Number of live slots.
    pub fn live_entries(&self) -> usize {
        self.slots.lock().iter().filter(|slot| slot.valid()).count()
    }
}

impl Default for Tlb {
    fn default() -> Self {
        Self::new()
    }
}
