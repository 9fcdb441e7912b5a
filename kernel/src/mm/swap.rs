//! Swap manager
//!
//! Owns the disk-backed swap area: a flat array of page-sized slots on a
//! byte-stream device, tracked by an in-memory bitmap (bit set = slot
//! holds a page). `swap_out` and `swap_in` move one page between a
//! physical frame and a slot; `get_user_frame` is the allocate-or-evict
//! loop the fault path and `fork` use under memory pressure.
//!
//! Callers serialize per-page transitions with the page's busy lock; the
//! bitmap has its own blocking lock; the device sees plain offset I/O.

use alloc::{sync::Arc, vec, vec::Vec};

use spin::Mutex as SpinMutex;

use super::{
    addrspace::PageEntry,
    coremap::{Coremap, FrameKind},
    tlb::Tlb,
    PhysicalAddress, PAGE_SIZE,
};
use crate::{error::Errno, fs::Vnode, sched, sync::Mutex};

/// Slot-usage bitmap.
struct Bitmap {
    words: Vec<u64>,
    nbits: usize,
}

impl Bitmap {
    fn new(nbits: usize) -> Self {
        Self {
            words: vec![0; nbits.div_ceil(64)],
            nbits,
        }
    }

    /// Find, set, and return the first clear bit.
    fn alloc_first_clear(&mut self) -> Option<usize> {
        for (word_index, word) in self.words.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = (!*word).trailing_zeros() as usize;
                let index = word_index * 64 + bit;
                if index >= self.nbits {
                    return None;
                }
                *word |= 1 << bit;
                return Some(index);
            }
        }
        None
    }

    fn clear(&mut self, index: usize) {
        assert!(index < self.nbits, "bitmap index out of range");
        let mask = 1u64 << (index % 64);
        assert!(
            self.words[index / 64] & mask != 0,
            "clearing a bit that is not set"
        );
        self.words[index / 64] &= !mask;
    }

    fn get(&self, index: usize) -> bool {
        index < self.nbits && self.words[index / 64] & (1 << (index % 64)) != 0
    }

    fn count_set(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }
}

/// The swap area and its paging engine.
pub struct SwapManager {
    device: Option<Arc<dyn Vnode>>,
    /// Serializes all bitmap access. The spinlock inside `slots` is only
    /// the interior-mutability container; every touch happens with this
    /// lock held.
    bitmap_lock: Mutex,
    slots: SpinMutex<Bitmap>,
}

impl SwapManager {
    /// Probe the swap device and size the slot bitmap. A missing,
    /// unreadable, or sub-page device disables swapping; the allocator
    /// then simply fails under pressure.
    pub fn bootstrap(device: Option<Arc<dyn Vnode>>) -> SwapManager {
        let (device, nslots) = match device {
            Some(device) => match device.stat() {
                Ok(stat) if stat.size >= PAGE_SIZE as u64 => {
                    let nslots = (stat.size / PAGE_SIZE as u64) as usize;
                    log::info!("swap: {} slots available", nslots);
                    (Some(device), nslots)
                }
                Ok(_) => {
                    log::warn!("swap: device smaller than one page, swapping disabled");
                    (None, 0)
                }
                Err(errno) => {
                    log::warn!("swap: device probe failed ({}), swapping disabled", errno);
                    (None, 0)
                }
            },
            None => (None, 0),
        };
        SwapManager {
            device,
            bitmap_lock: Mutex::new(),
            slots: SpinMutex::new(Bitmap::new(nslots)),
        }
    }

    /// A manager with no device; every eviction attempt fails.
    pub fn disabled() -> SwapManager {
        Self::bootstrap(None)
    }

    pub fn enabled(&self) -> bool {
        self.device.is_some()
    }

    pub fn total_slots(&self) -> usize {
        self.slots.lock().nbits
    }

    pub fn slots_in_use(&self) -> usize {
        self.slots.lock().count_set()
    }

    pub fn slot_in_use(&self, slot: u32) -> bool {
        self.slots.lock().get(slot as usize)
    }

    fn alloc_slot(&self) -> Result<u32, Errno> {
        self.bitmap_lock.acquire();
        let slot = self.slots.lock().alloc_first_clear();
        self.bitmap_lock.release();
        slot.map(|index| index as u32).ok_or(Errno::Enospc)
    }

    pub(crate) fn release_slot(&self, slot: u32) {
        self.bitmap_lock.acquire();
        self.slots.lock().clear(slot as usize);
        self.bitmap_lock.release();
    }

    /// Move a resident page out to disk and free its frame.
    ///
    /// Caller holds the page's busy lock. The residency transition is
    /// published before the device write so any concurrent lookup already
    /// sees the page as on disk.
    pub fn swap_out(&self, page: &Arc<PageEntry>, coremap: &Coremap, tlb: &Tlb) -> Result<(), Errno> {
        let device = self.device.as_ref().ok_or(Errno::Enospc)?;
        let paddr = page
            .resident_paddr()
            .expect("swap-out of a page that is not resident");
        let slot = self.alloc_slot()?;
        page.set_on_disk(slot);

        let mut buffer = vec![0u8; PAGE_SIZE];
        coremap.with_frame(paddr, |frame| buffer.copy_from_slice(frame));
        if let Err(errno) = write_fully(device.as_ref(), slot_offset(slot), &buffer) {
            // Abort the transition; the page stays resident.
            page.set_in_memory(paddr);
            self.release_slot(slot);
            return Err(errno);
        }

        coremap.with_frame(paddr, |frame| frame.fill(0));
        tlb.invalidate_frame(paddr);
        coremap.free_frames(paddr);
        log::trace!("swap: vpn {:#x} -> slot {}", page.vpn().as_u64(), slot);
        Ok(())
    }

    /// Bring an on-disk page back into a frame, evicting a victim if
    /// memory is tight.
    ///
    /// Caller holds the page's busy lock.
    pub fn swap_in(&self, page: &Arc<PageEntry>, coremap: &Coremap, tlb: &Tlb) -> Result<(), Errno> {
        let device = self.device.as_ref().ok_or(Errno::Enospc)?;
        let slot = page
            .disk_slot()
            .expect("swap-in of a page that is not on disk");
        assert!(self.slot_in_use(slot), "swap-in from a slot marked free");

        let paddr = self.get_user_frame(coremap, tlb, Some(page))?;
        let mut buffer = vec![0u8; PAGE_SIZE];
        if let Err(errno) = read_fully(device.as_ref(), slot_offset(slot), &mut buffer) {
            coremap.free_frames(paddr);
            return Err(errno);
        }
        coremap.with_frame(paddr, |frame| frame.copy_from_slice(&buffer));

        self.release_slot(slot);
        page.set_in_memory(paddr);
        coremap.set_owner(paddr, page);
        log::trace!("swap: slot {} -> vpn {:#x}", slot, page.vpn().as_u64());
        Ok(())
    }

    /// Allocate one user frame, evicting if none is free.
    ///
    /// `skip` is the page the caller is currently faulting on; it is never
    /// chosen as a victim. Victims whose busy lock is contended are left
    /// alone (their transition is already in flight) and the loop retries.
    /// Multi-frame requests never come through here: they fail outright in
    /// the coremap.
    pub fn get_user_frame(
        &self,
        coremap: &Coremap,
        tlb: &Tlb,
        skip: Option<&Arc<PageEntry>>,
    ) -> Result<PhysicalAddress, Errno> {
        let attempts = coremap.frame_count().max(8) * 2;
        for _ in 0..attempts {
            if let Some(paddr) = coremap.get_frames(1, FrameKind::User) {
                return Ok(paddr);
            }
            if !self.enabled() {
                return Err(Errno::Enomem);
            }
            let victim = coremap.find_victim(skip).ok_or(Errno::Enomem)?;
            if victim.busy().try_acquire() {
                // The page may have moved between selection and lock.
                let evicted = if victim.resident_paddr().is_some() {
                    self.swap_out(&victim, coremap, tlb)
                } else {
                    Ok(())
                };
                victim.busy().release();
                evicted?;
            } else {
                sched::yield_cpu();
            }
        }
        Err(Errno::Enomem)
    }
}

fn slot_offset(slot: u32) -> u64 {
    slot as u64 * PAGE_SIZE as u64
}

fn write_fully(device: &dyn Vnode, offset: u64, data: &[u8]) -> Result<(), Errno> {
    let mut done = 0usize;
    while done < data.len() {
        let written = device.write_at(offset + done as u64, &data[done..])?;
        if written == 0 {
            return Err(Errno::Eio);
        }
        done += written;
    }
    Ok(())
}

fn read_fully(device: &dyn Vnode, offset: u64, buf: &mut [u8]) -> Result<(), Errno> {
    let mut done = 0usize;
    while done < buf.len() {
        let read = device.read_at(offset + done as u64, &mut buf[done..])?;
        if read == 0 {
            return Err(Errno::Eio);
        }
        done += read;
    }
    Ok(())
}
