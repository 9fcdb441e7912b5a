//! File handles and the per-process file table
//!
//! A file handle is the shared kernel object behind one or more file
//! descriptors: the vnode, the open mode, the seek position, a reference
//! count, and a blocking lock that serializes I/O and position updates.
//! `dup2` and `fork` share handles by bumping the count; the handle dies
//! when the count reaches zero.

use alloc::sync::Arc;

use spin::Mutex as SpinMutex;

use super::{FileSystem, OpenFlags, Vnode, CONSOLE_PATH, OPEN_MAX};
use crate::{error::Errno, sync::Mutex};

/// Shared kernel object representing an open file.
pub struct FileHandle {
    vnode: Arc<dyn Vnode>,
    flags: OpenFlags,
    /// Serializes reads, writes, and seeks on this handle. Held across
    /// VFS I/O, so it is a blocking lock.
    lock: Mutex,
    /// Seek offset; read and written with `lock` held.
    position: SpinMutex<u64>,
    /// Number of `(process, fd)` slots pointing at this handle.
    ref_count: SpinMutex<usize>,
}

impl FileHandle {
    pub fn new(vnode: Arc<dyn Vnode>, flags: OpenFlags) -> Arc<FileHandle> {
        Arc::new(FileHandle {
            vnode,
            flags,
            lock: Mutex::new(),
            position: SpinMutex::new(0),
            ref_count: SpinMutex::new(1),
        })
    }

    pub fn vnode(&self) -> &Arc<dyn Vnode> {
        &self.vnode
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    /// The handle's I/O lock.
    pub fn lock(&self) -> &Mutex {
        &self.lock
    }

    pub fn position(&self) -> u64 {
        *self.position.lock()
    }

    pub fn set_position(&self, position: u64) {
        *self.position.lock() = position;
    }

    /// Add a referencing descriptor (dup2, fork). Returns the new count.
    pub fn retain(&self) -> usize {
        let mut count = self.ref_count.lock();
        *count += 1;
        *count
    }

    /// Drop a referencing descriptor. Returns the remaining count; at zero
    /// the caller is the last user and the vnode closes when the handle
    /// drops.
    pub fn release(&self) -> usize {
        let mut count = self.ref_count.lock();
        assert!(*count > 0, "file handle released below zero");
        *count -= 1;
        *count
    }

    pub fn ref_count(&self) -> usize {
        *self.ref_count.lock()
    }
}

/// Per-process descriptor table: a bounded array of handle slots.
pub struct FileTable {
    slots: SpinMutex<[Option<Arc<FileHandle>>; OPEN_MAX]>,
}

impl FileTable {
    pub fn new() -> FileTable {
        FileTable {
            slots: SpinMutex::new([const { None }; OPEN_MAX]),
        }
    }

    /// The handle behind `fd`, if the descriptor is open.
    pub fn get(&self, fd: usize) -> Option<Arc<FileHandle>> {
        if fd >= OPEN_MAX {
            return None;
        }
        self.slots.lock()[fd].clone()
    }

    /// Replace the slot, returning the previous occupant.
    pub fn set(&self, fd: usize, handle: Option<Arc<FileHandle>>) -> Option<Arc<FileHandle>> {
        assert!(fd < OPEN_MAX, "descriptor out of table range");
        let mut slots = self.slots.lock();
        core::mem::replace(&mut slots[fd], handle)
    }

    /// Install `handle` in the smallest free descriptor at or above 3
    /// (0..2 are the standard descriptors).
    pub fn alloc_user_fd(&self, handle: Arc<FileHandle>) -> Result<usize, Errno> {
        let mut slots = self.slots.lock();
        for (fd, slot) in slots.iter_mut().enumerate().skip(3) {
            if slot.is_none() {
                *slot = Some(handle);
                return Ok(fd);
            }
        }
        Err(Errno::Emfile)
    }

    /// Open fds 0, 1, 2 against the console device: stdin read-only,
    /// stdout and stderr write-only. Unwinds everything on partial
    /// failure.
    pub fn init_std(&self, filesystem: &dyn FileSystem) -> Result<(), Errno> {
        for fd in 0..3 {
            let flags = if fd == 0 {
                OpenFlags::read_only()
            } else {
                OpenFlags::write_only()
            };
            match filesystem.open(CONSOLE_PATH, flags) {
                Ok(vnode) => {
                    self.set(fd, Some(FileHandle::new(vnode, flags)));
                }
                Err(errno) => {
                    for open_fd in 0..fd {
                        if let Some(handle) = self.set(open_fd, None) {
                            handle.release();
                        }
                    }
                    return Err(errno);
                }
            }
        }
        Ok(())
    }

    /// Duplicate this table into `target` for `fork`: the child's
    /// descriptors point at the same handles, each with its count bumped.
    pub fn clone_into(&self, target: &FileTable) {
        let parent_slots = self.slots.lock();
        let mut child_slots = target.slots.lock();
        for (fd, slot) in parent_slots.iter().enumerate() {
            if let Some(handle) = slot {
                assert!(child_slots[fd].is_none(), "fork into a non-empty table");
                handle.retain();
                child_slots[fd] = Some(handle.clone());
            }
        }
    }

    /// Duplicate the table for `fork`.
    pub fn clone_for_fork(&self) -> FileTable {
        let child = FileTable::new();
        self.clone_into(&child);
        child
    }

    /// Release every descriptor (process exit).
    pub fn close_all(&self) {
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            if let Some(handle) = slot.take() {
                handle.release();
            }
        }
    }

    pub fn open_count(&self) -> usize {
        self.slots.lock().iter().filter(|slot| slot.is_some()).count()
    }
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}
