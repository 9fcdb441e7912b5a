//! The process table
//!
//! A fixed array of `MAX_PROCS` slots; a process's pid is its slot index,
//! and the slot holds the process from creation until the parent reaps it
//! (or it tears itself down as an orphan). Pid allocation is
//! lowest-free-slot, so pids recycle after reaping.

use alloc::{sync::Arc, vec, vec::Vec};

use spin::Mutex as SpinMutex;

use super::{Process, ProcessId, MAX_PROCS};
use crate::error::Errno;

pub struct ProcessTable {
    slots: SpinMutex<Vec<Option<Arc<Process>>>>,
}

impl ProcessTable {
    pub fn new() -> ProcessTable {
        ProcessTable {
            slots: SpinMutex::new(vec![None; MAX_PROCS]),
        }
    }

    /// Create a process in the lowest free slot.
    pub fn spawn(&self, parent: Option<ProcessId>) -> Result<Arc<Process>, Errno> {
        let mut slots = self.slots.lock();
        for (index, slot) in slots.iter_mut().enumerate() {
            if slot.is_none() {
                let process = Process::new(ProcessId(index as u32), parent);
                *slot = Some(process.clone());
                return Ok(process);
            }
        }
        // Out of pids.
        Err(Errno::Enomem)
    }

    pub fn get(&self, pid: ProcessId) -> Option<Arc<Process>> {
        let slots = self.slots.lock();
        slots.get(pid.0 as usize)?.clone()
    }

    pub fn contains(&self, pid: ProcessId) -> bool {
        self.get(pid).is_some()
    }

    /// Free the slot. The process object lives on while anyone still
    /// holds an `Arc` to it.
    pub fn remove(&self, pid: ProcessId) -> Option<Arc<Process>> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(pid.0 as usize)?;
        let removed = slot.take();
        if let Some(process) = &removed {
            assert_eq!(process.pid, pid, "process table slot/pid mismatch");
        }
        removed
    }

    pub fn count(&self) -> usize {
        self.slots.lock().iter().filter(|slot| slot.is_some()).count()
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}
