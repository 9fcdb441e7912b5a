//! Processes
//!
//! A process is a pid, an address space, a file table, a working
//! directory, and the exit-synchronization state its parent reaps through
//! `waitpid`. Processes live in the fixed-size [`ProcessTable`]; the pid
//! is the table slot index.

use alloc::{
    string::{String, ToString},
    sync::Arc,
};
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

use spin::Mutex as SpinMutex;

use crate::{
    fs::FileTable,
    mm::addrspace::AddressSpace,
    sync::{CondVar, Mutex},
};

pub mod loader;
pub mod table;

pub use loader::ProgramLoader;
pub use table::ProcessTable;

/// Size of the process table; pids live in `[0, MAX_PROCS)`.
pub const MAX_PROCS: usize = 64;

/// Upper bound on the total bytes of argument strings and pointers
/// `execv` accepts.
pub const ARG_MAX: usize = 65536;

/// Process identifier: the owning slot in the process table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u32);

impl core::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Encode an exit status word: normal exits shift the code up, fatal
/// (signal-style) exits set the low flag bit.
pub fn encode_exit_status(code: i32, fatal: bool) -> i32 {
    if fatal {
        (code << 2) | 1
    } else {
        code << 2
    }
}

/// Does an encoded status word represent a fatal (signal) exit?
pub fn status_is_fatal(status: i32) -> bool {
    status & 3 == 1
}

/// The code or signal number carried by an encoded status word.
pub fn status_code(status: i32) -> i32 {
    status >> 2
}

/// One process.
pub struct Process {
    pub pid: ProcessId,
    parent: SpinMutex<Option<ProcessId>>,
    aspace: SpinMutex<Option<Arc<AddressSpace>>>,
    /// Per-process descriptor table; handles inside are shared.
    pub files: FileTable,
    cwd: SpinMutex<String>,
    num_threads: AtomicUsize,
    /// Exit synchronization: the parent waits on `exit_cv` under
    /// `exit_lock` until `can_exit` flips.
    exit_lock: Mutex,
    exit_cv: CondVar,
    can_exit: AtomicBool,
    exit_code: AtomicI32,
    /// Serializes break adjustments on the heap segment.
    sbrk_lock: Mutex,
}

impl Process {
    pub(crate) fn new(pid: ProcessId, parent: Option<ProcessId>) -> Arc<Process> {
        Arc::new(Process {
            pid,
            parent: SpinMutex::new(parent),
            aspace: SpinMutex::new(None),
            files: FileTable::new(),
            cwd: SpinMutex::new("/".to_string()),
            num_threads: AtomicUsize::new(1),
            exit_lock: Mutex::new(),
            exit_cv: CondVar::new(),
            can_exit: AtomicBool::new(false),
            exit_code: AtomicI32::new(0),
            sbrk_lock: Mutex::new(),
        })
    }

    /// The parent's pid, `None` for a top-level process.
    pub fn parent_pid(&self) -> Option<ProcessId> {
        *self.parent.lock()
    }

    pub fn address_space(&self) -> Option<Arc<AddressSpace>> {
        self.aspace.lock().clone()
    }

    /// Install (or clear) the address space, returning the previous one
    /// so the caller can destroy it.
    pub fn set_address_space(
        &self,
        aspace: Option<Arc<AddressSpace>>,
    ) -> Option<Arc<AddressSpace>> {
        let mut slot = self.aspace.lock();
        core::mem::replace(&mut *slot, aspace)
    }

    pub fn cwd(&self) -> String {
        self.cwd.lock().clone()
    }

    pub fn set_cwd(&self, path: &str) {
        *self.cwd.lock() = path.to_string();
    }

    pub fn thread_count(&self) -> usize {
        self.num_threads.load(Ordering::Acquire)
    }

    pub(crate) fn thread_started(&self) {
        self.num_threads.fetch_add(1, Ordering::AcqRel);
    }

    pub fn exit_lock(&self) -> &Mutex {
        &self.exit_lock
    }

    pub fn exit_cv(&self) -> &CondVar {
        &self.exit_cv
    }

    /// Has this process called `exit`? Read under `exit_lock` when used
    /// for the wait protocol.
    pub fn has_exited(&self) -> bool {
        self.can_exit.load(Ordering::Acquire)
    }

    /// Record the encoded exit status. Caller holds `exit_lock`.
    pub(crate) fn record_exit(&self, status: i32) {
        self.exit_code.store(status, Ordering::Release);
        self.can_exit.store(true, Ordering::Release);
    }

    pub fn exit_status(&self) -> i32 {
        self.exit_code.load(Ordering::Acquire)
    }

    pub fn sbrk_lock(&self) -> &Mutex {
        &self.sbrk_lock
    }
}
