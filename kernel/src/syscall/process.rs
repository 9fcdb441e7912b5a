//! Process system calls
//!
//! `fork`, `execv`, `waitpid`, `exit`, `sbrk`, and `getpid`. The calls
//! that do not return to the caller in the usual way (`fork`'s child,
//! `execv`'s fresh image, `exit`) hand the dispatcher a continuation
//! value -- [`ChildContext`] or [`UserContext`] -- that the trap glue
//! turns into an actual control transfer.

use alloc::{string::String, sync::Arc, vec::Vec};

use crate::{
    arch::TrapFrame,
    error::Errno,
    fs::{FileSystem, OpenFlags, PATH_MAX},
    kernel::Kernel,
    mm::{
        addrspace::AddressSpace, usercopy, VirtualAddress, PAGE_SIZE, USER_SPACE_TOP,
    },
    process::{encode_exit_status, Process, ProcessId, ProgramLoader, ARG_MAX, MAX_PROCS},
};

/// `waitpid` option: do not block.
pub const WNOHANG: u32 = 1;

/// Everything the trap glue needs to start a forked child: the new
/// process and the register frame its first thread resumes with.
pub struct ChildContext {
    pub process: Arc<Process>,
    pub trapframe: TrapFrame,
}

impl ChildContext {
    /// Activate the child's address space and hand back its entry frame.
    /// Runs on the child's kernel thread just before user re-entry.
    pub fn enter(&self, kernel: &Kernel) -> TrapFrame {
        if let Some(aspace) = self.process.address_space() {
            aspace.activate(&kernel.tlb);
        }
        self.trapframe
    }
}

/// User-mode entry state produced by a successful `execv`.
#[derive(Debug)]
pub struct UserContext {
    pub entry: VirtualAddress,
    pub stack: VirtualAddress,
    pub argc: u32,
    /// User address of the argv pointer array.
    pub argv: VirtualAddress,
}

pub fn sys_getpid(proc: &Arc<Process>) -> u32 {
    proc.pid.0
}

/// Duplicate the calling process: new pid, eagerly copied address space,
/// shared file handles, inherited cwd. The parent gets the child's pid;
/// the child's frame returns 0.
pub fn sys_fork(
    kernel: &Kernel,
    proc: &Arc<Process>,
    tf: &TrapFrame,
) -> Result<ChildContext, Errno> {
    let aspace = proc.address_space().ok_or(Errno::Einval)?;

    let child = kernel.procs.spawn(Some(proc.pid))?;
    let copied = match aspace.copy(&kernel.coremap, &kernel.swap, &kernel.tlb) {
        Ok(copied) => copied,
        Err(errno) => {
            kernel.procs.remove(child.pid);
            return Err(errno);
        }
    };
    child.set_address_space(Some(copied));
    proc.files.clone_into(&child.files);
    child.set_cwd(&proc.cwd());
    // The forked kernel thread starts on the parent's account.
    proc.thread_started();

    log::debug!("fork: pid {} -> child {}", proc.pid, child.pid);
    Ok(ChildContext {
        process: child,
        trapframe: TrapFrame::forked_child(tf),
    })
}

/// Replace the current image with the program at `prog_ptr`, passing the
/// strings in the `argv_ptr` array. Does not return on success; the
/// caller re-enters user mode through the returned [`UserContext`]. An
/// error after the old image is torn down is fatal to the process -- the
/// trap glue must not resume it.
pub fn sys_execv(
    kernel: &Kernel,
    proc: &Arc<Process>,
    prog_ptr: VirtualAddress,
    argv_ptr: VirtualAddress,
) -> Result<UserContext, Errno> {
    if prog_ptr.as_u64() == 0 || argv_ptr.as_u64() == 0 {
        return Err(Errno::Efault);
    }
    let path = usercopy::copyinstr(kernel, proc, prog_ptr, PATH_MAX)
        .map_err(|errno| if errno == Errno::E2big { Errno::Efault } else { errno })?;

    // Gather the argument strings while the old image is still alive.
    // Budget: padded string bytes plus the pointer array, capped at
    // ARG_MAX.
    let mut args: Vec<String> = Vec::new();
    let mut string_bytes = 0usize;
    loop {
        let slot = argv_ptr.add(4 * args.len() as u64);
        let uptr = usercopy::copyin_u32(kernel, proc, slot)?;
        if uptr == 0 {
            break;
        }
        let arg = usercopy::copyinstr(kernel, proc, VirtualAddress::new(uptr as u64), ARG_MAX)?;
        string_bytes += (arg.len() + 1).next_multiple_of(4);
        let pointer_bytes = (args.len() + 2) * 4;
        if string_bytes + pointer_bytes > ARG_MAX {
            return Err(Errno::E2big);
        }
        args.push(arg);
    }

    let vnode = kernel.vfs.open(&path, OpenFlags::read_only())?;

    // Point of no return: the old image is destroyed before the new one
    // is loaded.
    let new_aspace = AddressSpace::new(true);
    if let Some(old) = proc.set_address_space(Some(new_aspace.clone())) {
        old.destroy(&kernel.coremap, &kernel.swap, &kernel.tlb);
    }
    new_aspace.activate(&kernel.tlb);

    let entry = kernel.loader.load(kernel, proc, &vnode)?;
    let stack_top = new_aspace.define_stack()?;

    // Argument strings go at the top of the stack, 4-byte padded, argv[0]
    // highest; the pointer array (NULL-terminated) sits below them and
    // doubles as the initial stack pointer.
    let mut sp = stack_top.as_u64();
    let mut user_ptrs: Vec<u32> = Vec::with_capacity(args.len());
    for arg in &args {
        let padded = (arg.len() + 1).next_multiple_of(4);
        sp -= padded as u64;
        usercopy::copyoutstr(kernel, proc, arg, VirtualAddress::new(sp), padded)?;
        user_ptrs.push(sp as u32);
    }
    sp -= (user_ptrs.len() as u64 + 1) * 4;
    let argv_user = VirtualAddress::new(sp);
    for (index, uptr) in user_ptrs.iter().enumerate() {
        usercopy::copyout_u32(kernel, proc, *uptr, argv_user.add(4 * index as u64))?;
    }
    usercopy::copyout_u32(
        kernel,
        proc,
        0,
        argv_user.add(4 * user_ptrs.len() as u64),
    )?;

    log::debug!("execv: pid {} -> {}", proc.pid, path);
    Ok(UserContext {
        entry,
        stack: VirtualAddress::new(sp),
        argc: args.len() as u32,
        argv: argv_user,
    })
}

/// Wait for the child `pid` to exit, copy its encoded status out, and
/// reap it. `WNOHANG` returns 0 instead of blocking.
pub fn sys_waitpid(
    kernel: &Kernel,
    proc: &Arc<Process>,
    pid: u32,
    status_ptr: VirtualAddress,
    options: u32,
) -> Result<u32, Errno> {
    if options != 0 && options != WNOHANG {
        return Err(Errno::Einval);
    }
    if status_ptr.as_u64() % 4 != 0 {
        return Err(Errno::Efault);
    }
    if pid as usize >= MAX_PROCS {
        return Err(Errno::Esrch);
    }
    let child = kernel.procs.get(ProcessId(pid)).ok_or(Errno::Esrch)?;
    if child.parent_pid() != Some(proc.pid) {
        return Err(Errno::Echild);
    }

    if options == WNOHANG && !child.has_exited() {
        return Ok(0);
    }

    child.exit_lock().acquire();
    while !child.has_exited() {
        child.exit_cv().wait(child.exit_lock());
    }
    let status = child.exit_status();
    child.exit_lock().release();

    usercopy::copyout_u32(kernel, proc, status as u32, status_ptr)?;

    // Reap: the zombie's remaining resources and its table slot.
    if let Some(aspace) = child.set_address_space(None) {
        aspace.destroy(&kernel.coremap, &kernel.swap, &kernel.tlb);
    }
    kernel.procs.remove(child.pid);
    log::debug!("waitpid: pid {} reaped child {}", proc.pid, child.pid);
    Ok(pid)
}

/// Terminate the calling process. `fatal` marks a kill by the kernel
/// (trap-induced) rather than a voluntary exit; the encoding differs so
/// the parent can tell them apart.
///
/// The caller's thread must not return to user mode afterwards; the
/// dispatcher surfaces this as [`SyscallOutcome::Exited`].
///
/// [`SyscallOutcome::Exited`]: super::SyscallOutcome::Exited
pub fn sys_exit(kernel: &Kernel, proc: &Arc<Process>, code: i32, fatal: bool) {
    let status = encode_exit_status(code, fatal);
    proc.files.close_all();

    proc.exit_lock().acquire();
    proc.record_exit(status);
    // A zombie parent counts as exited: nobody is coming to reap us.
    let parent_alive = proc
        .parent_pid()
        .and_then(|parent| kernel.procs.get(parent))
        .map(|parent| !parent.has_exited())
        .unwrap_or(false);

    if parent_alive {
        // Stay a zombie; the parent collects the status and frees the
        // slot in waitpid.
        proc.exit_cv().broadcast(proc.exit_lock());
        proc.exit_lock().release();
    } else {
        // Nobody will reap us; tear everything down now.
        proc.exit_lock().release();
        if let Some(aspace) = proc.set_address_space(None) {
            aspace.destroy(&kernel.coremap, &kernel.swap, &kernel.tlb);
        }
        kernel.procs.remove(proc.pid);
    }
    log::debug!("exit: pid {} status {:#x}", proc.pid, status);
}

/// Move the heap break by `amount` bytes (page-aligned, may be
/// negative). Returns the previous break. Shrinking frees the pages
/// beyond the new end and flushes the TLB.
pub fn sys_sbrk(kernel: &Kernel, proc: &Arc<Process>, amount: i32) -> Result<u32, Errno> {
    let aspace = proc.address_space().ok_or(Errno::Einval)?;
    let heap = aspace.heap_segment().ok_or(Errno::Einval)?;
    if amount as i64 % PAGE_SIZE as i64 != 0 {
        return Err(Errno::Einval);
    }

    proc.sbrk_lock().acquire();
    let result = (|| {
        let old_size = heap.size() as i64;
        let new_size = old_size + amount as i64;
        if new_size < 0 {
            return Err(Errno::Einval);
        }
        let start = heap.start().as_u64();
        let new_end = start + new_size as u64;
        if new_end > USER_SPACE_TOP {
            return Err(Errno::Enomem);
        }
        heap.set_size(new_size as usize);

        if amount < 0 {
            // Give back every page at or beyond the new end.
            let removed = heap.remove_pages_from(VirtualAddress::new(new_end));
            for page in removed {
                crate::mm::addrspace::release_page(&page, &kernel.coremap, &kernel.swap, &kernel.tlb);
            }
            kernel.tlb.invalidate_all();
        }
        Ok((start + old_size as u64) as u32)
    })();
    proc.sbrk_lock().release();
    result
}
