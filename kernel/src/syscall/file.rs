//! File system calls
//!
//! `open`, `close`, `read`, `write`, `lseek`, `dup2`, `chdir`, and
//! `getcwd`. Every handler validates the descriptor and access mode
//! first, moves user bytes through the copyin/copyout boundary, and
//! serializes I/O on the handle's lock so a single call is atomic with
//! respect to every other descriptor sharing the handle.

use alloc::{sync::Arc, vec};

use crate::{
    error::Errno,
    fs::{FileHandle, FileSystem, NodeType, OpenFlags, Vnode, Whence, OPEN_MAX, PATH_MAX},
    kernel::Kernel,
    mm::{usercopy, VirtualAddress},
    process::Process,
};

fn lookup_fd(proc: &Arc<Process>, fd: u32) -> Result<Arc<FileHandle>, Errno> {
    let fd = fd as usize;
    if fd >= OPEN_MAX {
        return Err(Errno::Ebadf);
    }
    proc.files.get(fd).ok_or(Errno::Ebadf)
}

/// Open `path` with the ABI `flags` bits; returns the smallest free
/// descriptor at or above 3.
pub fn sys_open(
    kernel: &Kernel,
    proc: &Arc<Process>,
    path_ptr: VirtualAddress,
    flags_bits: u32,
) -> Result<u32, Errno> {
    let flags = OpenFlags::from_bits(flags_bits).ok_or(Errno::Einval)?;
    if path_ptr.as_u64() == 0 {
        return Err(Errno::Efault);
    }
    let path = usercopy::copyinstr(kernel, proc, path_ptr, PATH_MAX)
        .map_err(|errno| if errno == Errno::E2big { Errno::Efault } else { errno })?;

    let vnode = kernel.vfs.open(&path, flags)?;
    let handle = FileHandle::new(vnode, flags);
    // On EMFILE the handle drops here and the vnode closes with it.
    let fd = proc.files.alloc_user_fd(handle)?;
    Ok(fd as u32)
}

/// Drop the descriptor; the handle (and vnode) die with the last
/// reference.
pub fn sys_close(_kernel: &Kernel, proc: &Arc<Process>, fd: u32) -> Result<u32, Errno> {
    let fd = fd as usize;
    if fd >= OPEN_MAX {
        return Err(Errno::Ebadf);
    }
    let handle = proc.files.set(fd, None).ok_or(Errno::Ebadf)?;
    handle.lock().acquire();
    let remaining = handle.release();
    handle.lock().release();
    if remaining == 0 {
        // Last descriptor: the vnode closes when the handle drops.
        log::trace!("close: fd {} released its handle", fd);
    }
    Ok(0)
}

/// Read up to `len` bytes at the handle's position into `buf_ptr`.
pub fn sys_read(
    kernel: &Kernel,
    proc: &Arc<Process>,
    fd: u32,
    buf_ptr: VirtualAddress,
    len: u32,
) -> Result<u32, Errno> {
    let handle = lookup_fd(proc, fd)?;
    if !handle.flags().read {
        return Err(Errno::Ebadf);
    }
    // Zero-length transfers are rejected here, deliberately diverging
    // from POSIX.
    if len == 0 {
        return Err(Errno::Efault);
    }
    let len = len as usize;
    let mut buffer = vec![0u8; len];

    handle.lock().acquire();
    let transferred = (|| {
        let position = handle.position();
        let count = handle.vnode().read_at(position, &mut buffer)?;
        handle.set_position(position + count as u64);
        Ok(count)
    })();
    handle.lock().release();

    let count = transferred?;
    usercopy::copyout(kernel, proc, &buffer[..count], buf_ptr)?;
    Ok(count as u32)
}

/// Write `len` bytes from `buf_ptr` at the handle's position.
pub fn sys_write(
    kernel: &Kernel,
    proc: &Arc<Process>,
    fd: u32,
    buf_ptr: VirtualAddress,
    len: u32,
) -> Result<u32, Errno> {
    let handle = lookup_fd(proc, fd)?;
    if !handle.flags().write {
        return Err(Errno::Ebadf);
    }
    if len == 0 {
        return Err(Errno::Efault);
    }
    let mut buffer = vec![0u8; len as usize];
    // Snapshot the user bytes first; the write below is then atomic per
    // call under the handle lock.
    usercopy::copyin(kernel, proc, buf_ptr, &mut buffer)?;

    handle.lock().acquire();
    let transferred = (|| {
        let position = handle.position();
        let count = handle.vnode().write_at(position, &buffer)?;
        handle.set_position(position + count as u64);
        Ok(count)
    })();
    handle.lock().release();

    Ok(transferred? as u32)
}

/// Reposition the handle. Offsets are 64-bit; `whence` selects the base.
pub fn sys_lseek(
    _kernel: &Kernel,
    proc: &Arc<Process>,
    fd: u32,
    pos: i64,
    whence_raw: u32,
) -> Result<u64, Errno> {
    let handle = lookup_fd(proc, fd)?;
    let whence = Whence::from_raw(whence_raw).ok_or(Errno::Einval)?;

    handle.lock().acquire();
    let sought = (|| {
        if !handle.vnode().is_seekable() {
            return Err(Errno::Espipe);
        }
        let base: i64 = match whence {
            Whence::Set => 0,
            Whence::Cur => handle.position() as i64,
            Whence::End => handle.vnode().stat().map_err(|_| Errno::Einval)?.size as i64,
        };
        let target = base.checked_add(pos).ok_or(Errno::Einval)?;
        if target < 0 {
            return Err(Errno::Einval);
        }
        handle.set_position(target as u64);
        Ok(target as u64)
    })();
    handle.lock().release();
    sought
}

/// Point `newfd` at the handle behind `oldfd`.
pub fn sys_dup2(kernel: &Kernel, proc: &Arc<Process>, oldfd: u32, newfd: u32) -> Result<u32, Errno> {
    if oldfd as usize >= OPEN_MAX || newfd as usize >= OPEN_MAX {
        return Err(Errno::Ebadf);
    }
    let handle = lookup_fd(proc, oldfd)?;
    // Cloning a descriptor onto itself has no effect.
    if oldfd == newfd {
        return Ok(0);
    }
    // An open newfd is closed first.
    if proc.files.get(newfd as usize).is_some() {
        sys_close(kernel, proc, newfd)?;
    }
    handle.lock().acquire();
    handle.retain();
    proc.files.set(newfd as usize, Some(handle.clone()));
    handle.lock().release();
    Ok(0)
}

/// Change the working directory.
pub fn sys_chdir(kernel: &Kernel, proc: &Arc<Process>, path_ptr: VirtualAddress) -> Result<u32, Errno> {
    if path_ptr.as_u64() == 0 {
        return Err(Errno::Efault);
    }
    let path = usercopy::copyinstr(kernel, proc, path_ptr, PATH_MAX)
        .map_err(|errno| if errno == Errno::E2big { Errno::Efault } else { errno })?;
    let vnode = kernel.vfs.lookup(&path)?;
    if vnode.stat()?.node_type != NodeType::Directory {
        return Err(Errno::Enotdir);
    }
    proc.set_cwd(&path);
    Ok(0)
}

/// Copy the working directory into the user buffer; returns the byte
/// count (no terminator, like the underlying VFS op).
pub fn sys_getcwd(
    kernel: &Kernel,
    proc: &Arc<Process>,
    buf_ptr: VirtualAddress,
    len: u32,
) -> Result<u32, Errno> {
    if buf_ptr.as_u64() == 0 {
        return Err(Errno::Efault);
    }
    if len == 0 {
        return Err(Errno::Einval);
    }
    let cwd = proc.cwd();
    let count = cwd.len().min(len as usize);
    usercopy::copyout(kernel, proc, &cwd.as_bytes()[..count], buf_ptr)?;
    Ok(count as u32)
}
