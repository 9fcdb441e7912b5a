//! System call dispatch
//!
//! The trap layer decodes the exception, then hands the kernel, the
//! current process, and the trap frame to [`dispatch`]. Register
//! convention (MIPS-style): call number in `v0`, arguments in `a0..a3`,
//! 64-bit arguments in the aligned `a2:a3` pair with overflow arguments
//! (lseek's `whence`) fetched from the user stack at `sp + 16`. On
//! return `v0` carries the result (64-bit results use `v0:v1`), `a3` is
//! the error flag, and `epc` is advanced past the syscall instruction.
//!
//! Calls that leave the ordinary return path -- `fork`'s child, a
//! successful `execv`, `exit` -- surface as [`SyscallOutcome`] variants
//! the trap glue turns into thread starts and user-mode entries.

use alloc::sync::Arc;

use crate::{
    arch::TrapFrame, error::Errno, kernel::Kernel, mm::VirtualAddress, process::Process,
};

pub mod file;
pub mod process;

pub use process::{ChildContext, UserContext, WNOHANG};

/// System call numbers (the user ABI).
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Fork = 0,
    Execv = 1,
    Exit = 2,
    Waitpid = 3,
    Getpid = 4,
    Sbrk = 5,

    Open = 10,
    Close = 11,
    Read = 12,
    Write = 13,
    Lseek = 14,
    Dup2 = 15,
    Chdir = 16,
    Getcwd = 17,
}

impl TryFrom<u32> for Syscall {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Syscall::Fork),
            1 => Ok(Syscall::Execv),
            2 => Ok(Syscall::Exit),
            3 => Ok(Syscall::Waitpid),
            4 => Ok(Syscall::Getpid),
            5 => Ok(Syscall::Sbrk),
            10 => Ok(Syscall::Open),
            11 => Ok(Syscall::Close),
            12 => Ok(Syscall::Read),
            13 => Ok(Syscall::Write),
            14 => Ok(Syscall::Lseek),
            15 => Ok(Syscall::Dup2),
            16 => Ok(Syscall::Chdir),
            17 => Ok(Syscall::Getcwd),
            _ => Err(()),
        }
    }
}

/// What the trap glue does after a syscall.
pub enum SyscallOutcome {
    /// Return to user mode in the calling process; the trap frame holds
    /// the result.
    Continue,
    /// `fork` succeeded: the parent continues (frame updated) and the
    /// child must be scheduled with this context.
    StartChild(ChildContext),
    /// `execv` succeeded: enter user mode at this context. The old frame
    /// is meaningless now.
    EnterUser(UserContext),
    /// The process exited (or was killed); do not return to user mode on
    /// this thread.
    Exited,
}

enum Action {
    Value(u32),
    Value64(u64),
    Fork(ChildContext),
    Exec(UserContext),
    Exit,
}

fn uaddr(reg: u32) -> VirtualAddress {
    VirtualAddress::new(reg as u64)
}

/// Decode and run the system call in `tf`.
pub fn dispatch(kernel: &Kernel, proc: &Arc<Process>, tf: &mut TrapFrame) -> SyscallOutcome {
    let result: Result<Action, Errno> = (|| {
        let call = Syscall::try_from(tf.v0).map_err(|_| Errno::Enosys)?;
        match call {
            Syscall::Fork => process::sys_fork(kernel, proc, tf).map(Action::Fork),
            Syscall::Execv => {
                process::sys_execv(kernel, proc, uaddr(tf.a0), uaddr(tf.a1)).map(Action::Exec)
            }
            Syscall::Exit => {
                process::sys_exit(kernel, proc, tf.a0 as i32, false);
                Ok(Action::Exit)
            }
            Syscall::Waitpid => {
                process::sys_waitpid(kernel, proc, tf.a0, uaddr(tf.a1), tf.a2).map(Action::Value)
            }
            Syscall::Getpid => Ok(Action::Value(process::sys_getpid(proc))),
            Syscall::Sbrk => process::sys_sbrk(kernel, proc, tf.a0 as i32).map(Action::Value),
            Syscall::Open => {
                file::sys_open(kernel, proc, uaddr(tf.a0), tf.a1).map(Action::Value)
            }
            Syscall::Close => file::sys_close(kernel, proc, tf.a0).map(Action::Value),
            Syscall::Read => {
                file::sys_read(kernel, proc, tf.a0, uaddr(tf.a1), tf.a2).map(Action::Value)
            }
            Syscall::Write => {
                file::sys_write(kernel, proc, tf.a0, uaddr(tf.a1), tf.a2).map(Action::Value)
            }
            Syscall::Lseek => {
                // 64-bit offset in the aligned a2:a3 pair; whence lives on
                // the user stack.
                let pos = (((tf.a2 as u64) << 32) | tf.a3 as u64) as i64;
                let whence = crate::mm::usercopy::copyin_u32(
                    kernel,
                    proc,
                    VirtualAddress::new(tf.sp as u64 + 16),
                )?;
                file::sys_lseek(kernel, proc, tf.a0, pos, whence).map(Action::Value64)
            }
            Syscall::Dup2 => file::sys_dup2(kernel, proc, tf.a0, tf.a1).map(Action::Value),
            Syscall::Chdir => file::sys_chdir(kernel, proc, uaddr(tf.a0)).map(Action::Value),
            Syscall::Getcwd => {
                file::sys_getcwd(kernel, proc, uaddr(tf.a0), tf.a1).map(Action::Value)
            }
        }
    })();

    match result {
        Ok(Action::Value(value)) => {
            tf.v0 = value;
            tf.a3 = 0;
            tf.epc = tf.epc.wrapping_add(4);
            SyscallOutcome::Continue
        }
        Ok(Action::Value64(value)) => {
            tf.v0 = (value >> 32) as u32;
            tf.v1 = value as u32;
            tf.a3 = 0;
            tf.epc = tf.epc.wrapping_add(4);
            SyscallOutcome::Continue
        }
        Ok(Action::Fork(child)) => {
            tf.v0 = child.process.pid.0;
            tf.a3 = 0;
            tf.epc = tf.epc.wrapping_add(4);
            SyscallOutcome::StartChild(child)
        }
        Ok(Action::Exec(context)) => SyscallOutcome::EnterUser(context),
        Ok(Action::Exit) => SyscallOutcome::Exited,
        Err(errno) => {
            tf.v0 = errno.as_i32() as u32;
            tf.a3 = 1;
            tf.epc = tf.epc.wrapping_add(4);
            SyscallOutcome::Continue
        }
    }
}
