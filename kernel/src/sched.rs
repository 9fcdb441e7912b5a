//! Thread identity and reschedule shim
//!
//! The blocking primitives in [`crate::sync`] park a thread by registering
//! on a wait channel and yielding the CPU until woken. This module is the
//! thin seam between them and the platform scheduler: on bare metal the
//! context-switch path publishes the running thread's id and the yield is a
//! reschedule; on hosted targets (unit tests) kernel threads are OS threads
//! and the yield maps to `std::thread::yield_now`.

use core::sync::atomic::{AtomicU64, Ordering};

/// Kernel thread identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(pub u64);

#[cfg(target_os = "none")]
static CURRENT_TID: AtomicU64 = AtomicU64::new(0);

/// Publish the running thread's id. Called by the platform context-switch
/// path with interrupts disabled.
#[cfg(target_os = "none")]
pub fn set_current_thread(tid: ThreadId) {
    CURRENT_TID.store(tid.0, Ordering::Release);
}

/// Identity of the currently running kernel thread.
#[cfg(target_os = "none")]
pub fn current_thread_id() -> ThreadId {
    ThreadId(CURRENT_TID.load(Ordering::Acquire))
}

/// Identity of the currently running kernel thread.
///
/// On hosted targets every OS thread that enters the kernel gets a distinct
/// id on first use.
#[cfg(not(target_os = "none"))]
pub fn current_thread_id() -> ThreadId {
    static NEXT_TID: AtomicU64 = AtomicU64::new(1);
    std::thread_local! {
        static TID: u64 = NEXT_TID.fetch_add(1, Ordering::Relaxed);
    }
    ThreadId(TID.with(|tid| *tid))
}

/// Give up the CPU so another runnable thread can make progress.
pub fn yield_cpu() {
    #[cfg(not(target_os = "none"))]
    std::thread::yield_now();

    #[cfg(target_os = "none")]
    core::hint::spin_loop();
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn thread_ids_are_stable_within_a_thread() {
        let a = current_thread_id();
        let b = current_thread_id();
        assert_eq!(a, b);
    }

    #[test]
    fn thread_ids_differ_across_threads() {
        let here = current_thread_id();
        let there = std::thread::spawn(current_thread_id)
            .join()
            .expect("identity probe thread should not panic");
        assert_ne!(here, there);
    }
}
