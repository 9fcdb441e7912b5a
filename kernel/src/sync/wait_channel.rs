//! Wait channels
//!
//! A wait channel is the blocking substrate shared by every sleeping
//! primitive in this module: a spinlock-protected queue of wake tokens.
//! The protocol has two halves so that sleeping can be made atomic with
//! respect to the condition a caller is waiting on:
//!
//! 1. [`WaitChannel::register`] enqueues a token. The caller does this
//!    while still holding whatever lock protects the condition, so a wake
//!    issued after registration can never be lost.
//! 2. [`WaitChannel::sleep`] parks the current thread on the token after
//!    the condition lock has been dropped.
//!
//! Wakers pop tokens under the same spinlock, so wake ordering is the
//! registration order (FIFO, though callers must not rely on it).

use alloc::{collections::VecDeque, sync::Arc};
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex as SpinMutex;

use crate::sched;

/// One sleeper's wake flag.
#[derive(Debug)]
pub struct WakeToken(AtomicBool);

/// Queue of threads sleeping on some condition.
#[derive(Debug)]
pub struct WaitChannel {
    sleepers: SpinMutex<VecDeque<Arc<WakeToken>>>,
}

impl WaitChannel {
    pub const fn new() -> Self {
        Self {
            sleepers: SpinMutex::new(VecDeque::new()),
        }
    }

    /// Enqueue the current thread. Must be called before dropping the lock
    /// that protects the condition being waited on.
    pub fn register(&self) -> Arc<WakeToken> {
        let token = Arc::new(WakeToken(AtomicBool::new(false)));
        self.sleepers.lock().push_back(token.clone());
        token
    }

    /// Park until the token is woken. No spinlock may be held here; this is
    /// a suspension point.
    pub fn sleep(token: Arc<WakeToken>) {
        while !token.0.load(Ordering::Acquire) {
            sched::yield_cpu();
        }
    }

    /// Wake the oldest sleeper. Returns whether anyone was woken.
    pub fn wake_one(&self) -> bool {
        if let Some(token) = self.sleepers.lock().pop_front() {
            token.0.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Wake every sleeper. Returns how many were woken.
    pub fn wake_all(&self) -> usize {
        let drained: VecDeque<_> = {
            let mut sleepers = self.sleepers.lock();
            core::mem::take(&mut *sleepers)
        };
        let count = drained.len();
        for token in drained {
            token.0.store(true, Ordering::Release);
        }
        count
    }

    pub fn is_empty(&self) -> bool {
        self.sleepers.lock().is_empty()
    }
}

impl Default for WaitChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WaitChannel {
    fn drop(&mut self) {
        // Suppressed while unwinding so an unrelated test panic does not
        // cascade into an abort.
        #[cfg(not(target_os = "none"))]
        if std::thread::panicking() {
            return;
        }
        assert!(
            self.sleepers.lock().is_empty(),
            "wait channel destroyed with sleepers"
        );
    }
}
