//! Blocking synchronization primitives
//!
//! The hardware layer supplies spinlocks (`spin::Mutex`, interrupts-off
//! short critical sections). Everything here sleeps instead of spinning:
//! a shared [`WaitChannel`] substrate carries parked threads, and
//! [`Mutex`], [`Semaphore`], [`CondVar`], and [`RwLock`] are built on it.
//!
//! Ground rules, enforced by assertion where possible:
//! - spinlock-protected sections never reach a suspension point;
//! - a blocking primitive is never used from interrupt context;
//! - destroying a primitive with a holder or waiters is a kernel bug;
//! - recursive acquisition is a kernel bug.

pub mod condvar;
pub mod mutex;
pub mod rwlock;
pub mod semaphore;
pub mod wait_channel;

pub use condvar::CondVar;
pub use mutex::Mutex;
pub use rwlock::RwLock;
pub use semaphore::Semaphore;
pub use wait_channel::WaitChannel;
