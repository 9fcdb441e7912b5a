//! Condition variables

use super::{mutex::Mutex, wait_channel::WaitChannel};

/// Condition variable bound to a caller-held [`Mutex`].
///
/// Every operation asserts that the paired mutex is held by the calling
/// thread. `wait` releases the mutex and sleeps as one atomic step with
/// respect to `signal`/`broadcast`: the wake token is enqueued before the
/// mutex is dropped, so a signal issued by the next lock holder cannot be
/// lost.
pub struct CondVar {
    wchan: WaitChannel,
}

impl CondVar {
    pub const fn new() -> Self {
        Self {
            wchan: WaitChannel::new(),
        }
    }

    /// Release `mutex`, sleep until signalled, re-acquire `mutex`.
    ///
    /// Callers must re-test their predicate in a loop: a waiter can be
    /// overtaken between wake-up and re-acquisition.
    pub fn wait(&self, mutex: &Mutex) {
        assert!(
            mutex.held_by_me(),
            "condition variable waited on without holding the paired mutex"
        );
        let token = self.wchan.register();
        mutex.release();
        WaitChannel::sleep(token);
        mutex.acquire();
    }

    /// Wake one waiter. The paired mutex must be held.
    pub fn signal(&self, mutex: &Mutex) {
        assert!(
            mutex.held_by_me(),
            "condition variable signalled without holding the paired mutex"
        );
        self.wchan.wake_one();
    }

    /// Wake all waiters. The paired mutex must be held.
    pub fn broadcast(&self, mutex: &Mutex) {
        assert!(
            mutex.held_by_me(),
            "condition variable broadcast without holding the paired mutex"
        );
        self.wchan.wake_all();
    }
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::{sync::Arc, thread, vec::Vec};

    #[test]
    fn wait_releases_and_reacquires() {
        let m = Arc::new(Mutex::new());
        let cv = Arc::new(CondVar::new());
        let ready = Arc::new(AtomicBool::new(false));

        let (m2, cv2, ready2) = (m.clone(), cv.clone(), ready.clone());
        let waiter = thread::spawn(move || {
            m2.acquire();
            while !ready2.load(Ordering::Acquire) {
                cv2.wait(&m2);
            }
            assert!(m2.held_by_me());
            m2.release();
        });

        // The waiter must have dropped the mutex while asleep or this
        // acquire would deadlock.
        m.acquire();
        ready.store(true, Ordering::Release);
        cv.signal(&m);
        m.release();

        waiter.join().expect("waiter should be signalled awake");
    }

    #[test]
    fn broadcast_wakes_every_waiter() {
        let m = Arc::new(Mutex::new());
        let cv = Arc::new(CondVar::new());
        let go = Arc::new(AtomicBool::new(false));
        let woken = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let (m, cv, go, woken) = (m.clone(), cv.clone(), go.clone(), woken.clone());
            handles.push(thread::spawn(move || {
                m.acquire();
                while !go.load(Ordering::Acquire) {
                    cv.wait(&m);
                }
                woken.fetch_add(1, Ordering::AcqRel);
                m.release();
            }));
        }

        // Let the waiters park, then release them all at once.
        for _ in 0..100 {
            thread::yield_now();
        }
        m.acquire();
        go.store(true, Ordering::Release);
        cv.broadcast(&m);
        m.release();

        for handle in handles {
            handle.join().expect("waiter should be broadcast awake");
        }
        assert_eq!(woken.load(Ordering::Acquire), 5);
    }

    #[test]
    #[should_panic(expected = "without holding the paired mutex")]
    fn wait_without_mutex_asserts() {
        let m = Mutex::new();
        let cv = CondVar::new();
        cv.wait(&m);
    }
}
