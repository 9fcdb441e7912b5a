//! Counting semaphore

use spin::Mutex as SpinMutex;

use super::wait_channel::WaitChannel;

/// Classic counting semaphore.
///
/// `p` decrements the count, sleeping on the internal wait channel while it
/// is zero; `v` increments and wakes one sleeper. There is no FIFO
/// guarantee: a late arrival may take the count a `v` published before a
/// woken sleeper reruns its check.
pub struct Semaphore {
    count: SpinMutex<usize>,
    wchan: WaitChannel,
}

impl Semaphore {
    pub const fn new(initial: usize) -> Self {
        Self {
            count: SpinMutex::new(initial),
            wchan: WaitChannel::new(),
        }
    }

    /// P operation: wait for a unit and consume it.
    pub fn p(&self) {
        loop {
            let token = {
                let mut count = self.count.lock();
                if *count > 0 {
                    *count -= 1;
                    return;
                }
                self.wchan.register()
            };
            WaitChannel::sleep(token);
        }
    }

    /// Non-blocking P. Returns whether a unit was consumed.
    pub fn try_p(&self) -> bool {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }

    /// V operation: release a unit and wake one waiter.
    pub fn v(&self) {
        {
            let mut count = self.count.lock();
            *count += 1;
        }
        self.wchan.wake_one();
    }

    /// Snapshot of the current count.
    pub fn count(&self) -> usize {
        *self.count.lock()
    }
}
