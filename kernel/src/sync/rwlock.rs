//! Reader-writer lock

use spin::Mutex as SpinMutex;

use super::wait_channel::WaitChannel;

struct RwState {
    readers: usize,
    writer: bool,
    writers_queued: usize,
}

/// Reader-writer lock: many concurrent readers or one writer.
///
/// Writers cannot starve under sustained reader load: a writer's arrival
/// bumps `writers_queued`, and new readers are held off while it is
/// nonzero. Release paths signal a queued writer first and broadcast to
/// readers only when no writer is waiting.
pub struct RwLock {
    state: SpinMutex<RwState>,
    reader_queue: WaitChannel,
    writer_queue: WaitChannel,
}

impl RwLock {
    pub const fn new() -> Self {
        Self {
            state: SpinMutex::new(RwState {
                readers: 0,
                writer: false,
                writers_queued: 0,
            }),
            reader_queue: WaitChannel::new(),
            writer_queue: WaitChannel::new(),
        }
    }

    /// Acquire shared access. Sleeps while a writer holds the lock or is
    /// queued for it.
    pub fn read_lock(&self) {
        loop {
            let token = {
                let mut state = self.state.lock();
                if !state.writer && state.writers_queued == 0 {
                    state.readers += 1;
                    return;
                }
                self.reader_queue.register()
            };
            WaitChannel::sleep(token);
        }
    }

    /// Release shared access.
    pub fn read_unlock(&self) {
        let wake_writer = {
            let mut state = self.state.lock();
            assert!(state.readers > 0, "rwlock read-released with no readers");
            state.readers -= 1;
            state.readers == 0 && state.writers_queued > 0
        };
        if wake_writer {
            self.writer_queue.wake_one();
        }
    }

    /// Acquire exclusive access. Sleeps while any reader or writer holds
    /// the lock.
    pub fn write_lock(&self) {
        self.state.lock().writers_queued += 1;
        loop {
            let token = {
                let mut state = self.state.lock();
                if !state.writer && state.readers == 0 {
                    state.writer = true;
                    state.writers_queued -= 1;
                    return;
                }
                self.writer_queue.register()
            };
            WaitChannel::sleep(token);
        }
    }

    /// Release exclusive access.
    pub fn write_unlock(&self) {
        let writers_waiting = {
            let mut state = self.state.lock();
            assert!(state.writer, "rwlock write-released while not write-held");
            state.writer = false;
            state.writers_queued > 0
        };
        if writers_waiting {
            self.writer_queue.wake_one();
        } else {
            self.reader_queue.wake_all();
        }
    }
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RwLock {
    fn drop(&mut self) {
        #[cfg(not(target_os = "none"))]
        if std::thread::panicking() {
            return;
        }
        let state = self.state.lock();
        assert!(
            state.readers == 0 && !state.writer && state.writers_queued == 0,
            "rwlock destroyed while held or contended"
        );
    }
}
