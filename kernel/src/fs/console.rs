//! Console device
//!
//! The byte-stream device behind `"con:"`. Reads drain an input queue the
//! platform (or a test) feeds; writes append to an output sink. Offsets
//! are ignored and seeking is refused, which is what makes `lseek` on the
//! standard descriptors fail with `ESPIPE`.

use alloc::{collections::VecDeque, vec::Vec};

use spin::Mutex as SpinMutex;

use super::{NodeType, Stat, Vnode};
use crate::error::Errno;

pub struct Console {
    input: SpinMutex<VecDeque<u8>>,
    output: SpinMutex<Vec<u8>>,
}

impl Console {
    pub fn new() -> Self {
        Self {
            input: SpinMutex::new(VecDeque::new()),
            output: SpinMutex::new(Vec::new()),
        }
    }

    /// Queue bytes for subsequent reads (keyboard interrupt path; tests).
    pub fn push_input(&self, bytes: &[u8]) {
        let mut input = self.input.lock();
        input.extend(bytes.iter().copied());
    }

    /// Drain everything written so far (UART drain path; tests).
    pub fn take_output(&self) -> Vec<u8> {
        let mut output = self.output.lock();
        core::mem::take(&mut *output)
    }

    pub fn pending_output(&self) -> usize {
        self.output.lock().len()
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

impl Vnode for Console {
    fn read_at(&self, _offset: u64, buf: &mut [u8]) -> Result<usize, Errno> {
        let mut input = self.input.lock();
        let mut count = 0;
        while count < buf.len() {
            match input.pop_front() {
                Some(byte) => {
                    buf[count] = byte;
                    count += 1;
                }
                None => break,
            }
        }
        Ok(count)
    }

    fn write_at(&self, _offset: u64, data: &[u8]) -> Result<usize, Errno> {
        self.output.lock().extend_from_slice(data);
        Ok(data.len())
    }

    fn stat(&self) -> Result<Stat, Errno> {
        Ok(Stat {
            size: 0,
            node_type: NodeType::CharDevice,
        })
    }

    fn is_seekable(&self) -> bool {
        false
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn reads_drain_the_input_queue() {
        let con = Console::new();
        con.push_input(b"hello");

        let mut buf = [0u8; 3];
        assert_eq!(con.read_at(0, &mut buf), Ok(3));
        assert_eq!(&buf, b"hel");

        let mut rest = [0u8; 8];
        assert_eq!(con.read_at(0, &mut rest), Ok(2));
        assert_eq!(&rest[..2], b"lo");

        // Empty queue reads zero bytes rather than blocking.
        assert_eq!(con.read_at(0, &mut rest), Ok(0));
    }

    #[test]
    fn writes_accumulate_in_order() {
        let con = Console::new();
        assert_eq!(con.write_at(0, b"abc"), Ok(3));
        assert_eq!(con.write_at(999, b"def"), Ok(3)); // offset ignored
        assert_eq!(con.take_output(), b"abcdef".to_vec());
        assert_eq!(con.pending_output(), 0);
    }

    #[test]
    fn console_is_not_seekable() {
        let con = Console::new();
        assert!(!con.is_seekable());
        let stat = con.stat().expect("console stat should succeed");
        assert_eq!(stat.node_type, NodeType::CharDevice);
    }
}
