//! In-memory non-blocking duplex pipe
//!
//! Both ends live on the same thread. Reads with nothing buffered fail with
//! `WouldBlock` until the other end writes or goes away, which lets tests
//! step a client and a server alternately without sockets or threads.

use crate::sio::transport::Transport;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::rc::Rc;

#[derive(Debug, Default)]
struct Direction {
    data: VecDeque<u8>,
    writer_closed: bool,
    reader_closed: bool,
}

#[derive(Debug, Default)]
struct Shared {
    // [0] carries a -> b, [1] carries b -> a
    directions: [Direction; 2],
}

/// One end of an in-memory pipe
#[derive(Debug)]
pub struct PipeEnd {
    shared: Rc<RefCell<Shared>>,
    inbound: usize,
    outbound: usize,
    read_limit: Option<usize>,
    allowance: Option<usize>,
}

/// Create two connected ends
pub fn pipe() -> (PipeEnd, PipeEnd) {
    let shared = Rc::new(RefCell::new(Shared::default()));
    let a = PipeEnd {
        shared: Rc::clone(&shared),
        inbound: 1,
        outbound: 0,
        read_limit: None,
        allowance: None,
    };
    let b = PipeEnd {
        shared,
        inbound: 0,
        outbound: 1,
        read_limit: None,
        allowance: None,
    };
    (a, b)
}

impl PipeEnd {
    /// Cap every read at `limit` bytes
    pub fn set_read_limit(&mut self, limit: Option<usize>) {
        self.read_limit = limit;
    }

    /// Let only `allowance` more bytes through; further reads would block
    /// until `allow()` raises the allowance
    pub fn throttle(&mut self, allowance: usize) {
        self.allowance = Some(allowance);
    }

    /// Raise the allowance set by `throttle()`
    pub fn allow(&mut self, bytes: usize) {
        if let Some(ref mut allowance) = self.allowance {
            *allowance += bytes;
        }
    }

    /// Remove any throttle
    pub fn unthrottle(&mut self) {
        self.allowance = None;
    }

    /// Bytes written by the other end and not yet read
    pub fn available(&self) -> usize {
        self.shared.borrow().directions[self.inbound].data.len()
    }
}

impl Read for PipeEnd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut shared = self.shared.borrow_mut();
        let direction = &mut shared.directions[self.inbound];

        if direction.data.is_empty() {
            return if direction.writer_closed {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }

        let mut max = buf.len().min(direction.data.len());
        if let Some(limit) = self.read_limit {
            max = max.min(limit.max(1));
        }
        if let Some(allowance) = self.allowance {
            if allowance == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            max = max.min(allowance);
        }

        for (slot, byte) in buf.iter_mut().zip(direction.data.drain(..max)) {
            *slot = byte;
        }
        if let Some(ref mut allowance) = self.allowance {
            *allowance -= max;
        }
        Ok(max)
    }
}

impl Write for PipeEnd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut shared = self.shared.borrow_mut();
        let direction = &mut shared.directions[self.outbound];
        if direction.reader_closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        direction.data.extend(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for PipeEnd {}

impl Drop for PipeEnd {
    fn drop(&mut self) {
        let mut shared = self.shared.borrow_mut();
        shared.directions[self.outbound].writer_closed = true;
        shared.directions[self.inbound].reader_closed = true;
    }
}
