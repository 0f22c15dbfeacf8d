//! Non-blocking transport abstraction
//!
//! Backends talk to the peer through `Transport`, which is any byte stream
//! whose reads and writes fail with `ErrorKind::WouldBlock` instead of
//! blocking. Plain TCP sockets and the in-memory mock pipe both qualify.

use bytes::{Buf, BytesMut};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

/// A non-blocking byte stream
pub trait Transport: Read + Write {
    /// Wait until the transport can accept more bytes.
    ///
    /// Used only by `write()`, which must hand a whole record to the peer.
    fn wait_writable(&self, timeout: Option<Duration>) -> io::Result<bool> {
        let _ = timeout;
        Ok(true)
    }
}

/// Boxed transport owned by a session
pub type Socket = Box<dyn Transport>;

impl Transport for TcpStream {
    #[cfg(unix)]
    fn wait_writable(&self, timeout: Option<Duration>) -> io::Result<bool> {
        use libc::{poll, pollfd, POLLOUT};
        use std::os::fd::AsRawFd;

        let mut pfd = pollfd {
            fd: self.as_raw_fd(),
            events: POLLOUT,
            revents: 0,
        };

        let timeout_ms = timeout
            .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
            .unwrap_or(-1);

        loop {
            let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };
            if result < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            return Ok(result > 0);
        }
    }

    #[cfg(not(unix))]
    fn wait_writable(&self, timeout: Option<Duration>) -> io::Result<bool> {
        // No poll(2); back off briefly and let the next write find out
        std::thread::sleep(timeout.map_or(BACKOFF, |t| t.min(BACKOFF)));
        Ok(true)
    }
}

#[cfg(not(unix))]
const BACKOFF: Duration = Duration::from_millis(10);

/// Result of one bounded receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// This many bytes were appended
    Data(usize),
    /// The peer closed the connection
    Closed,
    /// Nothing available right now
    WouldBlock,
}

/// Read at most `max` bytes from `socket` and append them to `buf`
pub fn receive(socket: &mut dyn Transport, buf: &mut BytesMut, max: usize) -> io::Result<Received> {
    let start = buf.len();
    buf.resize(start + max, 0);
    let result = loop {
        match socket.read(&mut buf[start..]) {
            Ok(0) => break Ok(Received::Closed),
            Ok(n) => break Ok(Received::Data(n)),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(Received::WouldBlock),
            Err(e) => break Err(e),
        }
    };
    let added = match result {
        Ok(Received::Data(n)) => n,
        _ => 0,
    };
    buf.truncate(start + added);
    result
}

/// Send as much of `pending` as the socket accepts.
///
/// Sent bytes are removed from `pending`. Returns `false` when the socket
/// would block with bytes left over; they stay queued for the next call.
pub fn send_pending(socket: &mut dyn Transport, pending: &mut BytesMut) -> io::Result<bool> {
    while !pending.is_empty() {
        match socket.write(&pending[..]) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "peer stopped accepting data")),
            Ok(n) => pending.advance(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) => return Err(e),
        }
    }
    socket.flush()?;
    Ok(true)
}

/// How long a write may wait without the peer accepting a single byte
pub const WRITE_STALL_LIMIT: Duration = Duration::from_secs(30);

const WRITE_WAIT: Duration = Duration::from_millis(100);

/// Bounds the time a writer spends waiting on a full socket.
///
/// The clock restarts whenever the peer accepts bytes, so a slow peer that
/// keeps draining is never cut off.
pub(crate) struct StallTimer {
    limit: Duration,
    since: Instant,
}

impl StallTimer {
    pub(crate) fn new(limit: Duration) -> Self {
        StallTimer {
            limit,
            since: Instant::now(),
        }
    }

    pub(crate) fn progress(&mut self) {
        self.since = Instant::now();
    }

    /// Wait for the socket to drain; `TimedOut` once the limit passes
    /// without progress
    pub(crate) fn wait(&self, socket: &dyn Transport) -> io::Result<()> {
        let remaining = self
            .limit
            .checked_sub(self.since.elapsed())
            .filter(|left| !left.is_zero())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("peer accepted no data for {:?}", self.limit),
                )
            })?;
        socket.wait_writable(Some(remaining.min(WRITE_WAIT)))?;
        Ok(())
    }
}

/// Send all of `pending`, waiting for writability whenever the socket is
/// full. Fails with `ErrorKind::TimedOut` after `WRITE_STALL_LIMIT` without
/// progress.
pub fn send_all(socket: &mut dyn Transport, pending: &mut BytesMut) -> io::Result<()> {
    send_all_within(socket, pending, WRITE_STALL_LIMIT)
}

/// `send_all` with an explicit stall limit
pub fn send_all_within(socket: &mut dyn Transport, pending: &mut BytesMut, limit: Duration) -> io::Result<()> {
    let mut stall = StallTimer::new(limit);
    loop {
        let before = pending.len();
        if send_pending(socket, pending)? {
            return Ok(());
        }
        if pending.len() < before {
            stall.progress();
        }
        stall.wait(socket)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_receive_would_block_and_data() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        client.set_nonblocking(true).unwrap();
        let (mut server, _) = listener.accept().unwrap();

        let mut buf = BytesMut::new();
        assert_eq!(receive(&mut client, &mut buf, 16).unwrap(), Received::WouldBlock);
        assert!(buf.is_empty());

        server.write_all(b"Hello").unwrap();

        let mut got = 0;
        while got < 5 {
            match receive(&mut client, &mut buf, 16).unwrap() {
                Received::Data(n) => got += n,
                Received::WouldBlock => thread::sleep(Duration::from_millis(5)),
                Received::Closed => panic!("unexpected close"),
            }
        }
        assert_eq!(&buf[..], b"Hello");

        drop(server);
        loop {
            match receive(&mut client, &mut buf, 16).unwrap() {
                Received::Closed => break,
                Received::WouldBlock => thread::sleep(Duration::from_millis(5)),
                Received::Data(_) => panic!("unexpected data"),
            }
        }
    }

    #[test]
    fn test_send_all_delivers_everything() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut data = Vec::new();
            stream.read_to_end(&mut data).unwrap();
            data.len()
        });

        let mut client = TcpStream::connect(addr).unwrap();
        client.set_nonblocking(true).unwrap();
        let mut pending = BytesMut::from(&vec![0x5a; 1 << 20][..]);
        send_all(&mut client, &mut pending).unwrap();
        assert!(pending.is_empty());
        drop(client);

        assert_eq!(handle.join().unwrap(), 1 << 20);
    }

    /// Accepts `room` bytes, then stays full forever
    struct Clogged {
        room: usize,
    }

    impl Read for Clogged {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::ErrorKind::WouldBlock.into())
        }
    }

    impl Write for Clogged {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.room == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.room);
            self.room -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Transport for Clogged {
        fn wait_writable(&self, timeout: Option<Duration>) -> io::Result<bool> {
            thread::sleep(timeout.unwrap_or(Duration::from_millis(5)));
            Ok(false)
        }
    }

    #[test]
    fn test_send_all_gives_up_on_stalled_peer() {
        let mut socket = Clogged { room: 10 };
        let mut pending = BytesMut::from(&[0u8; 64][..]);
        let started = Instant::now();

        let err = send_all_within(&mut socket, &mut pending, Duration::from_millis(50)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        // What the peer took is gone; the rest stays queued
        assert_eq!(pending.len(), 54);
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_stall_timer_restarts_on_progress() {
        let socket = Clogged { room: 0 };
        let mut stall = StallTimer::new(Duration::from_millis(30));
        thread::sleep(Duration::from_millis(40));
        assert_eq!(stall.wait(&socket).unwrap_err().kind(), io::ErrorKind::TimedOut);

        stall.progress();
        assert!(stall.wait(&socket).is_ok());
    }
}
