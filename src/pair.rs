//! The relay buffer / connection pair: the bidirectional byte-pump state
//! machine at the center of the proxy.
//!
//! Buffers are linear, not circular — they only refill once fully drained.
//! `BUFFER_FULL` is therefore an ordinary back-pressure signal, not an
//! error: the opposite direction must be given write-readiness before the
//! buffer can accept more. Every read/write call drains until the kernel
//! reports "would block", which is required for edge-triggered
//! correctness — the readiness layer will not re-notify otherwise.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

use mio::net::TcpStream;

/// Default per-direction buffer capacity. A few KiB to tens of KiB per the
/// design; 16 KiB keeps per-pair memory (2 * B) modest while still
/// amortizing syscalls reasonably for bulk transfers.
pub const DEFAULT_BUF_SIZE: usize = 16 * 1024;

/// Result taxonomy shared by every buffer operation. See SPEC_FULL.md §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetCode {
    Ok,
    Nothing,
    BufferFull,
    BufferEmpty,
    TryAgain,
    IoErr,
    Closed,
}

/// A fixed-capacity, non-circular byte buffer with a write position
/// (`read_idx`, where new bytes land) and a drain position (`write_idx`,
/// the next byte to forward). Invariant: `0 <= write_idx <= read_idx <=
/// capacity`.
struct DirectionBuffer {
    buf: Vec<u8>,
    read_idx: usize,
    write_idx: usize,
}

impl DirectionBuffer {
    fn new(capacity: usize) -> Self {
        DirectionBuffer {
            buf: vec![0u8; capacity],
            read_idx: 0,
            write_idx: 0,
        }
    }

    fn reset(&mut self) {
        self.read_idx = 0;
        self.write_idx = 0;
    }

    /// Drains `source` into this buffer until the buffer is full, the peer
    /// closes, a fatal error occurs, or the kernel reports would-block.
    fn fill_from(&mut self, source: &mut TcpStream) -> RetCode {
        loop {
            if self.read_idx >= self.buf.len() {
                return RetCode::BufferFull;
            }
            match source.read(&mut self.buf[self.read_idx..]) {
                Ok(0) => return RetCode::Closed,
                Ok(n) => self.read_idx += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return RetCode::IoErr,
            }
        }
        if self.read_idx > self.write_idx {
            RetCode::Ok
        } else {
            RetCode::Nothing
        }
    }

    /// Drains this buffer into `dest` from `write_idx` up to `read_idx`.
    fn drain_into(&mut self, dest: &mut TcpStream) -> RetCode {
        loop {
            if self.write_idx >= self.read_idx {
                self.reset();
                return RetCode::BufferEmpty;
            }
            match dest.write(&self.buf[self.write_idx..self.read_idx]) {
                Ok(0) => return RetCode::Closed,
                Ok(n) => self.write_idx += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return RetCode::TryAgain,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return RetCode::IoErr,
            }
        }
    }
}

/// The composite (client-fd, upstream-fd, buffers, indices) representing
/// one active proxied session, plus the still-idle upstream-only state it
/// carries between client sessions.
pub struct Pair {
    pub client: Option<TcpStream>,
    pub client_addr: Option<SocketAddr>,
    pub upstream: TcpStream,
    pub upstream_addr: SocketAddr,
    pub upstream_closed: bool,
    clt_buf: DirectionBuffer,
    srv_buf: DirectionBuffer,
}

impl Pair {
    pub fn new(upstream: TcpStream, upstream_addr: SocketAddr, buf_size: usize) -> Self {
        Pair {
            client: None,
            client_addr: None,
            upstream,
            upstream_addr,
            upstream_closed: false,
            clt_buf: DirectionBuffer::new(buf_size),
            srv_buf: DirectionBuffer::new(buf_size),
        }
    }

    pub fn client_fd(&self) -> Option<RawFd> {
        self.client.as_ref().map(|c| c.as_raw_fd())
    }

    pub fn upstream_fd(&self) -> RawFd {
        self.upstream.as_raw_fd()
    }

    pub fn bind_client(&mut self, client: TcpStream, client_addr: SocketAddr) {
        self.client = Some(client);
        self.client_addr = Some(client_addr);
    }

    /// Zeroes both buffers' indices, clears `upstream_closed`, and releases
    /// the client-fd association. A no-op on an already-idle pair.
    pub fn reset(&mut self) {
        self.clt_buf.reset();
        self.srv_buf.reset();
        self.upstream_closed = false;
        self.client = None;
        self.client_addr = None;
    }

    pub fn read_from_client(&mut self) -> RetCode {
        let client = self.client.as_mut().expect("read_from_client on unbound pair");
        self.clt_buf.fill_from(client)
    }

    pub fn read_from_upstream(&mut self) -> RetCode {
        self.srv_buf.fill_from(&mut self.upstream)
    }

    pub fn write_to_upstream(&mut self) -> RetCode {
        self.clt_buf.drain_into(&mut self.upstream)
    }

    pub fn write_to_client(&mut self) -> RetCode {
        let client = self.client.as_mut().expect("write_to_client on unbound pair");
        self.srv_buf.drain_into(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::{TcpListener, TcpStream as MioTcpStream};
    use std::net::TcpStream as StdTcpStream;
    use std::time::Duration;

    fn loopback_pair() -> (MioTcpStream, StdTcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let client = StdTcpStream::connect(addr).unwrap();
        client.set_nonblocking(true).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let (server_side, _) = listener.accept().unwrap();
        (server_side, client)
    }

    #[test]
    fn reset_on_idle_pair_is_a_noop() {
        let (upstream, _keep_alive) = loopback_pair();
        let addr = upstream.peer_addr().unwrap();
        let mut pair = Pair::new(upstream, addr, 64);
        pair.reset();
        assert!(pair.client.is_none());
        assert!(!pair.upstream_closed);
    }

    #[test]
    fn buffer_full_then_empty_cycle() {
        let (upstream, mut peer) = loopback_pair();
        let addr = upstream.peer_addr().unwrap();
        // Buffer capacity 4: writing 4 bytes from the "client" side of the
        // upstream's peer should report BUFFER_FULL once full.
        let mut pair = Pair::new(upstream, addr, 4);
        use std::io::Write as _;
        peer.write_all(b"abcd").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let res = pair.read_from_upstream();
        assert_eq!(res, RetCode::BufferFull);

        // Draining to "client" is simulated directly since no client is
        // bound in this unit test; verify srv_buf holds exactly 4 bytes by
        // writing to upstream instead (symmetry check via write_to_upstream
        // path after swapping roles is covered by the echo integration
        // test in tests/echo.rs).
        assert_eq!(pair.srv_buf.read_idx, 4);
        assert_eq!(pair.srv_buf.write_idx, 0);
    }
}
