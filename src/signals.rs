//! The self-pipe signal funnel.
//!
//! Signal handlers are only allowed to call async-signal-safe functions, so
//! the handler itself does nothing more than write one byte naming the
//! signal into a pipe; the event loop drains that pipe as an ordinary
//! readable event and reacts synchronously. We lean on `signal_hook`'s
//! `low_level::pipe` module for the handler-registration half of this
//! (exactly the self-pipe helper it documents), and wrap the read end with
//! `mio` for the event-loop half.
//!
//! Must be installed after `fork`: each process needs its own pipe, since
//! the handler for a signal delivered to a worker must wake only that
//! worker's loop.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;

use mio::net::UnixStream;
use signal_hook::consts::{SIGCHLD, SIGINT, SIGTERM};

use crate::readiness::set_nonblocking;

pub struct SignalFunnel {
    pub read: UnixStream,
}

impl SignalFunnel {
    /// Creates the pipe and registers its write end for SIGTERM, SIGINT,
    /// and SIGCHLD. SIGPIPE is handled separately (see `ignore_sigpipe`);
    /// it is ignored process-wide, not funneled.
    pub fn install() -> io::Result<Self> {
        let (write, read) = StdUnixStream::pair()?;

        for &sig in &[SIGTERM, SIGINT, SIGCHLD] {
            let writer = write.try_clone()?;
            signal_hook::low_level::pipe::register(sig, writer)?;
        }
        // `write` itself is dropped here; each registered clone keeps the
        // underlying fd (and thus the pipe) alive.
        drop(write);

        read.set_nonblocking(true)?;
        let read = unsafe { UnixStream::from_raw_fd(read.into_raw_fd()) };
        Ok(SignalFunnel { read })
    }

    pub fn fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Int,
    Chld,
    Unknown(u8),
}

/// Drains the pipe and decodes every signal byte written since the last
/// drain. Order within a drain matches delivery order, but distinct
/// signals that arrive between drains are coalesced onto the same wakeup
/// by the kernel (ordinary self-pipe behavior).
pub fn drain(read: &mut UnixStream) -> io::Result<Vec<Signal>> {
    use std::io::Read;
    let mut buf = [0u8; 1024];
    let mut signals = Vec::new();
    loop {
        match read.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                for &b in &buf[..n] {
                    signals.push(decode(b as i32));
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(signals)
}

fn decode(sig: i32) -> Signal {
    if sig == SIGTERM {
        Signal::Term
    } else if sig == SIGINT {
        Signal::Int
    } else if sig == SIGCHLD {
        Signal::Chld
    } else {
        Signal::Unknown(sig as u8)
    }
}

/// Ignores SIGPIPE process-wide so writes to a peer-closed socket return
/// `EPIPE` instead of terminating the process. Must be called once before
/// fork so every child inherits the disposition.
pub fn ignore_sigpipe() -> io::Result<()> {
    unsafe {
        if libc::signal(libc::SIGPIPE, libc::SIG_IGN) == libc::SIG_ERR {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
