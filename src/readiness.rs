//! Thin wrapper over `mio`'s edge-triggered readiness multiplexer.
//!
//! Every fd registered here is edge-triggered: after a notification the
//! consumer must drain the fd until it sees "would block" or it will not be
//! notified again for that direction. `modify` replaces the interest set; it
//! does not OR-merge with what was registered before.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use mio::event::Source;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token};

/// Identifies a registered fd. We use the raw fd value itself as the token,
/// which keeps fd -> owner lookups a single map indirection, matching the
/// original's `epoll_event.data.fd` usage directly.
pub fn token_for(fd: RawFd) -> Token {
    Token(fd as usize)
}

pub struct Readiness {
    poll: Poll,
    events: Events,
}

impl Readiness {
    pub fn new(event_capacity: usize) -> io::Result<Self> {
        Ok(Readiness {
            poll: Poll::new()?,
            events: Events::with_capacity(event_capacity),
        })
    }

    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    pub fn register_read(&self, fd: RawFd) -> io::Result<()> {
        self.registry()
            .register(&mut SourceFd(&fd), token_for(fd), Interest::READABLE)
    }

    pub fn register_write(&self, fd: RawFd) -> io::Result<()> {
        self.registry()
            .register(&mut SourceFd(&fd), token_for(fd), Interest::WRITABLE)
    }

    pub fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.registry()
            .reregister(&mut SourceFd(&fd), token_for(fd), interest)
    }

    pub fn unregister(&self, fd: RawFd) -> io::Result<()> {
        self.registry().deregister(&mut SourceFd(&fd))
    }

    /// Registers an arbitrary `Source` (a `TcpListener`, `UnixStream`, ...)
    /// rather than a bare fd.
    pub fn register_source<S: Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.registry().register(source, token, interest)
    }

    /// Blocks for up to `timeout`, returning the number of ready events.
    /// Zero means the wait timed out with nothing ready.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        self.poll.poll(&mut self.events, timeout)?;
        Ok(self.events.iter().count())
    }

    pub fn events(&self) -> &Events {
        &self.events
    }
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
