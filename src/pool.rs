//! The upstream connection pool: owns every upstream socket for one worker
//! and lends/reclaims pairs as clients arrive and depart.
//!
//! A pair lives in exactly one of four sets at a time: `connecting`
//! (upstream handshake not yet confirmed, registered for write-readiness
//! only), `idle` (upstream established, no client), `in_use` (bound to a
//! client, registered twice — once under the client fd, once under the
//! upstream fd, so either fd resolves the pair in O(1)), and
//! `awaiting_repair` (both sides torn down, waiting for a fresh upstream
//! connect on the next idle tick).

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use log::{debug, error, info, warn};
use mio::net::TcpStream;
use mio::Interest;

use crate::config::HostDescriptor;
use crate::pair::{Pair, RetCode, DEFAULT_BUF_SIZE};
use crate::readiness::Readiness;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Read,
    Write,
}

pub type Handle = Rc<RefCell<Pair>>;

pub struct Pool {
    host: HostDescriptor,
    upstream_addr: SocketAddr,
    buf_size: usize,
    connecting: HashMap<RawFd, Handle>,
    idle: VecDeque<Handle>,
    in_use: HashMap<RawFd, Handle>,
    awaiting_repair: Vec<Handle>,
    used_count: usize,
}

fn connect(addr: SocketAddr) -> std::io::Result<TcpStream> {
    TcpStream::connect(addr)
}

impl Pool {
    /// Opens `host.conncnt` connections to `host`. `TcpStream::connect` is
    /// non-blocking: the handshake may still be in progress when it
    /// returns, so a freshly opened socket goes into `connecting` —
    /// registered for write-readiness only — and only moves to `idle` once
    /// `finish_connecting` confirms the connect actually completed.
    /// Failures in the connect syscall itself are logged, not fatal; the
    /// pool may come up partially populated and top itself up on later
    /// `recycle()` sweeps.
    pub fn new(host: HostDescriptor, upstream_addr: SocketAddr, readiness: &Readiness) -> Self {
        let mut connecting = HashMap::new();
        for i in 0..host.conncnt {
            match connect(upstream_addr) {
                Ok(stream) => {
                    let fd = std::os::unix::io::AsRawFd::as_raw_fd(&stream);
                    let handle = Rc::new(RefCell::new(Pair::new(stream, upstream_addr, DEFAULT_BUF_SIZE)));
                    if let Err(e) = readiness.register_write(fd) {
                        warn!("failed to register connecting socket {i} (fd {fd}): {e}");
                    }
                    connecting.insert(fd, handle);
                    debug!("connecting socket {i} to server, fd {fd}");
                }
                Err(e) => {
                    error!("build connection {i} failed: {e}");
                }
            }
        }
        Pool {
            host,
            upstream_addr,
            buf_size: DEFAULT_BUF_SIZE,
            connecting,
            idle: VecDeque::new(),
            in_use: HashMap::new(),
            awaiting_repair: Vec::new(),
            used_count: 0,
        }
    }

    pub fn host(&self) -> &HostDescriptor {
        &self.host
    }

    /// Total sockets held across all four sets; invariant per
    /// SPEC_FULL.md §8.2, it should equal `host.conncnt` at rest (modulo
    /// connect failures that never made it into any set).
    pub fn total_tracked(&self) -> usize {
        self.connecting.len() + self.idle.len() + self.in_use.len() / 2 + self.awaiting_repair.len()
    }

    /// Finalizes a connect attempt once its fd reports write-readiness.
    /// Returns `true` if `fd` belonged to a connecting socket (handled,
    /// whichever way it went), `false` if it's not ours to handle.
    pub fn finish_connecting(&mut self, fd: RawFd, readiness: &Readiness) -> bool {
        let handle = match self.connecting.remove(&fd) {
            Some(h) => h,
            None => return false,
        };
        readiness.unregister(fd).ok();

        let established = matches!(handle.borrow().upstream.take_error(), Ok(None));
        if established {
            info!("connect to server success (fd {fd})");
            self.idle.push_back(handle);
        } else {
            error!("connect to server failed (fd {fd})");
            self.awaiting_repair.push(handle);
        }
        true
    }

    pub fn used_count(&self) -> usize {
        self.used_count
    }

    /// Removes an arbitrary pair from `idle`, binds the client side, and
    /// registers both fds for read readiness. Returns `None` if the pool
    /// has no idle upstream socket (the caller must close the client fd).
    pub fn pick(
        &mut self,
        client: TcpStream,
        client_addr: SocketAddr,
        readiness: &Readiness,
    ) -> Option<Handle> {
        let handle = self.idle.pop_front()?;
        let client_fd = std::os::unix::io::AsRawFd::as_raw_fd(&client);
        let upstream_fd = handle.borrow().upstream_fd();

        {
            let mut pair = handle.borrow_mut();
            pair.bind_client(client, client_addr);
        }

        self.in_use.insert(client_fd, handle.clone());
        self.in_use.insert(upstream_fd, handle.clone());
        self.used_count += 1;

        if let Err(e) = readiness.register_read(client_fd) {
            warn!("failed to register client fd {client_fd}: {e}");
        }
        if let Err(e) = readiness.register_read(upstream_fd) {
            warn!("failed to register upstream fd {upstream_fd}: {e}");
        }

        debug!("bind client sock {client_fd} with server sock {upstream_fd}");
        Some(handle)
    }

    /// Unregisters and closes both fds, erases both `in_use` entries,
    /// resets the pair, and queues it for repair.
    pub fn release(&mut self, handle: Handle, readiness: &Readiness) {
        let (client_fd, upstream_fd) = {
            let pair = handle.borrow();
            (pair.client_fd(), pair.upstream_fd())
        };

        if let Some(fd) = client_fd {
            readiness.unregister(fd).ok();
            self.in_use.remove(&fd);
        }
        readiness.unregister(upstream_fd).ok();
        self.in_use.remove(&upstream_fd);

        handle.borrow_mut().reset();
        self.used_count = self.used_count.saturating_sub(1);
        self.awaiting_repair.push(handle);
    }

    /// Attempts to reconnect every awaiting-repair pair to its stored
    /// upstream address. A successful connect syscall moves the pair into
    /// `connecting` (registered for write-readiness) rather than straight
    /// into `idle` — the handshake still needs `finish_connecting` to
    /// confirm it completed. Failures stay put for the next sweep. Called
    /// once per loop iteration when `wait` times out.
    pub fn recycle(&mut self, readiness: &Readiness) {
        if self.awaiting_repair.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.awaiting_repair);
        for handle in pending {
            let addr = handle.borrow().upstream_addr;
            match connect(addr) {
                Ok(stream) => {
                    let fd = std::os::unix::io::AsRawFd::as_raw_fd(&stream);
                    *handle.borrow_mut() = Pair::new(stream, addr, self.buf_size);
                    if let Err(e) = readiness.register_write(fd) {
                        warn!("failed to register reconnecting socket (fd {fd}): {e}");
                    }
                    debug!("reconnecting socket to server, fd {fd}");
                    self.connecting.insert(fd, handle);
                }
                Err(_) => {
                    error!("fix connection failed");
                    self.awaiting_repair.push(handle);
                }
            }
        }
    }

    fn lookup(&self, fd: RawFd) -> Option<Handle> {
        self.in_use.get(&fd).cloned()
    }

    /// The dispatch heart: routes a readiness event for `fd` through the
    /// state machine in SPEC_FULL.md §4.3 and returns whether the pair was
    /// torn down as a result.
    pub fn process(&mut self, fd: RawFd, op: Op, readiness: &Readiness) -> RetCode {
        let handle = match self.lookup(fd) {
            Some(h) => h,
            None => return RetCode::Nothing,
        };

        let client_fd = handle.borrow().client_fd();
        let upstream_fd = handle.borrow().upstream_fd();
        let is_client_side = client_fd == Some(fd);

        if is_client_side {
            let torn_down = match op {
                Op::Read => {
                    let res = handle.borrow_mut().read_from_client();
                    match res {
                        RetCode::Ok | RetCode::BufferFull => {
                            readiness.modify(upstream_fd, Interest::WRITABLE).ok();
                            false
                        }
                        RetCode::IoErr | RetCode::Closed => {
                            self.release(handle.clone(), readiness);
                            return RetCode::Closed;
                        }
                        _ => false,
                    }
                }
                Op::Write => {
                    let res = handle.borrow_mut().write_to_client();
                    match res {
                        RetCode::TryAgain => {
                            readiness
                                .modify(fd, Interest::WRITABLE)
                                .ok();
                            false
                        }
                        RetCode::BufferEmpty => {
                            readiness.modify(upstream_fd, Interest::READABLE).ok();
                            readiness.modify(fd, Interest::READABLE).ok();
                            false
                        }
                        RetCode::IoErr | RetCode::Closed => {
                            self.release(handle.clone(), readiness);
                            return RetCode::Closed;
                        }
                        _ => false,
                    }
                }
            };
            let _ = torn_down;
            if handle.borrow().upstream_closed {
                self.release(handle, readiness);
                return RetCode::Closed;
            }
            RetCode::Ok
        } else if upstream_fd == fd {
            let client_fd = match client_fd {
                Some(fd) => fd,
                None => return RetCode::Nothing,
            };
            match op {
                Op::Read => {
                    let res = handle.borrow_mut().read_from_upstream();
                    match res {
                        RetCode::Ok | RetCode::BufferFull => {
                            readiness.modify(client_fd, Interest::WRITABLE).ok();
                        }
                        RetCode::IoErr | RetCode::Closed => {
                            readiness.modify(client_fd, Interest::WRITABLE).ok();
                            handle.borrow_mut().upstream_closed = true;
                        }
                        _ => {}
                    }
                }
                Op::Write => {
                    let res = handle.borrow_mut().write_to_upstream();
                    match res {
                        RetCode::TryAgain => {
                            readiness.modify(fd, Interest::WRITABLE).ok();
                        }
                        RetCode::BufferEmpty => {
                            readiness.modify(client_fd, Interest::READABLE).ok();
                            readiness.modify(fd, Interest::READABLE).ok();
                        }
                        RetCode::IoErr | RetCode::Closed => {
                            readiness.modify(client_fd, Interest::WRITABLE).ok();
                            handle.borrow_mut().upstream_closed = true;
                        }
                        _ => {}
                    }
                }
            }
            RetCode::Ok
        } else {
            RetCode::Nothing
        }
    }
}
