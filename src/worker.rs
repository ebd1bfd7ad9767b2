//! The per-upstream worker event loop.
//!
//! One worker process per configured upstream. It owns a connection pool
//! for that single upstream, accepts clients handed off by the dispatcher,
//! and drives the relay state machine until told to stop.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use log::{debug, info, warn};
use mio::net::{TcpListener, UnixStream};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;

use crate::config::HostDescriptor;
use crate::pool::{Op, Pool};
use crate::readiness::Readiness;
use crate::signals::{self, Signal, SignalFunnel};

/// Multiplexer wait timeout; on timeout the pool's repair sweep runs.
const WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_EVENTS: usize = 10_000;

pub struct Worker {
    idx: usize,
    listener: TcpListener,
    control: UnixStream,
    signals: SignalFunnel,
    readiness: Readiness,
    pool: Pool,
    stop: bool,
}

impl Worker {
    pub fn new(
        idx: usize,
        host: HostDescriptor,
        upstream_addr: SocketAddr,
        listener: TcpListener,
        mut control: UnixStream,
    ) -> io::Result<Self> {
        let readiness = Readiness::new(MAX_EVENTS)?;
        let mut signals = SignalFunnel::install()?;

        readiness.register_source(
            &mut control,
            crate::readiness::token_for(control.as_raw_fd()),
            mio::Interest::READABLE,
        )?;
        readiness.register_source(
            &mut signals.read,
            crate::readiness::token_for(signals.read.as_raw_fd()),
            mio::Interest::READABLE,
        )?;

        let pool = Pool::new(host, upstream_addr, &readiness);

        Ok(Worker {
            idx,
            listener,
            control,
            signals,
            readiness,
            pool,
            stop: false,
        })
    }

    fn notify_utilization(&mut self) {
        let used = self.pool.used_count().min(u8::MAX as usize) as u8;
        match self.control.write(&[used]) {
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                warn!("worker {}: control channel full, utilization update dropped", self.idx);
            }
            Err(e) => warn!("worker {}: failed to send utilization update: {e}", self.idx),
        }
    }

    fn handle_control_readable(&mut self) {
        let mut byte = [0u8; 1];
        match self.control.read(&mut byte) {
            Ok(0) => {} // dispatcher closed; shutdown will arrive via signal
            Ok(_) => {
                match self.listener.accept() {
                    Ok((client, addr)) => match self.pool.pick(client, addr, &self.readiness) {
                        Some(_) => self.notify_utilization(),
                        None => {
                            warn!("worker {}: no idle upstream socket for new client", self.idx);
                        }
                    },
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        debug!("worker {}: handoff raced an empty listener, dropped", self.idx);
                    }
                    Err(e) => warn!("worker {}: accept failed: {e}", self.idx),
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => warn!("worker {}: control channel read error: {e}", self.idx),
        }
    }

    fn handle_signals(&mut self) {
        let signals = match signals::drain(&mut self.signals.read) {
            Ok(s) => s,
            Err(e) => {
                warn!("worker {}: signal pipe read error: {e}", self.idx);
                return;
            }
        };
        for sig in signals {
            match sig {
                Signal::Term | Signal::Int => self.stop = true,
                Signal::Chld => {
                    // Defensive: workers are leaves and do not have
                    // children, but reap anyway in case one is ever added.
                    while let Ok(status) = waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                        if matches!(status, nix::sys::wait::WaitStatus::StillAlive) {
                            break;
                        }
                    }
                }
                Signal::Unknown(_) => {}
            }
        }
    }

    pub fn run(mut self) {
        info!("worker {} starting, {} upstream slots", self.idx, self.pool.total_tracked());
        let control_fd = self.control.as_raw_fd();
        let signal_fd = self.signals.fd();

        while !self.stop {
            let n = match self.readiness.wait(Some(WAIT_TIMEOUT)) {
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("worker {}: epoll failure: {e}", self.idx);
                    break;
                }
            };

            if n == 0 {
                self.pool.recycle(&self.readiness);
                continue;
            }

            let tokens: Vec<(usize, bool, bool)> = self
                .readiness
                .events()
                .iter()
                .map(|e| (e.token().0, e.is_readable(), e.is_writable()))
                .collect();

            for (token, readable, writable) in tokens {
                let fd = token as i32;
                if fd == control_fd && readable {
                    self.handle_control_readable();
                } else if fd == signal_fd && readable {
                    self.handle_signals();
                } else {
                    if writable && self.pool.finish_connecting(fd, &self.readiness) {
                        continue;
                    }
                    if readable {
                        let res = self.pool.process(fd, Op::Read, &self.readiness);
                        if res == crate::pair::RetCode::Closed {
                            self.notify_utilization();
                        }
                    }
                    if writable {
                        let res = self.pool.process(fd, Op::Write, &self.readiness);
                        if res == crate::pair::RetCode::Closed {
                            self.notify_utilization();
                        }
                    }
                }
            }
        }

        info!("worker {} stopping", self.idx);
    }
}
