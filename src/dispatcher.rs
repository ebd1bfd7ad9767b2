//! The dispatcher: owns the listening socket, tracks worker utilization,
//! and hands off each new client to the least-busy worker.

use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use log::{info, warn};
use mio::net::{TcpListener, UnixStream};
use nix::sys::signal::{kill, Signal as NixSignal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::readiness::Readiness;
use crate::signals::{self, Signal, SignalFunnel};

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_EVENTS: usize = 10_000;

pub struct WorkerHandle {
    pub pid: Option<Pid>,
    pub control: UnixStream,
    pub utilization: u8,
}

pub struct Dispatcher {
    listener: TcpListener,
    workers: Vec<WorkerHandle>,
    signals: SignalFunnel,
    readiness: Readiness,
    stop: bool,
}

impl Dispatcher {
    pub fn new(mut listener: TcpListener, mut workers: Vec<WorkerHandle>) -> io::Result<Self> {
        let readiness = Readiness::new(MAX_EVENTS)?;
        let mut signals = SignalFunnel::install()?;

        readiness.register_source(
            &mut listener,
            crate::readiness::token_for(listener.as_raw_fd()),
            mio::Interest::READABLE,
        )?;
        readiness.register_source(
            &mut signals.read,
            crate::readiness::token_for(signals.read.as_raw_fd()),
            mio::Interest::READABLE,
        )?;
        for w in workers.iter_mut() {
            readiness.register_source(
                &mut w.control,
                crate::readiness::token_for(w.control.as_raw_fd()),
                mio::Interest::READABLE,
            )?;
        }

        Ok(Dispatcher {
            listener,
            workers,
            signals,
            readiness,
            stop: false,
        })
    }

    /// `argmin_i worker[i].utilization`, lowest index wins ties.
    fn least_busy(&self) -> Option<usize> {
        self.workers
            .iter()
            .enumerate()
            .filter(|(_, w)| w.pid.is_some())
            .min_by_key(|(_, w)| w.utilization)
            .map(|(i, _)| i)
    }

    fn handle_listener_readable(&mut self) {
        let idx = match self.least_busy() {
            Some(i) => i,
            None => {
                warn!("dispatcher: no live workers to dispatch to");
                return;
            }
        };
        let worker = &mut self.workers[idx];
        match worker.control.write(&[1u8]) {
            Ok(_) => {
                worker.utilization = worker.utilization.saturating_add(1);
                info!("send request to child {idx}");
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                warn!("dispatcher: control channel to worker {idx} full, handoff dropped");
            }
            Err(e) => warn!("dispatcher: failed to notify worker {idx}: {e}"),
        }
    }

    fn handle_worker_readable(&mut self, idx: usize) {
        let mut byte = [0u8; 1];
        match self.workers[idx].control.read(&mut byte) {
            Ok(0) | Err(_) => {}
            Ok(_) => self.workers[idx].utilization = byte[0],
        }
    }

    fn reap_children(&mut self) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, _)) | Ok(WaitStatus::Signaled(pid, _, _)) => {
                    if let Some(w) = self.workers.iter_mut().find(|w| w.pid == Some(pid)) {
                        info!("child {pid} join");
                        w.pid = None;
                    }
                }
                _ => break,
            }
        }
        if self.workers.iter().all(|w| w.pid.is_none()) {
            self.stop = true;
        }
    }

    fn handle_signals(&mut self) {
        let signals = match signals::drain(&mut self.signals.read) {
            Ok(s) => s,
            Err(e) => {
                warn!("dispatcher: signal pipe read error: {e}");
                return;
            }
        };
        for sig in signals {
            match sig {
                Signal::Term | Signal::Int => {
                    info!("kill all the child now");
                    for w in &self.workers {
                        if let Some(pid) = w.pid {
                            let _ = kill(pid, NixSignal::SIGTERM);
                        }
                    }
                }
                Signal::Chld => self.reap_children(),
                Signal::Unknown(_) => {}
            }
        }
    }

    pub fn run(mut self) {
        info!("dispatcher starting with {} workers", self.workers.len());
        let listener_fd = self.listener.as_raw_fd();
        let signal_fd = self.signals.fd();
        let control_fds: Vec<i32> = self.workers.iter().map(|w| w.control.as_raw_fd()).collect();

        while !self.stop {
            let n = match self.readiness.wait(Some(WAIT_TIMEOUT)) {
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("dispatcher: epoll failure: {e}");
                    break;
                }
            };
            if n == 0 {
                continue;
            }

            let tokens: Vec<(usize, bool)> = self
                .readiness
                .events()
                .iter()
                .map(|e| (e.token().0, e.is_readable()))
                .collect();

            for (token, readable) in tokens {
                if !readable {
                    continue;
                }
                let fd = token as i32;
                if fd == listener_fd {
                    self.handle_listener_readable();
                } else if fd == signal_fd {
                    self.handle_signals();
                } else if let Some(idx) = control_fds.iter().position(|&f| f == fd) {
                    self.handle_worker_readable(idx);
                }
            }
        }

        info!("dispatcher exiting");
    }
}
