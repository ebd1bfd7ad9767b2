//! Entry point: parses the config, binds the listener, forks one worker
//! process per configured upstream, and runs the dispatcher in the parent.

use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::os::unix::io::{FromRawFd, IntoRawFd};
use std::process::ExitCode;

use clap::Parser;
use log::{error, info, LevelFilter};
use mio::net::{TcpListener, UnixStream};
use nix::unistd::{fork, ForkResult};
use socket2::{Domain, Socket, Type};

use relaypoold::config::{self, Cli, HostDescriptor};
use relaypoold::dispatcher::{Dispatcher, WorkerHandle};
use relaypoold::error::StartupError;
use relaypoold::signals;
use relaypoold::worker::Worker;

/// `mio::net::TcpListener::bind` hardcodes a backlog of 1024; the original
/// proxy uses 5. Build the socket by hand with `socket2` so the backlog is
/// ours to choose, then hand the fd to `mio`.
const LISTEN_BACKLOG: i32 = 5;

fn bind_listener(addr: SocketAddr) -> std::io::Result<StdTcpListener> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

fn init_logging(debug: bool) {
    let level = if debug { LevelFilter::Debug } else { LevelFilter::Info };
    env_logger::Builder::new().filter_level(level).init();
}

fn run() -> Result<(), StartupError> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let config = config::load(&cli.config)?;
    signals::ignore_sigpipe().map_err(StartupError::Signal)?;

    info!("listening on {}", config.listen);

    // One listener, bound once and inherited by every forked worker — the
    // kernel fans out `accept()` races across whichever process the
    // dispatcher has just told to go looking. Each fork also gets a private
    // control-channel socketpair, wired up before the fork so each half
    // lands in the right process without any fd passing.
    let std_listener = bind_listener(config.listen).map_err(|source| StartupError::Listen {
        addr: config.listen.to_string(),
        source,
    })?;

    let mut children = Vec::with_capacity(config.upstreams.len());

    for (idx, host) in config.upstreams.iter().enumerate() {
        let (dispatcher_half, worker_half) =
            UnixStream::pair().map_err(StartupError::ControlChannel)?;
        let worker_listener_fd = std_listener
            .try_clone()
            .map_err(|source| StartupError::Listen {
                addr: config.listen.to_string(),
                source,
            })?;

        match unsafe { fork() }.map_err(StartupError::Fork)? {
            ForkResult::Parent { child } => {
                drop(worker_half);
                drop(worker_listener_fd);
                children.push(WorkerHandle {
                    pid: Some(child),
                    control: dispatcher_half,
                    utilization: 0,
                });
            }
            ForkResult::Child => {
                drop(dispatcher_half);
                run_worker(idx, host.clone(), worker_listener_fd, worker_half);
                std::process::exit(0);
            }
        }
    }

    let listener = unsafe { TcpListener::from_raw_fd(std_listener.into_raw_fd()) };
    let dispatcher = Dispatcher::new(listener, children).map_err(StartupError::EventLoop)?;
    dispatcher.run();
    Ok(())
}

fn run_worker(idx: usize, host: HostDescriptor, std_listener: StdTcpListener, control: UnixStream) {
    let upstream_addr = SocketAddr::new(host.addr, host.port);
    let listener = unsafe { TcpListener::from_raw_fd(std_listener.into_raw_fd()) };

    match Worker::new(idx, host, upstream_addr, listener, control) {
        Ok(worker) => worker.run(),
        Err(e) => error!("worker {idx}: failed to start: {e}"),
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("relaypoold: {e}");
            ExitCode::FAILURE
        }
    }
}
