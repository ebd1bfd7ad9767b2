//! Typed error surfaces.
//!
//! Configuration and startup failures are fatal (mapped to exit code 1 in
//! `main`); everything that happens after the worker processes are running
//! is recovered locally by the pool manager and never reaches these types.

use std::io;
use std::net::AddrParseError;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("config file has no `Listen ip:port` line")]
    MissingListen,

    #[error("config file declares no <logical_host> upstream")]
    MissingUpstream,

    #[error("malformed Listen line: {0:?}")]
    MalformedListen(String),

    #[error("invalid listen address: {0}")]
    BadAddr(#[from] AddrParseError),

    #[error("<logical_host> blocks are nested or overlapping")]
    OverlappingHostBlock,

    #[error("<logical_host> block closed without being opened")]
    UnopenedHostBlock,

    #[error("<logical_host> block left open at end of file")]
    UnclosedHostBlock,

    #[error("malformed <{tag}> tag: {value:?}")]
    MalformedTag { tag: &'static str, value: String },

    #[error("<name> is not a valid upstream address: {0:?}")]
    BadUpstreamAddr(String),

    #[error("too many upstreams: {0} (max 16)")]
    TooManyUpstreams(usize),
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to bind listener on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to create control channel: {0}")]
    ControlChannel(#[source] io::Error),

    #[error("fork failed: {0}")]
    Fork(#[source] nix::Error),

    #[error("failed to install signal handler: {0}")]
    Signal(#[source] io::Error),

    #[error("failed to set up the event loop: {0}")]
    EventLoop(#[source] io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
