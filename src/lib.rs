//! Library surface for `relaypoold`: the config parser, the relay state
//! machine, the connection pool, and the two process roles (dispatcher and
//! worker) that drive them. `main.rs` is a thin binary shell around this.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod pair;
pub mod pool;
pub mod readiness;
pub mod signals;
pub mod worker;
