//! Shared command-line plumbing for the demo milter applications.
//!
//! Every app exposes the same base surface — bind host, bind port, log
//! level — with each option also readable from a `MILTERD_*` environment
//! variable.

use clap::Args;
use tracing_subscriber::EnvFilter;

use milterd_core::{DEFAULT_LISTENING_HOST, DEFAULT_LISTENING_PORT};

/// Options common to all demo milters.
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Address to listen on for MTA connections.
    #[arg(long, default_value = DEFAULT_LISTENING_HOST, env = "MILTERD_BIND_HOST")]
    pub bind_host: String,

    /// TCP port to listen on.
    #[arg(long, default_value_t = DEFAULT_LISTENING_PORT, env = "MILTERD_BIND_PORT")]
    pub bind_port: u16,

    /// Log level: trace, debug, info, warn or error.
    #[arg(long, default_value = "info", env = "MILTERD_LOG_LEVEL")]
    pub log_level: String,
}

/// Init tracing from `RUST_LOG` when set, the `--log-level` flag
/// otherwise.
pub fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
