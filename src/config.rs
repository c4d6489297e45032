//! Plain configuration structs built once from [`crate::cli::Cli`].
//!
//! No config file, no runtime reload — flags only, assembled once at
//! startup and passed by value to everything that needs them.

use std::{path::PathBuf, time::Duration};

/// Upstream SSH server. Immutable for the lifetime of the process.
#[derive(Clone, Debug)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

/// SSH authentication and client-identity knobs.
#[derive(Clone, Debug)]
pub struct SshOptions {
    pub login: String,
    pub identities: Vec<PathBuf>,
    pub password: Option<String>,
    pub hosts_file: PathBuf,
    pub client_version: Option<String>,
}

/// Steady-state sizing and timing for the SSH pool.
#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    pub size: usize,
    pub backoff: Duration,
    pub connect_timeout: Duration,
    pub connect_rate: f64,
}

/// Local bind address/port and listener kind.
#[derive(Clone, Debug)]
pub struct ListenConfig {
    pub bind_address: String,
    pub bind_port: u16,
    pub transparent: bool,
}

/// Everything the daemon needs, assembled once at startup from [`crate::cli::Cli`].
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub target: Target,
    pub ssh: SshOptions,
    pub pool: PoolConfig,
    pub listen: ListenConfig,
}
