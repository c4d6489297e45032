//! Command-line surface for the `rsp` daemon binary.

use std::{path::PathBuf, time::Duration};

use clap::Parser;

use crate::{
    config::{ListenConfig, PoolConfig, RuntimeConfig, SshOptions, Target},
    error::{Error, Result},
};

#[derive(Parser, Debug)]
#[command(
    name = "rsp",
    about = "Rapid SSH Proxy — SOCKS5 / transparent-redirect front end over a warm pool of SSH connections"
)]
pub struct Cli {
    /// Target SSH server hostname.
    pub dst_address: String,

    /// Target SSH server port.
    #[arg(default_value_t = 22)]
    pub dst_port: u16,

    /// Logging verbosity (passed to `RUST_LOG` style env-filter as a default).
    #[arg(short = 'v', long, default_value = "info")]
    pub verbosity: String,

    /// Log file location; stderr if unset.
    #[arg(short = 'l', long, value_name = "FILE")]
    pub logfile: Option<PathBuf>,

    /// Local bind address.
    #[arg(short = 'a', long = "bind-address", default_value = "127.0.0.1")]
    pub bind_address: String,

    /// Local bind port.
    #[arg(short = 'p', long = "bind-port", default_value_t = 1080)]
    pub bind_port: u16,

    /// Transparent-redirect mode (reads `SO_ORIGINAL_DST` instead of a SOCKS5 prologue).
    #[arg(short = 'T', long)]
    pub transparent: bool,

    /// Steady pool target size.
    #[arg(short = 'n', long = "pool-size", default_value_t = 30)]
    pub pool_size: usize,

    /// Reconnect backoff, in seconds, after a failed upstream connect.
    #[arg(short = 'B', long, default_value_t = 5.0)]
    pub backoff: f64,

    /// SSH connect / channel-open timeout, in seconds.
    #[arg(short = 'w', long, default_value_t = 4.0)]
    pub timeout: f64,

    /// Maximum new pool connects per second.
    #[arg(short = 'r', long = "connect-rate", default_value_t = 0.5)]
    pub connect_rate: f64,

    /// SSH login name; defaults to the current OS user.
    #[arg(short = 'L', long)]
    pub login: Option<String>,

    /// SSH private key file; repeatable.
    #[arg(short = 'I', long = "identity", value_name = "KEY_FILE")]
    pub identity: Vec<PathBuf>,

    /// SSH password; if unset, password auth is disabled.
    #[arg(short = 'P', long)]
    pub password: Option<String>,

    /// Known-hosts file location.
    #[arg(short = 'H', long = "hosts-file", value_name = "FILE")]
    pub hosts_file: Option<PathBuf>,

    /// Override the SSH client version string sent during the handshake.
    #[arg(long)]
    pub client_version: Option<String>,
}

/// Default `~/.rsp/known_hosts`, falling back to the current directory
/// if `$HOME` is unset.
pub fn default_hosts_file() -> PathBuf {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    home.join(".rsp").join("known_hosts")
}

impl Cli {
    /// Validate flag ranges that `clap`'s type system can't express, then
    /// assemble the immutable [`RuntimeConfig`] the rest of the daemon runs
    /// from.
    pub fn into_runtime_config(self) -> Result<RuntimeConfig> {
        if self.pool_size == 0 {
            return Err(Error::InvalidFlag {
                flag: "--pool-size",
                value: self.pool_size.to_string(),
            });
        }
        if self.backoff <= 0.0 {
            return Err(Error::InvalidFlag {
                flag: "--backoff",
                value: self.backoff.to_string(),
            });
        }
        if self.timeout <= 0.0 {
            return Err(Error::InvalidFlag {
                flag: "--timeout",
                value: self.timeout.to_string(),
            });
        }
        if self.connect_rate <= 0.0 {
            return Err(Error::InvalidFlag {
                flag: "--connect-rate",
                value: self.connect_rate.to_string(),
            });
        }

        let login = self.login.unwrap_or_else(whoami::username);
        let hosts_file = self.hosts_file.unwrap_or_else(default_hosts_file);

        Ok(RuntimeConfig {
            target: Target {
                host: self.dst_address,
                port: self.dst_port,
            },
            ssh: SshOptions {
                login,
                identities: self.identity,
                password: self.password,
                hosts_file,
                client_version: self.client_version,
            },
            pool: PoolConfig {
                size: self.pool_size,
                backoff: Duration::from_secs_f64(self.backoff),
                connect_timeout: Duration::from_secs_f64(self.timeout),
                connect_rate: self.connect_rate,
            },
            listen: ListenConfig {
                bind_address: self.bind_address,
                bind_port: self.bind_port,
                transparent: self.transparent,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_pool_size() {
        let cli = Cli::parse_from(["rsp", "example.com", "-n", "0"]);
        assert!(cli.into_runtime_config().is_err());
    }

    #[test]
    fn flag_defaults_are_stable() {
        let cli = Cli::parse_from(["rsp", "example.com"]);
        assert_eq!(cli.dst_port, 22);
        assert_eq!(cli.bind_address, "127.0.0.1");
        assert_eq!(cli.bind_port, 1080);
        assert!(!cli.transparent);
        assert_eq!(cli.pool_size, 30);
        assert_eq!(cli.backoff, 5.0);
        assert_eq!(cli.timeout, 4.0);
        assert_eq!(cli.connect_rate, 0.5);
    }
}
