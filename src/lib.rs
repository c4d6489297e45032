//! Rapid SSH Proxy — accepts SOCKS5 or transparently-redirected TCP
//! connections and tunnels each one over a warm pool of pre-authenticated
//! SSH client sessions, multiplexed as direct-tcpip channels.
//!
//! Exposed as a library so `rsp`, `rsp-trust`, and `rsp-keygen` can share
//! the config, trust-store, and SSH-session machinery.

pub mod cli;
pub mod config;
pub mod error;
pub mod limiter;
pub mod listener;
pub mod notify;
pub mod pool;
pub mod trust;
