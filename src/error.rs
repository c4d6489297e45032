//! Crate-wide error types.
//!
//! Operations with a defined, user-facing failure contract (CLI value
//! parsing, the trust store, the SOCKS5 prologue) return [`Error`].
//! Everything else propagates an opaque [`BoxError`] — a typed variant
//! would add no information for connect/channel-open/I/O failures deep
//! in a hot path.

/// Type-erased error used on hot paths (connect failures, channel-open
/// failures, I/O) where a typed variant would add no information.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("refusing to start: no trusted host key for {host}:{port} in {hosts_file}; run `rsp-trust {host} {port}` first")]
    UntrustedHost {
        host: String,
        port: u16,
        hosts_file: String,
    },

    #[error("invalid value for {flag}: {value}")]
    InvalidFlag { flag: &'static str, value: String },

    #[error(transparent)]
    Socks(#[from] crate::listener::socks5::SocksError),

    #[error("transparent redirect is only supported on Linux")]
    TransparentUnsupported,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] BoxError),
}

impl Error {
    pub fn other(err: impl Into<BoxError>) -> Self {
        Error::Other(err.into())
    }
}

/// Convenience result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
