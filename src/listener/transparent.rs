//! Transparent-redirect destination extraction via `SO_ORIGINAL_DST`.
//!
//! Linux-only: `getsockopt(SOL_IP, SO_ORIGINAL_DST=80, sockaddr_in)` for
//! IPv4, `getsockopt(SOL_IPV6=41, SO_ORIGINAL_DST=80, sockaddr_in6)` for
//! IPv6. The accepted socket's own address family selects which
//! `sockaddr` shape to decode; the decode reads a `#[repr(C)]` struct
//! directly out of the kernel's `getsockopt` buffer.

use std::net::SocketAddr;

use tokio::{io::AsyncWriteExt, net::TcpStream};

use crate::error::{Error, Result};

#[cfg(target_os = "linux")]
mod sockopt {
    use std::io;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
    use std::os::fd::AsRawFd;

    use tokio::net::TcpStream;

    const SO_ORIGINAL_DST: libc::c_int = 80;
    const SOL_IPV6: libc::c_int = 41;

    #[repr(C)]
    struct SockaddrIn {
        sin_family: libc::sa_family_t,
        sin_port: u16,
        sin_addr: u32,
        _pad: [u8; 8],
    }

    #[repr(C)]
    struct SockaddrIn6 {
        sin6_family: libc::sa_family_t,
        sin6_port: u16,
        sin6_flowinfo: u32,
        sin6_addr: [u8; 16],
        sin6_scope_id: u32,
    }

    /// Decode the pre-NAT destination of `stream`. `stream`'s own local
    /// address family selects which `sockaddr` shape is read.
    pub fn get_original_dst(stream: &TcpStream) -> io::Result<(String, u16)> {
        let fd = stream.as_raw_fd();
        match stream.local_addr()? {
            SocketAddr::V4(_) => {
                let mut sa: SockaddrIn = unsafe { std::mem::zeroed() };
                let mut len = std::mem::size_of::<SockaddrIn>() as libc::socklen_t;
                let rc = unsafe {
                    libc::getsockopt(
                        fd,
                        libc::SOL_IP,
                        SO_ORIGINAL_DST,
                        &mut sa as *mut _ as *mut libc::c_void,
                        &mut len,
                    )
                };
                if rc != 0 {
                    return Err(io::Error::last_os_error());
                }
                let addr = Ipv4Addr::from(u32::from_be(sa.sin_addr));
                let port = u16::from_be(sa.sin_port);
                Ok((addr.to_string(), port))
            }
            SocketAddr::V6(_) => {
                let mut sa: SockaddrIn6 = unsafe { std::mem::zeroed() };
                let mut len = std::mem::size_of::<SockaddrIn6>() as libc::socklen_t;
                let rc = unsafe {
                    libc::getsockopt(
                        fd,
                        SOL_IPV6,
                        SO_ORIGINAL_DST,
                        &mut sa as *mut _ as *mut libc::c_void,
                        &mut len,
                    )
                };
                if rc != 0 {
                    return Err(io::Error::last_os_error());
                }
                let addr = Ipv6Addr::from(sa.sin6_addr);
                let port = u16::from_be(sa.sin6_port);
                Ok((addr.to_string(), port))
            }
        }
    }
}

#[cfg(target_os = "linux")]
pub fn get_original_dst(stream: &TcpStream) -> Result<(String, u16)> {
    sockopt::get_original_dst(stream).map_err(Error::Io)
}

#[cfg(not(target_os = "linux"))]
pub fn get_original_dst(_stream: &TcpStream) -> Result<(String, u16)> {
    Err(Error::TransparentUnsupported)
}

/// [`crate::listener::Protocol`] implementation for transparent redirect.
/// No handshake, no reply — the client's traffic flows straight into the
/// upstream channel once it is open.
pub struct TransparentProtocol;

#[async_trait::async_trait]
impl crate::listener::Protocol for TransparentProtocol {
    fn name(&self) -> &'static str {
        "transparent"
    }

    async fn prologue(&self, stream: &mut TcpStream) -> Result<(String, u16)> {
        get_original_dst(stream)
    }

    async fn write_success(&self, _stream: &mut TcpStream, _local: SocketAddr) -> std::io::Result<()> {
        // No PROXY-protocol preamble or any other pre-data is sent.
        Ok(())
    }

    async fn write_failure(&self, stream: &mut TcpStream) {
        let _ = stream.shutdown().await;
    }
}
