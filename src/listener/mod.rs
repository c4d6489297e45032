//! Shared accept loop, per-client supervisor, byte-pump, and shutdown
//! logic for the two listener variants.
//!
//! SOCKS5 and transparent-redirect are near-identical end to end: they
//! differ only in how `(dst_addr, dst_port)` is obtained and whether a
//! reply is written to the client. [`Protocol`] captures that difference;
//! [`GenericListener`] is the shared accept-loop/children-set machinery
//! both variants run on top of.

pub mod socks5;
pub mod transparent;

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::Mutex,
    task::{JoinHandle, JoinSet},
};

use crate::{
    error::Result,
    pool::{ssh::SshConnector, Pool},
};

/// Byte-pump buffer size for each direction of a tunnel.
const PUMP_BUFFER_SIZE: usize = 16 * 1024;

/// Post-shutdown settle delay compensating for the accept loop spawning a
/// last handler after the listening socket is reported closed (an
/// observed quirk of the underlying networking runtime).
const SHUTDOWN_SETTLE: Duration = Duration::from_millis(500);

/// What a listener variant contributes beyond the shared plumbing: how the
/// destination is obtained, and whether/what to reply to the client.
#[async_trait::async_trait]
pub trait Protocol: Send + Sync + 'static {
    /// Short name used in log lines ("socks5", "transparent").
    fn name(&self) -> &'static str;

    /// Perform the protocol-specific prologue on a freshly accepted
    /// stream, returning the requested `(host, port)`. Implementations
    /// that need to write a reject reply before failing (SOCKS5) do so
    /// themselves before returning the error.
    async fn prologue(&self, stream: &mut TcpStream) -> Result<(String, u16)>;

    /// Write the success reply once the upstream channel is open, before
    /// any upstream bytes reach the client. No-op for protocols with no
    /// reply (transparent).
    async fn write_success(&self, _stream: &mut TcpStream, _local: SocketAddr) -> io::Result<()> {
        Ok(())
    }

    /// Best-effort failure notification when the upstream channel could
    /// not be opened. No-op for protocols with no reply.
    async fn write_failure(&self, _stream: &mut TcpStream) {}
}

struct State {
    stopped: bool,
    accept_task: Option<JoinHandle<()>>,
    children: JoinSet<()>,
}

/// Shared listener machinery, parameterized over the per-variant
/// [`Protocol`]. `Socks5Listener` and `TransparentListener` are thin
/// aliases/constructors over this.
pub struct GenericListener<P: Protocol> {
    bind_address: String,
    bind_port: u16,
    pool: Arc<Pool<SshConnector>>,
    channel_timeout: Duration,
    protocol: P,
    state: Mutex<State>,
}

impl<P: Protocol> GenericListener<P> {
    pub fn new(
        bind_address: String,
        bind_port: u16,
        pool: Arc<Pool<SshConnector>>,
        channel_timeout: Duration,
        protocol: P,
    ) -> Arc<Self> {
        Arc::new(GenericListener {
            bind_address,
            bind_port,
            pool,
            channel_timeout,
            protocol,
            state: Mutex::new(State {
                stopped: false,
                accept_task: None,
                children: JoinSet::new(),
            }),
        })
    }

    /// Bind and start accepting. Each accepted connection is spawned into
    /// `children` and supervised independently.
    pub async fn start(self: &Arc<Self>) -> io::Result<()> {
        let listener = TcpListener::bind((self.bind_address.as_str(), self.bind_port)).await?;
        tracing::info!(
            protocol = self.protocol.name(),
            addr = %self.bind_address,
            port = self.bind_port,
            "listening"
        );
        let this = self.clone();
        let accept_task = tokio::spawn(this.accept_loop(listener));
        self.state.lock().await.accept_task = Some(accept_task);
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::warn!(protocol = self.protocol.name(), %err, "accept failed");
                    continue;
                }
            };
            let this = self.clone();
            let mut state = self.state.lock().await;
            if state.stopped {
                break;
            }
            state
                .children
                .spawn(async move { this.handle_client(stream, peer).await });
        }
    }

    async fn handle_client(self: Arc<Self>, mut stream: TcpStream, peer: SocketAddr) {
        tracing::info!(protocol = self.protocol.name(), %peer, "client connected");

        let local_addr = match stream.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                tracing::debug!(%peer, %err, "could not read local socket address");
                return;
            }
        };

        let (host, port) = match self.protocol.prologue(&mut stream).await {
            Ok(dst) => dst,
            Err(err) => {
                tracing::info!(%peer, %err, "prologue failed, closing client");
                return;
            }
        };
        tracing::info!(%peer, dst_host = %host, dst_port = port, "requested connection");

        let borrowed = self.pool.borrow().await;
        let channel = match borrowed
            .open_direct_tcpip(&host, port, self.channel_timeout)
            .await
        {
            Ok(channel) => channel,
            Err(err) => {
                tracing::warn!(%peer, dst_host = %host, dst_port = port, %err, "upstream channel open failed");
                borrowed.close().await;
                self.protocol.write_failure(&mut stream).await;
                return;
            }
        };

        if let Err(err) = self.protocol.write_success(&mut stream, local_addr).await {
            tracing::debug!(%peer, %err, "failed to write success reply");
            return;
        }

        pump(stream, channel).await;
        tracing::info!(%peer, "client disconnected");
    }

    /// Close the accepting socket, await its closure, cancel every child
    /// handler and await them, then settle (see [`SHUTDOWN_SETTLE`]).
    pub async fn stop(&self) {
        let accept_task = {
            let mut state = self.state.lock().await;
            state.stopped = true;
            state.accept_task.take()
        };
        if let Some(task) = accept_task {
            task.abort();
            let _ = task.await;
        }

        let mut state = self.state.lock().await;
        state.children.abort_all();
        while state.children.join_next().await.is_some() {}
        drop(state);

        tokio::time::sleep(SHUTDOWN_SETTLE).await;
    }
}

/// Bidirectional byte-pump: run `client<->channel` concurrently, and when
/// either direction ends (EOF, reset, error), cancel the other and await
/// its termination before returning.
async fn pump(
    client: TcpStream,
    channel: impl AsyncRead + AsyncWrite + Unpin + Send + 'static,
) {
    let (client_rd, client_wr) = tokio::io::split(client);
    let (chan_rd, chan_wr) = tokio::io::split(channel);

    let mut to_upstream = tokio::spawn(pump_one(client_rd, chan_wr));
    let mut to_client = tokio::spawn(pump_one(chan_rd, client_wr));

    tokio::select! {
        _ = &mut to_upstream => {
            to_client.abort();
            let _ = to_client.await;
        }
        _ = &mut to_client => {
            to_upstream.abort();
            let _ = to_upstream.await;
        }
    }
}

async fn pump_one(mut reader: impl AsyncRead + Unpin, mut writer: impl AsyncWrite + Unpin) {
    let mut buf = vec![0u8; PUMP_BUFFER_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (a, b) = tokio::join!(
            async { listener.accept().await.unwrap().0 },
            async { TcpStream::connect(addr).await.unwrap() }
        );
        (a, b)
    }

    #[tokio::test]
    async fn pump_is_bidirectional_and_terminates_on_either_eof() {
        let (client_server_side, mut client_test_side) = loopback_pair().await;
        let (channel_server_side, mut channel_test_side) = loopback_pair().await;

        let pump_task = tokio::spawn(pump(client_server_side, channel_server_side));

        client_test_side.write_all(b"hello-upstream").await.unwrap();
        let mut buf = vec![0u8; b"hello-upstream".len()];
        channel_test_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello-upstream");

        channel_test_side.write_all(b"hello-client").await.unwrap();
        let mut buf = vec![0u8; b"hello-client".len()];
        client_test_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello-client");

        drop(client_test_side);
        tokio::time::timeout(Duration::from_secs(2), pump_task)
            .await
            .expect("pump must terminate once either side reaches EOF")
            .unwrap();
    }
}
