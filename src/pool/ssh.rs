//! `russh`-backed SSH session: connect, authenticate, open direct-tcpip
//! channels.

use std::{sync::Arc, time::Duration};

use russh::keys::PrivateKeyWithHashAlg;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    config::{SshOptions, Target},
    error::BoxError,
    pool::{BoxFuture, Connector},
    trust::TrustStore,
};

/// `russh::client::Handler` that consults the loaded known-hosts store
/// instead of accepting blindly. One instance is created per connection
/// attempt; it borrows the target so error messages can name it.
pub struct ProxyHandshake {
    trust: Arc<TrustStore>,
    host: String,
    port: u16,
}

impl russh::client::Handler for ProxyHandshake {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        let ok = self.trust.verify(&self.host, self.port, server_public_key);
        if !ok {
            tracing::warn!(
                host = %self.host,
                port = self.port,
                "server host key not found in trust store"
            );
        }
        Ok(ok)
    }
}

/// A single authenticated session, ready to open direct-tcpip channels.
/// Never returned to the pool once borrowed — see [`crate::pool::Borrowed`].
pub struct SshSession {
    handle: russh::client::Handle<ProxyHandshake>,
}

/// Everything [`connect`] needs beyond host/port, kept here to avoid a
/// five-argument function signature.
pub struct ConnectParams<'a> {
    pub target: &'a Target,
    pub options: &'a SshOptions,
    pub trust: Arc<TrustStore>,
    pub connect_timeout: Duration,
}

/// Connect and authenticate one SSH session against `params.target`.
///
/// Tries, in order: each `--identity` key (public-key auth), then a
/// password if one was supplied, then `none`-auth as a last resort.
pub async fn connect(params: &ConnectParams<'_>) -> Result<SshSession, BoxError> {
    let target = params.target;
    let options = params.options;

    let mut config = russh::client::Config::default();
    if let Some(client_version) = &options.client_version {
        config.client_id = russh::SshId::Standard(client_version.clone());
    }
    let config = Arc::new(config);
    let handshake = ProxyHandshake {
        trust: params.trust.clone(),
        host: target.host.clone(),
        port: target.port,
    };

    let mut session = tokio::time::timeout(
        params.connect_timeout,
        russh::client::connect(config, (target.host.as_str(), target.port), handshake),
    )
    .await
    .map_err(|_| format!("SSH connect to {}:{} timed out", target.host, target.port))??;

    let mut authenticated = false;

    for identity in &options.identities {
        let key = russh::keys::load_secret_key(identity, None)
            .map_err(|e| format!("failed to load identity {}: {e}", identity.display()))?;
        let hash_alg = session.best_supported_rsa_hash().await?.flatten();
        let keypair = PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg);
        let result = session
            .authenticate_publickey(&options.login, keypair)
            .await?;
        if result.success() {
            authenticated = true;
            break;
        }
        tracing::debug!(identity = %identity.display(), "public-key auth rejected");
    }

    if !authenticated {
        if let Some(password) = &options.password {
            if session
                .authenticate_password(&options.login, password)
                .await?
                .success()
            {
                authenticated = true;
            }
        }
    }

    if !authenticated && options.identities.is_empty() && options.password.is_none() {
        authenticated = session.authenticate_none(&options.login).await?.success();
    }

    if !authenticated {
        return Err(format!(
            "SSH authentication failed for {}@{}:{}",
            options.login, target.host, target.port
        )
        .into());
    }

    Ok(SshSession { handle: session })
}

/// [`crate::pool::Connector`] that builds one [`SshSession`] per call,
/// reusing the same target/options/trust store across every builder task
/// the pool spawns.
pub struct SshConnector {
    target: Target,
    options: SshOptions,
    trust: Arc<TrustStore>,
    connect_timeout: Duration,
}

impl SshConnector {
    pub fn new(
        target: Target,
        options: SshOptions,
        trust: Arc<TrustStore>,
        connect_timeout: Duration,
    ) -> Self {
        SshConnector {
            target,
            options,
            trust,
            connect_timeout,
        }
    }
}

impl crate::pool::Connector for SshConnector {
    type Item = SshSession;

    fn connect(&self) -> BoxFuture<'_, Result<SshSession, BoxError>> {
        Box::pin(async move {
            let params = ConnectParams {
                target: &self.target,
                options: &self.options,
                trust: self.trust.clone(),
                connect_timeout: self.connect_timeout,
            };
            connect(&params).await
        })
    }
}

impl SshSession {
    /// Open a direct-tcpip channel to `(host, port)` and return it as a
    /// plain bidirectional byte stream, bounded by `timeout`.
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<impl AsyncRead + AsyncWrite + Unpin + Send + 'static, BoxError> {
        let channel = tokio::time::timeout(
            timeout,
            self.handle
                .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0),
        )
        .await
        .map_err(|_| format!("channel open to {host}:{port} timed out"))??;

        Ok(channel.into_stream())
    }

    /// Best-effort teardown for a session that is being discarded
    /// without ever having had a channel opened on it (e.g. the handler
    /// failed before reaching `open_direct_tcpip`).
    pub async fn close(&self) {
        let _ = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "")
            .await;
    }
}
