//! `rsp` — the proxy daemon.
//!
//! Control flow: parse flags, init logging, load the trust store (fatal
//! if the target has no pinned entry), build the rate limiter and pool,
//! start the listener, notify readiness, wait for a shutdown signal,
//! then tear everything down in reverse order.

use std::sync::{Arc, Mutex as StdMutex};

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};

use rsp::{
    cli::Cli,
    limiter::RateLimiter,
    listener::{socks5::Socks5Protocol, transparent::TransparentProtocol, GenericListener},
    pool::{ssh::SshConnector, Pool},
    trust::TrustStore,
};

const EXIT_BAD_TRUST_STORE: i32 = 2;

fn init_logging(cli: &Cli) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.verbosity.clone()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match &cli.logfile {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .unwrap_or_else(|err| panic!("failed to open logfile {}: {err}", path.display()));
            builder.with_writer(StdMutex::new(file)).init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    let config = match cli.into_runtime_config() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(%err, "invalid configuration");
            std::process::exit(1);
        }
    };

    let trust = match TrustStore::load(&config.ssh.hosts_file) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            tracing::error!(path = %config.ssh.hosts_file.display(), %err, "failed to read known-hosts file");
            std::process::exit(1);
        }
    };

    if !trust.has_any_entry_for(&config.target.host, config.target.port) {
        let err = rsp::error::Error::UntrustedHost {
            host: config.target.host.clone(),
            port: config.target.port,
            hosts_file: trust.path().display().to_string(),
        };
        tracing::error!(%err);
        std::process::exit(EXIT_BAD_TRUST_STORE);
    }

    let limiter = RateLimiter::spawn(config.pool.connect_rate);
    let connector = SshConnector::new(
        config.target.clone(),
        config.ssh.clone(),
        trust.clone(),
        config.pool.connect_timeout,
    );
    let pool = Pool::new(
        connector,
        config.pool.size,
        config.pool.backoff,
        config.pool.connect_timeout,
        limiter,
    );
    pool.start().await;

    let listener_result = if config.listen.transparent {
        let listener = GenericListener::new(
            config.listen.bind_address.clone(),
            config.listen.bind_port,
            pool.clone(),
            config.pool.connect_timeout,
            TransparentProtocol,
        );
        listener.start().await.map(|()| ListenerHandle::Transparent(listener))
    } else {
        let listener = GenericListener::new(
            config.listen.bind_address.clone(),
            config.listen.bind_port,
            pool.clone(),
            config.pool.connect_timeout,
            Socks5Protocol,
        );
        listener.start().await.map(|()| ListenerHandle::Socks5(listener))
    };

    let listener = match listener_result {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%err, "failed to bind listener");
            std::process::exit(1);
        }
    };

    let heartbeat = tokio::spawn(async {
        loop {
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        }
    });

    rsp::notify::notify_ready().await;
    tracing::info!("server started");

    wait_for_shutdown_signal().await;
    tracing::warn!("shutdown signal received, stopping gracefully");

    rsp::notify::notify_stopping().await;
    listener.stop().await;
    pool.stop().await;
    heartbeat.abort();
    let _ = heartbeat.await;

    tracing::info!("server stopped");
}

/// Either listener variant, behind one handle so `main` doesn't need to
/// branch again at shutdown time.
enum ListenerHandle {
    Socks5(Arc<GenericListener<Socks5Protocol>>),
    Transparent(Arc<GenericListener<TransparentProtocol>>),
}

impl ListenerHandle {
    async fn stop(&self) {
        match self {
            ListenerHandle::Socks5(listener) => listener.stop().await,
            ListenerHandle::Transparent(listener) => listener.stop().await,
        }
    }
}

/// First SIGINT/SIGTERM returns (caller proceeds with graceful shutdown);
/// a second one before the process exits terminates immediately.
async fn wait_for_shutdown_signal() {
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    }

    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => {},
            _ = sigterm.recv() => {},
        }
        tracing::warn!("second shutdown signal received, terminating immediately");
        std::process::exit(1);
    });
}
