//! `rsp-trust` — TOFU host-key trust utility.
//!
//! Connects once with a handler that accepts any host key, prints its
//! algorithm and SHA-256 fingerprint, prompts `yes/no`, and on `yes`
//! appends an OpenSSH `known_hosts` line through
//! [`rsp::trust::known_hosts_pattern`] — the same pattern format the
//! daemon's own matcher looks entries up by, so a key trusted on a
//! non-default port is found again on the next startup.

use std::{io::Write, path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use russh::keys::{HashAlg, PublicKey};
use tokio::sync::Mutex;

use rsp::cli::default_hosts_file;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(
    name = "rsp-trust",
    about = "Rapid SSH Proxy: TOFU key trust utility"
)]
struct Args {
    /// Target SSH server hostname.
    dst_address: String,

    /// Target SSH server port.
    #[arg(default_value_t = 22)]
    dst_port: u16,

    /// Overrides the known_hosts file location.
    #[arg(short = 'H', long = "hosts-file", value_name = "FILE")]
    hosts_file: Option<PathBuf>,
}

/// Accepts whatever host key the server presents and stashes it for the
/// caller to inspect afterwards.
struct CaptureHandler {
    captured: Arc<Mutex<Option<PublicKey>>>,
}

impl russh::client::Handler for CaptureHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        *self.captured.lock().await = Some(server_public_key.clone());
        Ok(true)
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let hosts_file = args.hosts_file.unwrap_or_else(default_hosts_file);

    let captured = Arc::new(Mutex::new(None));
    let handler = CaptureHandler {
        captured: captured.clone(),
    };
    let config = Arc::new(russh::client::Config::default());

    let connect = russh::client::connect(config, (args.dst_address.as_str(), args.dst_port), handler);
    let session = match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
        Ok(Ok(session)) => session,
        Ok(Err(err)) => {
            eprintln!("Unable to connect: {err}");
            std::process::exit(3);
        }
        Err(_) => {
            eprintln!("Unable to connect: timed out");
            std::process::exit(3);
        }
    };
    drop(session);

    let key = match captured.lock().await.take() {
        Some(key) => key,
        None => {
            eprintln!("Unable to retrieve hostkey");
            std::process::exit(3);
        }
    };

    let fingerprint = key.fingerprint(HashAlg::Sha256);
    println!("{} key fingerprint is {}.", key.algorithm(), fingerprint);

    print!("Do you want to trust this key (yes/no)? ");
    std::io::stdout().flush().ok();

    loop {
        let mut input = String::new();
        if std::io::stdin().read_line(&mut input).is_err() {
            std::process::exit(1);
        }
        match input.trim().to_ascii_lowercase().as_str() {
            "yes" => {
                if let Some(parent) = hosts_file.parent() {
                    if let Err(err) = std::fs::create_dir_all(parent) {
                        eprintln!("Unable to create {}: {err}", parent.display());
                        std::process::exit(1);
                    }
                }
                let openssh_key = match key.to_openssh() {
                    Ok(s) => s,
                    Err(err) => {
                        eprintln!("Unable to encode host key: {err}");
                        std::process::exit(1);
                    }
                };
                let pattern = rsp::trust::known_hosts_pattern(&args.dst_address, args.dst_port);
                let line = format!("{pattern} {}\n", openssh_key.trim());
                let result = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&hosts_file)
                    .and_then(|mut f| f.write_all(line.as_bytes()));
                if let Err(err) = result {
                    eprintln!("Unable to write {}: {err}", hosts_file.display());
                    std::process::exit(1);
                }
                std::process::exit(0);
            }
            "no" => std::process::exit(0),
            _ => {
                print!("Please type 'yes' or 'no': ");
                std::io::stdout().flush().ok();
            }
        }
    }
}
