//! `rsp-keygen` — SSH client key-pair generation utility.
//!
//! Generates an Ed25519 keypair directly through `russh::keys` — the
//! modern default and the only type the daemon's own `-I/--identity`
//! flag needs to round-trip through `load_secret_key`.

use std::{io::Write, path::PathBuf};

use clap::Parser;
use russh::keys::{Algorithm, LineEnding, PrivateKey};

#[derive(Parser)]
#[command(
    name = "rsp-keygen",
    about = "Rapid SSH Proxy: key generation utility"
)]
struct Args {
    /// Output file name; the public key is written to `<file>.pub`.
    #[arg(short = 'f', long, default_value = "proxy_key")]
    file: PathBuf,
}

fn write_new_file(path: &std::path::Path, contents: &[u8]) -> std::io::Result<()> {
    let mut opts = std::fs::OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    opts.open(path)?.write_all(contents)
}

fn main() {
    let args = Args::parse();

    let private = match PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519) {
        Ok(key) => key,
        Err(err) => {
            eprintln!("Failed to generate key: {err}");
            std::process::exit(1);
        }
    };

    let encoded = match private.to_openssh(LineEnding::LF) {
        Ok(encoded) => encoded,
        Err(err) => {
            eprintln!("Failed to encode private key: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = write_new_file(&args.file, encoded.as_bytes()) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
    println!("Your identification has been saved in {}.", args.file.display());

    let public_line = match private.public_key().to_openssh() {
        Ok(line) => format!("{line}\n"),
        Err(err) => {
            eprintln!("Failed to encode public key: {err}");
            std::process::exit(1);
        }
    };
    let pub_path = {
        let mut p = args.file.clone().into_os_string();
        p.push(".pub");
        PathBuf::from(p)
    };
    if let Err(err) = std::fs::write(&pub_path, public_line.as_bytes()) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
    println!("Your public key has been saved in {}.", pub_path.display());
}
