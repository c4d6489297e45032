//! OpenSSH `known_hosts`-format trust store.
//!
//! Consulted once at startup (refuse to start without a match for the
//! configured target) and again per-connection by
//! [`crate::pool::ssh::ProxyHandshake`] to verify the server's host key.
//! Key comparison goes through `PublicKey::to_openssh()` so it's an exact
//! byte/text match rather than a fingerprint comparison.

use std::{
    fs,
    path::{Path, PathBuf},
};

use russh::keys::PublicKey;

/// One `host[,host...] keytype base64` line, pre-split into host patterns
/// and the OpenSSH-formatted public key text.
struct Entry {
    patterns: Vec<String>,
    openssh_key: String,
}

/// The `known_hosts` host pattern for `(host, port)`: bare `host` for the
/// default SSH port, bracketed `[host]:port` otherwise. Shared by the
/// daemon's startup/handshake matcher and by `rsp-trust`'s writer so the
/// two stay in agreement for non-default ports.
pub fn known_hosts_pattern(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{host}]:{port}")
    }
}

pub struct TrustStore {
    path: PathBuf,
    entries: Vec<Entry>,
}

impl TrustStore {
    /// Load `path`. A missing file is treated as an empty store (not an
    /// error) — the startup trust check below is what turns "empty" into
    /// a fatal condition.
    pub fn load(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let text = match fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e),
        };

        let mut entries = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.splitn(3, ' ');
            let Some(hosts) = parts.next() else { continue };
            let Some(keytype) = parts.next() else { continue };
            let Some(base64) = parts.next() else { continue };
            let openssh_key = format!("{keytype} {}", base64.split_whitespace().next().unwrap_or(""));
            let patterns = hosts.split(',').map(str::to_owned).collect();
            entries.push(Entry {
                patterns,
                openssh_key,
            });
        }

        Ok(TrustStore { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Host patterns this entry set would match for `(host, port)`,
    /// following OpenSSH's convention of bracketing host+port for
    /// non-default SSH ports (`[host]:port`) and bare `host` otherwise.
    /// `rsp-trust` writes entries with this same convention, so a key
    /// trusted for a non-default port is actually found again here.
    fn candidate_patterns(host: &str, port: u16) -> Vec<String> {
        vec![known_hosts_pattern(host, port)]
    }

    /// Startup check: does the store contain *any* entry for this
    /// target, regardless of which key it pins? Only asks "is this host
    /// known" before the pool ever dials out.
    pub fn has_any_entry_for(&self, host: &str, port: u16) -> bool {
        let candidates = Self::candidate_patterns(host, port);
        self.entries
            .iter()
            .any(|e| e.patterns.iter().any(|p| candidates.contains(p)))
    }

    /// Per-connection check: does the store pin `key` for `(host,
    /// port)`? An empty store (or a host with no entries at all) is
    /// never trusted — absence is not an accept-all wildcard.
    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> bool {
        let Ok(openssh_key) = key.to_openssh() else {
            return false;
        };
        let openssh_key = openssh_key.trim();
        let candidates = Self::candidate_patterns(host, port);
        self.entries.iter().any(|e| {
            e.patterns.iter().any(|p| candidates.contains(p)) && e.openssh_key == openssh_key
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn write_hosts(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn missing_file_is_empty_store() {
        let store = TrustStore::load("/nonexistent/path/known_hosts").unwrap();
        assert!(!store.has_any_entry_for("example.com", 22));
    }

    #[test]
    fn matches_default_port_by_bare_hostname() {
        let (_dir, path) = write_hosts("example.com ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIMy\n");
        let store = TrustStore::load(&path).unwrap();
        assert!(store.has_any_entry_for("example.com", 22));
        assert!(!store.has_any_entry_for("example.com", 2222));
        assert!(!store.has_any_entry_for("other.com", 22));
    }

    #[test]
    fn matches_nonstandard_port_by_bracket_notation() {
        let (_dir, path) = write_hosts("[example.com]:2222 ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIMy\n");
        let store = TrustStore::load(&path).unwrap();
        assert!(store.has_any_entry_for("example.com", 2222));
        assert!(!store.has_any_entry_for("example.com", 22));
    }

    #[test]
    fn known_hosts_pattern_matches_rsp_trust_write_format() {
        assert_eq!(known_hosts_pattern("example.com", 22), "example.com");
        assert_eq!(known_hosts_pattern("example.com", 2222), "[example.com]:2222");
    }

    #[test]
    fn ignores_comments_and_blank_lines() {
        let (_dir, path) = write_hosts("# comment\n\nexample.com ssh-ed25519 AAAA\n");
        let store = TrustStore::load(&path).unwrap();
        assert!(store.has_any_entry_for("example.com", 22));
    }
}
