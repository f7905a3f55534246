//! Known-hosts loading, fingerprinting and strict-mode verification.
//!
//! Neither strict nor permissive mode ever writes a new entry: strict mode
//! rejects anything not already present, permissive mode accepts without
//! recording. An earlier revision of this code auto-saved unknown keys in
//! permissive mode (trust-on-first-use); that behavior is intentionally not
//! carried forward.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::RwLock;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::ManagerError;

#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    Verified,
    Unknown { fingerprint: String },
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

#[derive(Clone, Debug)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

/// In-memory index over the union of `GlobalKnownHostsFile` and
/// `UserKnownHostsFile` entries. Non-existent paths are silently skipped.
pub struct KnownHostsStore {
    hosts: RwLock<HashMap<String, Vec<HostKeyEntry>>>,
}

impl KnownHostsStore {
    pub fn load(paths: &[PathBuf]) -> Self {
        let store = Self {
            hosts: RwLock::new(HashMap::new()),
        };
        for path in paths {
            if let Err(e) = store.load_file(path) {
                debug!("skipping known_hosts file {}: {}", path.display(), e);
            }
        }
        store
    }

    pub fn empty() -> Self {
        Self {
            hosts: RwLock::new(HashMap::new()),
        }
    }

    fn load_file(&self, path: &Path) -> std::io::Result<()> {
        if !path.exists() {
            return Ok(());
        }
        let reader = BufReader::new(File::open(path)?);
        let mut hosts = self.hosts.write();

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 {
                continue;
            }

            let hostnames = parts[0];
            let entry = HostKeyEntry {
                key_type: parts[1].to_string(),
                key_data: parts[2].to_string(),
            };

            for hostname in hostnames.split(',') {
                if hostname.starts_with('|') {
                    // Hashed hostname entries are not decodable without the salt; skip.
                    continue;
                }
                let normalized = Self::normalize_hostname(hostname);
                hosts.entry(normalized).or_default().push(entry.clone());
            }
        }
        Ok(())
    }

    fn normalize_hostname(host: &str) -> String {
        let host = host.trim_start_matches('[');
        if let Some(idx) = host.find("]:") {
            host[..idx].to_lowercase()
        } else {
            host.trim_end_matches(']').to_lowercase()
        }
    }

    fn make_key(host: &str, port: u16) -> String {
        let host = host.to_lowercase();
        if port == 22 {
            host
        } else {
            format!("[{host}]:{port}")
        }
    }

    pub fn fingerprint(key: &PublicKey) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key.public_key_bytes());
        let hash = hasher.finalize();
        format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
    }

    fn fingerprint_from_b64(stored_b64: &str) -> String {
        match BASE64.decode(stored_b64) {
            Ok(bytes) => {
                let mut hasher = Sha256::new();
                hasher.update(&bytes);
                format!("SHA256:{}", BASE64.encode(hasher.finalize()).trim_end_matches('='))
            }
            Err(_) => "unknown".to_string(),
        }
    }

    /// Key types already recorded for `host:port`, in file order. Used to
    /// narrow the configured `HostKeyAlgorithms` list before dialing.
    pub fn algorithms_for(&self, host: &str, port: u16) -> Vec<String> {
        let hosts = self.hosts.read();
        let lookup = Self::make_key(host, port);
        let host_only = host.to_lowercase();
        let entries = hosts.get(&lookup).or_else(|| hosts.get(&host_only));
        match entries {
            Some(entries) => entries.iter().map(|e| e.key_type.clone()).collect(),
            None => Vec::new(),
        }
    }

    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerification {
        let lookup_key = Self::make_key(host, port);
        let actual_key_b64 = BASE64.encode(key.public_key_bytes());
        let actual_key_type = key.algorithm().as_str().to_string();
        let fingerprint = Self::fingerprint(key);

        let hosts = self.hosts.read();

        let check = |entries: &Vec<HostKeyEntry>| -> Option<HostKeyVerification> {
            for entry in entries {
                if entry.key_type == actual_key_type {
                    return Some(if entry.key_data == actual_key_b64 {
                        HostKeyVerification::Verified
                    } else {
                        HostKeyVerification::Changed {
                            expected_fingerprint: Self::fingerprint_from_b64(&entry.key_data),
                            actual_fingerprint: fingerprint.clone(),
                        }
                    });
                }
            }
            None
        };

        if let Some(entries) = hosts.get(&lookup_key) {
            if let Some(result) = check(entries) {
                return result;
            }
            return HostKeyVerification::Unknown { fingerprint };
        }

        let host_only = host.to_lowercase();
        if let Some(entries) = hosts.get(&host_only) {
            if let Some(result) = check(entries) {
                return result;
            }
            return HostKeyVerification::Unknown { fingerprint };
        }

        HostKeyVerification::Unknown { fingerprint }
    }
}

/// Per-hop host-key policy. Only constructed in strict mode; permissive hops
/// carry `None` and accept whatever key the server presents.
pub struct HostKeyVerifier {
    store: KnownHostsStore,
    configured_algorithms: Vec<String>,
}

impl HostKeyVerifier {
    pub fn new(store: KnownHostsStore, configured_algorithms: Vec<String>) -> Self {
        Self {
            store,
            configured_algorithms,
        }
    }

    /// Intersect configured `HostKeyAlgorithms` with what's on file for this
    /// host, preserving configured order. Empty intersection is fatal.
    pub fn negotiate_algorithms(&self, host: &str, port: u16) -> Result<Vec<String>, ManagerError> {
        let available = self.store.algorithms_for(host, port);
        if self.configured_algorithms.is_empty() {
            return Ok(available);
        }
        let negotiated: Vec<String> = self
            .configured_algorithms
            .iter()
            .filter(|alg| available.iter().any(|a| a == *alg))
            .cloned()
            .collect();

        if negotiated.is_empty() {
            return Err(ManagerError::HostKey(format!(
                "no acceptable host-key algorithm for {host}:{port}: configured={:?} available={:?}",
                self.configured_algorithms, available
            )));
        }
        Ok(negotiated)
    }

    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), ManagerError> {
        match self.store.verify(host, port, key) {
            HostKeyVerification::Verified => Ok(()),
            HostKeyVerification::Unknown { fingerprint } => {
                warn!("refusing unknown host key for {host}:{port} ({fingerprint}); strict mode does not auto-learn");
                Err(ManagerError::HostKey(format!(
                    "unknown host key for {host}:{port} (fingerprint {fingerprint}); not present in known_hosts"
                )))
            }
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => Err(ManagerError::HostKey(format!(
                "host key for {host}:{port} changed: expected {expected_fingerprint}, got {actual_fingerprint}"
            ))),
        }
    }
}

/// Default `UserKnownHostsFile` location, mirroring OpenSSH's.
pub fn default_user_known_hosts_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".ssh").join("known_hosts"))
}

/// Default `GlobalKnownHostsFile` location.
pub fn default_global_known_hosts_paths() -> Vec<PathBuf> {
    vec![PathBuf::from("/etc/ssh/ssh_known_hosts")]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn store_with(lines: &str) -> KnownHostsStore {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{lines}").unwrap();
        KnownHostsStore::load(&[file.path().to_path_buf()])
    }

    #[test]
    fn normalizes_bracketed_hostname() {
        assert_eq!(
            KnownHostsStore::normalize_hostname("[server.example.com]:2222"),
            "server.example.com"
        );
    }

    #[test]
    fn make_key_omits_default_port() {
        assert_eq!(KnownHostsStore::make_key("github.com", 22), "github.com");
        assert_eq!(
            KnownHostsStore::make_key("server.com", 2222),
            "[server.com]:2222"
        );
    }

    #[test]
    fn unknown_host_has_no_algorithms() {
        let store = store_with("github.com ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAAC\n");
        assert_eq!(store.algorithms_for("example.com", 22), Vec::<String>::new());
        assert_eq!(
            store.algorithms_for("github.com", 22),
            vec!["ssh-ed25519".to_string()]
        );
    }

    #[test]
    fn verifier_rejects_empty_intersection() {
        let store = store_with("bastion ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAAB\n");
        let verifier = HostKeyVerifier::new(store, vec!["ssh-ed25519".to_string()]);
        let err = verifier.negotiate_algorithms("bastion", 22).unwrap_err();
        assert!(matches!(err, ManagerError::HostKey(_)));
    }

    #[test]
    fn verifier_accepts_nonempty_intersection() {
        let store = store_with("bastion ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAAC\n");
        let verifier = HostKeyVerifier::new(
            store,
            vec!["ssh-rsa".to_string(), "ssh-ed25519".to_string()],
        );
        let negotiated = verifier.negotiate_algorithms("bastion", 22).unwrap();
        assert_eq!(negotiated, vec!["ssh-ed25519".to_string()]);
    }
}
