//! Data model shared across the config resolver, dialer, forwarding engine
//! and control plane: `JumpSpec`, `Hop`, `HopChain`, `TunnelDesc`, `TunnelState`
//! and `Endpoint`.

use std::path::PathBuf;
use std::time::Duration;

use russh::keys::PrivateKeyWithHashAlg;
use serde::{Deserialize, Serialize};

use crate::error::ManagerError;
use crate::ssh::agent::AgentSigner;
use crate::ssh::known_hosts::HostKeyVerifier;

/// Maximum `ProxyJump` recursion depth. Exceeding it fails the chain.
pub const MAX_JUMP_DEPTH: u32 = 20;

/// A `[user@]host[:port]` entry parsed out of a `ProxyJump` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JumpSpec {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl JumpSpec {
    /// Parse one comma-separated `ProxyJump` entry. Invariant: `host`
    /// non-empty after parsing.
    pub fn parse(value: &str) -> Result<Self, ManagerError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(ManagerError::Config("empty ProxyJump entry".into()));
        }

        let (user, rest) = match value.rsplit_once('@') {
            Some((user, rest)) => (Some(user.to_string()), rest),
            None => (None, value),
        };

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port_str)) if !host.is_empty() => {
                let port = port_str
                    .parse::<u16>()
                    .map_err(|e| ManagerError::Config(format!("invalid jump port: {e}")))?;
                (host.to_string(), Some(port))
            }
            _ => (rest.to_string(), None),
        };

        if host.is_empty() {
            return Err(ManagerError::Config("ProxyJump entry has no host".into()));
        }

        Ok(Self { user, host, port })
    }
}

/// One fully resolved connection step, ready to dial.
///
/// Invariants: `hostname` non-empty; `1 <= port <= 65535`; `user` non-empty;
/// `verifier` present iff `strict`.
pub struct Hop {
    pub alias: String,
    pub hostname: String,
    pub port: u16,
    pub user: String,
    pub identities: Vec<PathBuf>,
    pub signers: Vec<std::sync::Arc<russh::keys::PrivateKey>>,
    pub agent_signers: Vec<std::sync::Arc<AgentSigner>>,
    pub host_key_algorithms: Vec<String>,
    pub ciphers: Vec<String>,
    pub macs: Vec<String>,
    pub kex: Vec<String>,
    pub strict: bool,
    pub verifier: Option<std::sync::Arc<HostKeyVerifier>>,
    pub dial_timeout: Duration,
}

impl Hop {
    pub fn validate(&self) -> Result<(), ManagerError> {
        if self.hostname.is_empty() {
            return Err(ManagerError::config(&self.alias, "empty hostname"));
        }
        if self.port == 0 {
            return Err(ManagerError::config(&self.alias, "port out of range"));
        }
        if self.user.is_empty() {
            return Err(ManagerError::config(&self.alias, "empty user"));
        }
        if self.strict != self.verifier.is_some() {
            return Err(ManagerError::config(
                &self.alias,
                "verifier presence must match strict mode",
            ));
        }
        Ok(())
    }

    /// `signers-for(hop)`'s fourth step: an empty final list fails the hop.
    pub fn ensure_has_signer(&self) -> Result<(), ManagerError> {
        if self.signers.is_empty() && self.agent_signers.is_empty() {
            return Err(ManagerError::auth(&self.alias, "no usable signers"));
        }
        Ok(())
    }

    /// Key-with-hash-alg wrapper russh wants at `authenticate_publickey` time.
    pub fn signer_candidates(&self) -> Vec<PrivateKeyWithHashAlg> {
        self.signers
            .iter()
            .map(|k| PrivateKeyWithHashAlg::new(k.clone(), None))
            .collect()
    }
}

/// Ordered chain of hops; the first is dialed directly, each subsequent hop
/// is dialed *through* the SSH session of its predecessor. The last hop is
/// the terminal host where forwards are opened.
pub struct HopChain {
    pub hops: Vec<Hop>,
}

impl HopChain {
    pub fn terminal(&self) -> &Hop {
        self.hops.last().expect("HopChain is never empty")
    }
}

/// Tunnel forwarding mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TunnelMode {
    Local,
    Remote,
    Socks,
    SocksRemote,
}

impl Default for TunnelMode {
    fn default() -> Self {
        Self::Local
    }
}

/// Control-plane payload describing a tunnel to open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelDesc {
    pub name: String,
    #[serde(default)]
    pub mode: TunnelMode,
    #[serde(default)]
    pub local: Option<String>,
    #[serde(default)]
    pub remote: Option<String>,
    pub host: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub identity: Option<String>,
}

/// `Pending -> Connecting -> Open`, `any -> Closing -> Closed`,
/// `Connecting -> Failed`. Only `Open` tunnels count as "running".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TunnelState {
    Pending,
    Connecting,
    Open,
    Closing,
    Closed,
    Failed,
}

/// Either a TCP `host:port` (host may be a bracketed literal address) or a
/// filesystem path naming a Unix-domain socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix { path: PathBuf },
}

impl Endpoint {
    /// Presence of `/` or a leading `.` selects a Unix socket; otherwise
    /// `host:port` or a bare port (which expands to `localhost:port`).
    pub fn parse(s: &str) -> Result<Self, ManagerError> {
        if s.contains('/') || s.starts_with('.') {
            return Ok(Self::Unix {
                path: PathBuf::from(s),
            });
        }

        if let Ok(port) = s.parse::<u16>() {
            return Ok(Self::Tcp {
                host: "localhost".to_string(),
                port,
            });
        }

        if let Some(rest) = s.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| ManagerError::Config(format!("unterminated bracket in endpoint: {s}")))?;
            let port_str = after
                .strip_prefix(':')
                .ok_or_else(|| ManagerError::Config(format!("missing port after bracketed host: {s}")))?;
            let port = port_str
                .parse::<u16>()
                .map_err(|e| ManagerError::Config(format!("invalid port in endpoint {s}: {e}")))?;
            return Ok(Self::Tcp {
                host: host.to_string(),
                port,
            });
        }

        let (host, port_str) = s
            .rsplit_once(':')
            .ok_or_else(|| ManagerError::Config(format!("endpoint missing port: {s}")))?;
        let port = port_str
            .parse::<u16>()
            .map_err(|e| ManagerError::Config(format!("invalid port in endpoint {s}: {e}")))?;
        Ok(Self::Tcp {
            host: host.to_string(),
            port,
        })
    }

    pub fn to_bind_string(&self) -> String {
        match self {
            Self::Tcp { host, port } => format!("{host}:{port}"),
            Self::Unix { path } => path.display().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_port() {
        assert_eq!(
            Endpoint::parse("9000").unwrap(),
            Endpoint::Tcp {
                host: "localhost".into(),
                port: 9000
            }
        );
    }

    #[test]
    fn parses_host_port() {
        assert_eq!(
            Endpoint::parse("example.org:443").unwrap(),
            Endpoint::Tcp {
                host: "example.org".into(),
                port: 443
            }
        );
    }

    #[test]
    fn parses_ipv6_bracketed() {
        assert_eq!(
            Endpoint::parse("[::1]:9000").unwrap(),
            Endpoint::Tcp {
                host: "::1".into(),
                port: 9000
            }
        );
    }

    #[test]
    fn parses_unix_socket_path() {
        assert_eq!(
            Endpoint::parse("/tmp/x.sock").unwrap(),
            Endpoint::Unix {
                path: "/tmp/x.sock".into()
            }
        );
    }

    #[test]
    fn parses_relative_unix_socket_path() {
        assert_eq!(
            Endpoint::parse("./x.sock").unwrap(),
            Endpoint::Unix {
                path: "./x.sock".into()
            }
        );
    }

    #[test]
    fn jump_spec_parses_user_host_port() {
        let j = JumpSpec::parse("alice@bastion:2222").unwrap();
        assert_eq!(j.user.as_deref(), Some("alice"));
        assert_eq!(j.host, "bastion");
        assert_eq!(j.port, Some(2222));
    }

    #[test]
    fn jump_spec_parses_host_only() {
        let j = JumpSpec::parse("bastion").unwrap();
        assert_eq!(j.user, None);
        assert_eq!(j.host, "bastion");
        assert_eq!(j.port, None);
    }

    #[test]
    fn jump_spec_rejects_empty() {
        assert!(JumpSpec::parse("").is_err());
    }
}
