//! SSH client config parsing and alias resolution into a `HopChain`.
//!
//! Parses `~/.ssh/config`-shaped files: `Host`, `HostName`, `User`, `Port`,
//! `IdentityFile`, `ProxyJump`, `StrictHostKeyChecking`, `Ciphers`, `MACs`,
//! `HostKeyAlgorithms`, `KexAlgorithms`, `GlobalKnownHostsFile`,
//! `UserKnownHostsFile`. `LocalForward`/`RemoteForward`/`DynamicForward` are
//! read as hints only; tunnels are opened explicitly via the control plane,
//! not auto-started from the config file.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tracing::warn;

use crate::config::tokens::{self, Bindings, HOSTNAME_TOKENS, IDENTITY_FILE_TOKENS, PROXY_JUMP_TOKENS};
use crate::error::ManagerError;
use crate::model::{Hop, HopChain, JumpSpec, MAX_JUMP_DEPTH};
use crate::ssh::known_hosts::{HostKeyVerifier, KnownHostsStore};

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// One `Host` block as written in the config file, before substitution.
#[derive(Debug, Clone, Default)]
pub struct SshConfigHost {
    pub alias: String,
    pub hostname: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity_file: Vec<String>,
    pub proxy_jump: Option<String>,
    pub strict_host_key_checking: Option<String>,
    pub ciphers: Option<String>,
    pub macs: Option<String>,
    pub host_key_algorithms: Option<String>,
    pub kex_algorithms: Option<String>,
    pub global_known_hosts_file: Vec<String>,
    pub user_known_hosts_file: Vec<String>,
    pub other: HashMap<String, String>,
}

impl SshConfigHost {
    fn is_wildcard(&self) -> bool {
        self.alias.contains('*') || self.alias.contains('?')
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SshConfigError {
    #[error("failed to determine home directory")]
    NoHomeDir,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub fn default_ssh_config_path() -> Result<PathBuf, SshConfigError> {
    dirs::home_dir()
        .map(|home| home.join(".ssh").join("config"))
        .ok_or(SshConfigError::NoHomeDir)
}

pub async fn parse_ssh_config(path: Option<PathBuf>) -> Result<Vec<SshConfigHost>, SshConfigError> {
    let path = match path {
        Some(p) => p,
        None => default_ssh_config_path()?,
    };

    let content = match fs::read_to_string(&path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(SshConfigError::Io(e)),
    };

    Ok(parse_ssh_config_content(&content))
}

pub fn parse_ssh_config_content(content: &str) -> Vec<SshConfigHost> {
    let mut hosts = Vec::new();
    let mut current: Option<SshConfigHost> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = if let Some(eq) = line.find('=') {
            (line[..eq].trim(), line[eq + 1..].trim())
        } else {
            match line.splitn(2, char::is_whitespace).collect::<Vec<_>>()[..] {
                [k, v] => (k, v.trim()),
                _ => continue,
            }
        };

        let key_lower = key.to_lowercase();

        if key_lower == "host" {
            if let Some(host) = current.take() {
                if !host.is_wildcard() {
                    hosts.push(host);
                }
            }
            for alias in value.split_whitespace() {
                if !alias.contains('*') && !alias.contains('?') {
                    current = Some(SshConfigHost {
                        alias: alias.to_string(),
                        ..Default::default()
                    });
                    break;
                }
            }
            continue;
        }

        let Some(host) = current.as_mut() else { continue };

        match key_lower.as_str() {
            "hostname" => host.hostname = Some(value.to_string()),
            "user" => host.user = Some(value.to_string()),
            "port" => host.port = value.parse().ok(),
            "identityfile" => host.identity_file.push(value.to_string()),
            "proxyjump" => {
                if !value.eq_ignore_ascii_case("none") {
                    host.proxy_jump = Some(value.to_string());
                }
            }
            "stricthostkeychecking" => host.strict_host_key_checking = Some(value.to_string()),
            "ciphers" => host.ciphers = Some(value.to_string()),
            "macs" => host.macs = Some(value.to_string()),
            "hostkeyalgorithms" => host.host_key_algorithms = Some(value.to_string()),
            "kexalgorithms" => host.kex_algorithms = Some(value.to_string()),
            "globalknownhostsfile" => host
                .global_known_hosts_file
                .extend(value.split_whitespace().map(str::to_string)),
            "userknownhostsfile" => host
                .user_known_hosts_file
                .extend(value.split_whitespace().map(str::to_string)),
            _ => {
                host.other.insert(key_lower, value.to_string());
            }
        }
    }

    if let Some(host) = current {
        if !host.is_wildcard() {
            hosts.push(host);
        }
    }

    hosts
}

fn find_host<'a>(alias: &str, hosts: &'a [SshConfigHost]) -> Option<&'a SshConfigHost> {
    hosts.iter().find(|h| h.alias == alias)
}

fn split_comma_list(value: &Option<String>) -> Vec<String> {
    value
        .as_deref()
        .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

enum StrictMode {
    Strict,
    Permissive,
}

fn parse_strict_mode(value: Option<&str>) -> Result<StrictMode, ManagerError> {
    match value.map(str::to_lowercase).as_deref() {
        None => Ok(StrictMode::Strict),
        Some("yes") | Some("ask") => Ok(StrictMode::Strict),
        Some("no") | Some("off") => Ok(StrictMode::Permissive),
        Some("accept-new") => {
            warn!("StrictHostKeyChecking=accept-new is not supported; treating as strict (no auto-learn)");
            Ok(StrictMode::Strict)
        }
        Some(other) => Err(ManagerError::Config(format!(
            "unsupported StrictHostKeyChecking value: {other}"
        ))),
    }
}

/// Resolve `alias` against `hosts` into a fully populated `HopChain`,
/// without touching the filesystem for keys or known-hosts (callers load
/// signers and verifiers separately; see `ssh::keys` and
/// `ssh::known_hosts`). This keeps the pure parsing/substitution/recursion
/// logic testable without a home directory.
pub fn resolve_chain(alias: &str, hosts: &[SshConfigHost]) -> Result<HopChain, ManagerError> {
    let hops = resolve_hops(alias, hosts, 0, true)?;
    Ok(HopChain { hops })
}

fn resolve_hops(
    alias: &str,
    hosts: &[SshConfigHost],
    depth: u32,
    allow_own_jumps: bool,
) -> Result<Vec<Hop>, ManagerError> {
    if depth > MAX_JUMP_DEPTH {
        return Err(ManagerError::config(alias, "maximum jump recursions exceeded"));
    }

    // Unknown alias: proceed with empty config, defaults fill in.
    let block = find_host(alias, hosts);

    let hostname_template = block
        .and_then(|b| b.hostname.clone())
        .unwrap_or_else(|| alias.to_string());
    let hostname = tokens::substitute(
        &hostname_template,
        HOSTNAME_TOKENS,
        &Bindings {
            hostname: Some(alias.to_string()),
            ..Default::default()
        },
    );

    let user = block
        .and_then(|b| b.user.clone())
        .unwrap_or_else(whoami::username);
    let port = block.and_then(|b| b.port).unwrap_or(22);

    let strict = matches!(
        parse_strict_mode(block.and_then(|b| b.strict_host_key_checking.as_deref()))?,
        StrictMode::Strict
    );

    let host_key_algorithms = split_comma_list(&block.and_then(|b| b.host_key_algorithms.clone()));
    let ciphers = split_comma_list(&block.and_then(|b| b.ciphers.clone()));
    let macs = split_comma_list(&block.and_then(|b| b.macs.clone()));
    let kex = split_comma_list(&block.and_then(|b| b.kex_algorithms.clone()));

    let bindings_for_jump_and_identity = Bindings {
        hostname: Some(hostname.clone()),
        original_host: Some(alias.to_string()),
        port: Some(port),
        remote_user: Some(user.clone()),
        proxy_jump: None,
    };

    let mut chain = Vec::new();

    if allow_own_jumps {
        if let Some(raw_jump) = block.and_then(|b| b.proxy_jump.clone()) {
            let resolved_jump_str = tokens::substitute(&raw_jump, PROXY_JUMP_TOKENS, &bindings_for_jump_and_identity);
            let jump_specs: Vec<JumpSpec> = resolved_jump_str
                .split(',')
                .map(JumpSpec::parse)
                .collect::<Result<_, _>>()?;

            for (i, jump) in jump_specs.into_iter().enumerate() {
                let mut jump_hops = resolve_hops(&jump.host, hosts, depth + 1, i == 0)?;
                if let Some(last) = jump_hops.last_mut() {
                    if let Some(u) = jump.user {
                        last.user = u;
                    }
                    if let Some(p) = jump.port {
                        last.port = p;
                    }
                }
                chain.extend(jump_hops);
            }
        }
    }

    let bindings_for_identity = Bindings {
        proxy_jump: block.and_then(|b| b.proxy_jump.clone()),
        ..bindings_for_jump_and_identity
    };

    let identities: Vec<PathBuf> = block
        .map(|b| {
            b.identity_file
                .iter()
                .map(|tpl| tokens::expand_path_template(tpl, IDENTITY_FILE_TOKENS, &bindings_for_identity))
                .collect()
        })
        .unwrap_or_default();

    let known_hosts_paths: Vec<PathBuf> = block
        .map(|b| {
            b.global_known_hosts_file
                .iter()
                .chain(b.user_known_hosts_file.iter())
                .map(|tpl| tokens::expand_path_template(tpl, IDENTITY_FILE_TOKENS, &bindings_for_identity))
                .collect()
        })
        .unwrap_or_default();

    let verifier = if strict {
        let paths = if known_hosts_paths.is_empty() {
            let mut p = crate::ssh::known_hosts::default_global_known_hosts_paths();
            if let Some(user_path) = crate::ssh::known_hosts::default_user_known_hosts_path() {
                p.push(user_path);
            }
            p
        } else {
            known_hosts_paths
        };
        let store = KnownHostsStore::load(&paths);
        Some(Arc::new(HostKeyVerifier::new(store, host_key_algorithms.clone())))
    } else {
        None
    };

    let hop = Hop {
        alias: alias.to_string(),
        hostname,
        port,
        user,
        identities,
        signers: Vec::new(),
        agent_signers: Vec::new(),
        host_key_algorithms,
        ciphers,
        macs,
        kex,
        strict,
        verifier,
        dial_timeout: DEFAULT_DIAL_TIMEOUT,
    };
    hop.validate()?;
    chain.push(hop);

    Ok(chain)
}

/// Build a `HopChain` for a control-plane `TunnelDesc` (§8 scenario 3): an
/// explicit identity override means the host is a literal, not a config
/// alias, and the SSH config file is never consulted for it. Otherwise
/// `desc.host` is resolved as an alias and an explicit `desc.user`, if any,
/// overrides the terminal hop's config-derived user.
pub fn resolve_tunnel_chain(desc: &crate::model::TunnelDesc, hosts: &[SshConfigHost]) -> Result<HopChain, ManagerError> {
    if let Some(identity) = &desc.identity {
        return Ok(HopChain { hops: vec![literal_hop(desc, identity)?] });
    }

    let mut chain = resolve_chain(&desc.host, hosts)?;
    if let Some(user) = &desc.user {
        if let Some(terminal) = chain.hops.last_mut() {
            terminal.user = user.clone();
        }
    }
    Ok(chain)
}

fn literal_hop(desc: &crate::model::TunnelDesc, identity_template: &str) -> Result<Hop, ManagerError> {
    let user = desc.user.clone().unwrap_or_else(whoami::username);
    let identity = tokens::expand_home(identity_template);

    let mut known_hosts_paths = crate::ssh::known_hosts::default_global_known_hosts_paths();
    if let Some(user_path) = crate::ssh::known_hosts::default_user_known_hosts_path() {
        known_hosts_paths.push(user_path);
    }
    let store = KnownHostsStore::load(&known_hosts_paths);
    let verifier = Some(Arc::new(HostKeyVerifier::new(store, Vec::new())));

    let hop = Hop {
        alias: desc.host.clone(),
        hostname: desc.host.clone(),
        port: 22,
        user,
        identities: vec![identity],
        signers: Vec::new(),
        agent_signers: Vec::new(),
        host_key_algorithms: Vec::new(),
        ciphers: Vec::new(),
        macs: Vec::new(),
        kex: Vec::new(),
        strict: true,
        verifier,
        dial_timeout: DEFAULT_DIAL_TIMEOUT,
    };
    hop.validate()?;
    Ok(hop)
}

/// Attach loaded signers to every hop in a chain. Split out from
/// `resolve_hops` because key loading needs filesystem + agent access,
/// while the resolver above stays pure and unit-testable.
pub async fn attach_signers(chain: &mut HopChain) -> Result<(), ManagerError> {
    for hop in &mut chain.hops {
        let signers = crate::ssh::keys::signers_for(hop).await?;
        hop.signers = signers.keys.into_iter().map(Arc::new).collect();
        hop.agent_signers = signers.agent;
        hop.ensure_has_signer()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_basic() {
        let content = r#"
# Comment
Host myserver
    HostName example.com
    User admin
    Port 2222
    IdentityFile ~/.ssh/id_rsa

Host otherserver
    HostName other.com
    User root
"#;
        let hosts = parse_ssh_config_content(content);
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[0].alias, "myserver");
        assert_eq!(hosts[0].hostname, Some("example.com".to_string()));
        assert_eq!(hosts[0].port, Some(2222));
    }

    #[test]
    fn skip_wildcards() {
        let content = "Host *\n    Port 22\n\nHost prod\n    HostName prod.example.com\n";
        let hosts = parse_ssh_config_content(content);
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].alias, "prod");
    }

    #[test]
    fn strict_host_key_checking_variants() {
        assert!(matches!(parse_strict_mode(Some("yes")).unwrap(), StrictMode::Strict));
        assert!(matches!(parse_strict_mode(Some("ask")).unwrap(), StrictMode::Strict));
        assert!(matches!(parse_strict_mode(Some("no")).unwrap(), StrictMode::Permissive));
        assert!(matches!(parse_strict_mode(Some("off")).unwrap(), StrictMode::Permissive));
        assert!(matches!(parse_strict_mode(Some("accept-new")).unwrap(), StrictMode::Strict));
        assert!(parse_strict_mode(Some("bogus")).is_err());
        assert!(matches!(parse_strict_mode(None).unwrap(), StrictMode::Strict));
    }

    #[test]
    fn resolve_simple_host_defaults_port_22() {
        let hosts = parse_ssh_config_content("Host solo\n    HostName solo.example.com\n    User bob\n");
        let chain = resolve_chain("solo", &hosts).unwrap();
        assert_eq!(chain.hops.len(), 1);
        assert_eq!(chain.hops[0].hostname, "solo.example.com");
        assert_eq!(chain.hops[0].port, 22);
        assert_eq!(chain.hops[0].user, "bob");
    }

    #[test]
    fn resolve_unknown_alias_uses_defaults() {
        let chain = resolve_chain("nowhere.example.com", &[]).unwrap();
        assert_eq!(chain.hops.len(), 1);
        assert_eq!(chain.hops[0].hostname, "nowhere.example.com");
        assert_eq!(chain.hops[0].port, 22);
    }

    #[test]
    fn resolve_single_proxy_jump() {
        let content = r#"
Host target
    HostName target.internal
    User admin
    ProxyJump bastion

Host bastion
    HostName jump.example.com
    User alice
"#;
        let hosts = parse_ssh_config_content(content);
        let chain = resolve_chain("target", &hosts).unwrap();
        assert_eq!(chain.hops.len(), 2);
        assert_eq!(chain.hops[0].hostname, "jump.example.com");
        assert_eq!(chain.hops[0].user, "alice");
        assert_eq!(chain.hops[1].hostname, "target.internal");
        assert_eq!(chain.hops[1].user, "admin");
    }

    #[test]
    fn resolve_multi_hop_proxy_jump_expands_left_to_right() {
        let content = r#"
Host compute
    HostName node001.internal
    User admin
    ProxyJump bastion,relay

Host bastion
    HostName jump1.example.com

Host relay
    HostName jump2.example.com
"#;
        let hosts = parse_ssh_config_content(content);
        let chain = resolve_chain("compute", &hosts).unwrap();
        assert_eq!(chain.hops.len(), 3);
        assert_eq!(chain.hops[0].hostname, "jump1.example.com");
        assert_eq!(chain.hops[1].hostname, "jump2.example.com");
        assert_eq!(chain.hops[2].hostname, "node001.internal");
    }

    #[test]
    fn only_first_jump_of_a_parent_may_contribute_its_own_jumps() {
        // `compute`'s second jump (`relay`) has its own ProxyJump, which
        // must be suppressed: `deeper` must not appear in the chain.
        let content = r#"
Host compute
    HostName node001.internal
    ProxyJump bastion,relay

Host bastion
    HostName jump1.example.com

Host relay
    HostName jump2.example.com
    ProxyJump deeper

Host deeper
    HostName deeper.example.com
"#;
        let hosts = parse_ssh_config_content(content);
        let chain = resolve_chain("compute", &hosts).unwrap();
        let hostnames: Vec<&str> = chain.hops.iter().map(|h| h.hostname.as_str()).collect();
        assert_eq!(
            hostnames,
            vec!["jump1.example.com", "jump2.example.com", "node001.internal"]
        );
        assert!(!hostnames.contains(&"deeper.example.com"));
    }

    #[test]
    fn proxy_jump_inline_user_port_override_config() {
        let content = r#"
Host target
    HostName target.internal
    ProxyJump root@bastion:2200

Host bastion
    HostName jump.example.com
    User alice
    Port 22
"#;
        let hosts = parse_ssh_config_content(content);
        let chain = resolve_chain("target", &hosts).unwrap();
        assert_eq!(chain.hops[0].user, "root");
        assert_eq!(chain.hops[0].port, 2200);
    }
}
