//! Private key loading and the key-agent bridge (§4.C: `signers-for`).

use russh::keys::PrivateKey;
use tracing::{debug, warn};

use crate::error::ManagerError;
use crate::model::Hop;

const DEFAULT_IDENTITY_NAMES: &[&str] = &["id_rsa", "id_ecdsa", "id_ed25519"];

fn load_key(path: &std::path::Path) -> Option<PrivateKey> {
    match russh::keys::load_secret_key(path, None) {
        Ok(key) => Some(key),
        Err(e) => {
            warn!("failed to load identity {}: {e}", path.display());
            None
        }
    }
}

fn default_identity_paths() -> Vec<std::path::PathBuf> {
    let Some(home) = dirs::home_dir() else {
        return Vec::new();
    };
    DEFAULT_IDENTITY_NAMES
        .iter()
        .map(|name| home.join(".ssh").join(name))
        .collect()
}

/// Both halves of `signers-for(hop)`'s output: file-based keys usable with
/// `authenticate_publickey`, and agent identities usable with
/// `authenticate_publickey_with`.
pub struct HopSigners {
    pub keys: Vec<PrivateKey>,
    pub agent: Vec<std::sync::Arc<super::agent::AgentSigner>>,
}

/// Build the ordered signer list for a hop: explicit identities, then the
/// conventional defaults if none of those yielded a key, then agent
/// signers appended regardless. An empty final list fails the hop.
pub async fn signers_for(hop: &Hop) -> Result<HopSigners, ManagerError> {
    let mut keys = Vec::new();

    for path in &hop.identities {
        if path.exists() {
            if let Some(key) = load_key(path) {
                keys.push(key);
            }
        } else {
            warn!("identity file {} does not exist, skipping", path.display());
        }
    }

    if keys.is_empty() {
        for path in default_identity_paths() {
            if !path.exists() {
                continue;
            }
            if let Some(key) = load_key(&path) {
                keys.push(key);
            }
        }
    }

    let agent = super::agent::agent_signers().await;
    if !agent.is_empty() {
        debug!("{}: {} signer(s) available from ssh-agent", hop.alias, agent.len());
    }

    if keys.is_empty() && agent.is_empty() {
        return Err(ManagerError::auth(&hop.alias, "no usable signers"));
    }
    Ok(HopSigners { keys, agent })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_identity_paths_are_under_dot_ssh() {
        let paths = default_identity_paths();
        if dirs::home_dir().is_some() {
            assert_eq!(paths.len(), 3);
            assert!(paths[0].ends_with("id_rsa"));
            assert!(paths[2].ends_with("id_ed25519"));
        }
    }
}
