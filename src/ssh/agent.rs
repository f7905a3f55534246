//! Key-agent bridge (§4.C step 3): fetch signers from a running `ssh-agent`
//! over `SSH_AUTH_SOCK` and adapt them to russh's `Signer` trait so they can
//! be tried through the same `authenticate_publickey_with` path as any other
//! key. Agent errors degrade to a warning; the hop falls back to whatever
//! file-based signers it already has.

use std::sync::Arc;

use russh::keys::agent::client::AgentClient;
use russh::keys::PublicKey;
use tokio::net::UnixStream;
use tracing::{debug, warn};

use crate::ssh::error::SshError;

/// `true` iff `SSH_AUTH_SOCK` is set. A cheap pre-check before paying for a
/// connection attempt; it does not guarantee the agent is actually reachable.
pub fn is_agent_available() -> bool {
    std::env::var_os("SSH_AUTH_SOCK").is_some()
}

async fn connect() -> Result<AgentClient<UnixStream>, SshError> {
    AgentClient::connect_env()
        .await
        .map_err(|e| SshError::AgentNotAvailable(e.to_string()))
}

/// One identity the agent advertised, paired with a fresh connection used
/// only to sign challenges for that identity. A new connection is opened
/// per signature because `AgentClient::sign_request_signature` consumes
/// `self` and the underlying request/response protocol is not meant to be
/// pipelined across unrelated signers.
pub struct AgentSigner {
    public_key: PublicKey,
}

impl AgentSigner {
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }
}

impl russh::keys::Signer for AgentSigner {
    type Error = SshError;

    async fn sign(&mut self, data: &[u8]) -> Result<russh::keys::signature::SshSig, Self::Error> {
        let agent = connect().await?;
        let (_agent, result) = agent.sign_request_signature(&self.public_key, data).await;
        result.map_err(|e| SshError::AgentError(e.to_string()))
    }
}

/// Every identity currently loaded in the agent, ready to be wrapped as a
/// `Signer` for `authenticate_publickey_with`. An unreachable agent is not
/// an error here: the caller logs it and moves on with whatever file-based
/// signers it already collected.
pub async fn agent_signers() -> Vec<Arc<AgentSigner>> {
    if !is_agent_available() {
        return Vec::new();
    }

    let agent = match connect().await {
        Ok(agent) => agent,
        Err(e) => {
            warn!("ssh-agent unreachable at $SSH_AUTH_SOCK: {e}");
            return Vec::new();
        }
    };

    let (_agent, identities) = agent.request_identities().await;
    match identities {
        Ok(identities) => {
            debug!("ssh-agent advertises {} identities", identities.len());
            identities
                .into_iter()
                .map(|public_key| Arc::new(AgentSigner { public_key }))
                .collect()
        }
        Err(e) => {
            warn!("failed to list ssh-agent identities: {e}");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn availability_follows_env_var() {
        let had = std::env::var_os("SSH_AUTH_SOCK");
        unsafe { std::env::remove_var("SSH_AUTH_SOCK") };
        assert!(!is_agent_available());
        unsafe { std::env::set_var("SSH_AUTH_SOCK", "/tmp/whatever.sock") };
        assert!(is_agent_available());
        match had {
            Some(v) => unsafe { std::env::set_var("SSH_AUTH_SOCK", v) },
            None => unsafe { std::env::remove_var("SSH_AUTH_SOCK") },
        }
    }
}
