//! Crate-wide error taxonomy.
//!
//! Every error that crosses a component boundary becomes one of these six
//! variants. Recovery policy lives with the caller: only `Peer` and missing
//! optional files (known-hosts, default identities) are ever absorbed locally;
//! everything else propagates to the Open/Close caller verbatim.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ManagerError {
    /// Unparseable SSH config value, unsupported `StrictHostKeyChecking`, jump
    /// syntax error, or hop validation failure.
    #[error("config error: {0}")]
    Config(String),

    /// No usable signers, or every signer was rejected by the server.
    #[error("auth error: {0}")]
    Auth(String),

    /// TCP dial failure, SSH handshake timeout, or a lost session.
    #[error("network error: {0}")]
    Network(String),

    /// No acceptable host-key algorithm intersection, or the verifier
    /// rejected the presented key.
    #[error("host key error: {0}")]
    HostKey(String),

    /// A malformed control-plane frame. The connection is closed; the
    /// daemon itself stays up.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Per-connection failure inside a running tunnel. Logged, the pump
    /// pair is torn down, the tunnel itself is unaffected.
    #[error("peer error: {0}")]
    Peer(String),
}

impl ManagerError {
    pub fn config(alias: &str, cause: impl std::fmt::Display) -> Self {
        Self::Config(format!("{alias}: {cause}"))
    }

    pub fn auth(alias: &str, cause: impl std::fmt::Display) -> Self {
        Self::Auth(format!("{alias}: {cause}"))
    }

    pub fn network(alias: &str, cause: impl std::fmt::Display) -> Self {
        Self::Network(format!("{alias}: {cause}"))
    }
}

pub type Result<T> = std::result::Result<T, ManagerError>;
