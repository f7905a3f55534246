//! SSH connection assembly: key loading, host-key verification, the dialer
//! and the single-owner handle task.

pub mod agent;
pub mod client;
pub mod dial;
pub mod error;
pub mod handle_owner;
pub mod keys;
pub mod known_hosts;

pub use agent::{agent_signers, is_agent_available, AgentSigner};
pub use client::ClientHandler;
pub use dial::{dial, SessionChain};
pub use error::SshError;
pub use handle_owner::{spawn_handle_owner_task, HandleController};
pub use known_hosts::{HostKeyVerification, HostKeyVerifier, KnownHostsStore};
