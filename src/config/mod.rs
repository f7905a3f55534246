//! SSH config resolution and `~`/`%`-token substitution (§4.A, §4.B).

pub mod ssh_config;
pub mod tokens;

pub use ssh_config::{
    attach_signers, default_ssh_config_path, parse_ssh_config, parse_ssh_config_content,
    resolve_chain, resolve_tunnel_chain, SshConfigError, SshConfigHost,
};
