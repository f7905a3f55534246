//! The russh `client::Handler` implementation: host-key verification and the
//! server-initiated callback for `socks-remote`/`remote` forwarded channels.

use std::sync::Arc;

use parking_lot::RwLock;
use russh::client;
use russh::keys::PublicKey;
use tracing::{info, warn};

use super::error::SshError;
use super::known_hosts::HostKeyVerifier;
use crate::forwarding::RemoteTarget;

/// Per-hop handler. Strict hops carry a verifier and reject anything it
/// doesn't accept; permissive hops carry `None` and accept whatever key the
/// server presents, without ever recording it.
///
/// `remote_target` is shared with this session's `HandleController` so the
/// forwarding engine can tell a live connection, after the fact, what to do
/// with channels the server opens back at us (`remote`/`socks-remote`).
pub struct ClientHandler {
    host: String,
    port: u16,
    verifier: Option<Arc<HostKeyVerifier>>,
    remote_target: Arc<RwLock<Option<RemoteTarget>>>,
}

impl ClientHandler {
    pub fn new(
        host: String,
        port: u16,
        verifier: Option<Arc<HostKeyVerifier>>,
        remote_target: Arc<RwLock<Option<RemoteTarget>>>,
    ) -> Self {
        Self { host, port, verifier, remote_target }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        match &self.verifier {
            Some(verifier) => match verifier.verify(&self.host, self.port, server_public_key) {
                Ok(()) => {
                    info!("host key verified for {}:{}", self.host, self.port);
                    Ok(true)
                }
                Err(e) => Err(SshError::HostKeyRejected(e.to_string())),
            },
            None => {
                warn!(
                    "permissive mode: accepting host key for {}:{} without recording it",
                    self.host, self.port
                );
                Ok(true)
            }
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: russh::Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        info!(
            "forwarded-tcpip channel opened: {}:{} from {}:{}",
            connected_address, connected_port, originator_address, originator_port
        );

        let target = self.remote_target.read().clone();
        match target {
            Some(RemoteTarget::Fixed { endpoint, stats, shutdown }) => {
                let mut shutdown_rx = shutdown.subscribe();
                tokio::spawn(async move {
                    crate::forwarding::remote::handle_fixed_forward(channel, &endpoint, stats, &mut shutdown_rx)
                        .await;
                });
            }
            Some(RemoteTarget::Socks { stats, shutdown }) => {
                let mut shutdown_rx = shutdown.subscribe();
                tokio::spawn(async move {
                    crate::forwarding::remote::handle_socks_forward(channel, stats, &mut shutdown_rx).await;
                });
            }
            None => {
                warn!(
                    "unsolicited forwarded-tcpip channel for {}:{}; no tunnel is listening for it",
                    connected_address, connected_port
                );
            }
        }

        Ok(())
    }
}
