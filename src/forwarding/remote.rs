//! `remote` and `socks-remote` modes: ask the terminal hop's SSH server to
//! listen on our behalf (`tcpip-forward`) and route whatever it forwards
//! back to us.
//!
//! The actual channel handling happens in `ClientHandler::
//! server_channel_open_forwarded_tcpip`, dispatched here based on the
//! `RemoteTarget` the session was told to expect (§4.E).

use std::sync::Arc;

use russh::client::Msg;
use russh::Channel;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::ManagerError;
use crate::forwarding::listener;
use crate::forwarding::pump::{self, TunnelStats};
use crate::forwarding::remote_target::RemoteTarget;
use crate::forwarding::socks;
use crate::model::Endpoint;
use crate::ssh::handle_owner::HandleController;

pub struct RemoteForward {
    pub bound_addr: String,
    terminal: HandleController,
    bind_address: String,
    bound_port: u32,
}

impl RemoteForward {
    /// Ask the server to stop forwarding and stop routing its channels here.
    pub async fn stop(self) {
        self.terminal.clear_remote_target();
        if let Err(e) = self.terminal.cancel_tcpip_forward(&self.bind_address, self.bound_port).await {
            warn!("remote forward: failed to cancel tcpip-forward on {}: {e}", self.bound_addr);
        }
    }
}

/// `remote` mode: bind `remote_bind` on the server, bridge every channel it
/// forwards back to us to `local_target`.
pub async fn start_fixed(
    remote_bind: &Endpoint,
    local_target: Endpoint,
    terminal: HandleController,
    shutdown_tx: broadcast::Sender<()>,
    stats: Arc<TunnelStats>,
) -> Result<RemoteForward, ManagerError> {
    let (bind_address, bind_port) = remote_bind_parts(remote_bind)?;

    let bound_port = terminal
        .tcpip_forward(&bind_address, bind_port as u32)
        .await
        .map_err(|e| ManagerError::Network(format!("tcpip-forward failed: {e}")))?;

    terminal.set_remote_target(RemoteTarget::Fixed { endpoint: local_target, stats, shutdown: shutdown_tx });

    Ok(RemoteForward { bound_addr: format!("{bind_address}:{bound_port}"), terminal, bind_address, bound_port })
}

/// `socks-remote` mode: bind `remote_bind` on the server, and negotiate
/// SOCKS5 directly on every channel it forwards back to us.
pub async fn start_socks(
    remote_bind: &Endpoint,
    terminal: HandleController,
    shutdown_tx: broadcast::Sender<()>,
    stats: Arc<TunnelStats>,
) -> Result<RemoteForward, ManagerError> {
    let (bind_address, bind_port) = remote_bind_parts(remote_bind)?;

    let bound_port = terminal
        .tcpip_forward(&bind_address, bind_port as u32)
        .await
        .map_err(|e| ManagerError::Network(format!("tcpip-forward failed: {e}")))?;

    terminal.set_remote_target(RemoteTarget::Socks { stats, shutdown: shutdown_tx });

    Ok(RemoteForward { bound_addr: format!("{bind_address}:{bound_port}"), terminal, bind_address, bound_port })
}

fn remote_bind_parts(endpoint: &Endpoint) -> Result<(String, u16), ManagerError> {
    match endpoint {
        Endpoint::Tcp { host, port } => Ok((host.clone(), *port)),
        Endpoint::Unix { path } => Err(ManagerError::Config(format!(
            "remote-bind endpoints must be TCP, got unix path {}",
            path.display()
        ))),
    }
}

/// Bridge one forwarded channel to a fixed local destination.
pub async fn handle_fixed_forward(
    channel: Channel<Msg>,
    endpoint: &Endpoint,
    stats: Arc<TunnelStats>,
    shutdown_rx: &mut broadcast::Receiver<()>,
) {
    let local = match listener::dial_local(endpoint).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("remote forward: failed to dial local target {}: {e}", endpoint.to_bind_string());
            return;
        }
    };

    stats.connection_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    stats.active_connections.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    pump::bridge(local, channel.into_stream(), pump::DEFAULT_IDLE_TIMEOUT, shutdown_rx, stats.as_ref()).await;
    stats.active_connections.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
}

/// Negotiate SOCKS5 on a forwarded channel, then bridge to whatever it asked
/// for.
pub async fn handle_socks_forward(channel: Channel<Msg>, stats: Arc<TunnelStats>, shutdown_rx: &mut broadcast::Receiver<()>) {
    let mut stream = channel.into_stream();

    let request = match socks::read_connect_request(&mut stream).await {
        Ok(request) => request,
        Err(e) => {
            debug!("socks-remote: negotiation failed: {e}");
            return;
        }
    };

    let local = match listener::dial_local_host_port(&request.host, request.port).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("socks-remote: failed to dial {}:{}: {e}", request.host, request.port);
            let _ = socks::reply_unreachable(&mut stream).await;
            return;
        }
    };

    if socks::reply_success(&mut stream).await.is_err() {
        return;
    }

    stats.connection_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    stats.active_connections.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    pump::bridge(stream, local, pump::DEFAULT_IDLE_TIMEOUT, shutdown_rx, stats.as_ref()).await;
    stats.active_connections.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
}
