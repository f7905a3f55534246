//! `local` mode: bind a listener on this machine and bridge every accepted
//! connection to a fixed remote destination reached through the SSH
//! session's terminal hop via `direct-tcpip`.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::ManagerError;
use crate::forwarding::listener::LocalListener;
use crate::forwarding::pump::{self, TunnelStats};
use crate::model::Endpoint;
use crate::ssh::handle_owner::HandleController;

/// A bound `local` listener, running its accept loop in the background.
/// Aborting the accept task drops the listener with it, which for a Unix
/// socket removes its path from disk.
pub struct LocalForward {
    pub bound_addr: String,
    accept_task: tokio::task::JoinHandle<()>,
}

impl LocalForward {
    pub fn stop(self) {
        self.accept_task.abort();
    }
}

pub async fn start(
    local: &Endpoint,
    remote_host: String,
    remote_port: u16,
    terminal: HandleController,
    shutdown_rx: broadcast::Receiver<()>,
    stats: Arc<TunnelStats>,
) -> Result<LocalForward, ManagerError> {
    let listener = LocalListener::bind(local).await?;
    let bound_addr = listener.local_addr_string();

    let accept_task = tokio::spawn(accept_loop(listener, terminal, remote_host, remote_port, shutdown_rx, stats));

    Ok(LocalForward { bound_addr, accept_task })
}

async fn accept_loop(
    listener: LocalListener,
    terminal: HandleController,
    remote_host: String,
    remote_port: u16,
    mut shutdown_rx: broadcast::Receiver<()>,
    stats: Arc<TunnelStats>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            accept = listener.accept() => {
                let (stream, peer) = match accept {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("local forward: accept error: {e}");
                        continue;
                    }
                };
                debug!("local forward: accepted connection from {peer}");

                stats.connection_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                stats.active_connections.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

                let terminal = terminal.clone();
                let remote_host = remote_host.clone();
                let stats = stats.clone();
                let mut conn_shutdown = shutdown_rx.resubscribe();

                tokio::spawn(async move {
                    match terminal.open_direct_tcpip(&remote_host, remote_port as u32, "127.0.0.1", 0).await {
                        Ok(channel) => {
                            pump::bridge(stream, channel.into_stream(), pump::DEFAULT_IDLE_TIMEOUT, &mut conn_shutdown, stats.as_ref()).await;
                        }
                        Err(e) => warn!("local forward: failed to open channel to {remote_host}:{remote_port}: {e}"),
                    }
                    stats.active_connections.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
                });
            }
        }
    }
}
