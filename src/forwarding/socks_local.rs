//! `socks` mode: bind a local SOCKS5 proxy, negotiate the destination on the
//! accepted stream, and bridge it to a `direct-tcpip` channel opened for
//! whatever the client asked for.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::ManagerError;
use crate::forwarding::listener::LocalListener;
use crate::forwarding::pump::{self, TunnelStats};
use crate::forwarding::socks;
use crate::model::Endpoint;
use crate::ssh::handle_owner::HandleController;

pub struct SocksForward {
    pub bound_addr: String,
    accept_task: tokio::task::JoinHandle<()>,
}

impl SocksForward {
    pub fn stop(self) {
        self.accept_task.abort();
    }
}

pub async fn start(
    local: &Endpoint,
    terminal: HandleController,
    shutdown_rx: broadcast::Receiver<()>,
    stats: Arc<TunnelStats>,
) -> Result<SocksForward, ManagerError> {
    let listener = LocalListener::bind(local).await?;
    let bound_addr = listener.local_addr_string();

    let accept_task = tokio::spawn(accept_loop(listener, terminal, shutdown_rx, stats));

    Ok(SocksForward { bound_addr, accept_task })
}

async fn accept_loop(
    listener: LocalListener,
    terminal: HandleController,
    mut shutdown_rx: broadcast::Receiver<()>,
    stats: Arc<TunnelStats>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            accept = listener.accept() => {
                let (mut stream, peer) = match accept {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("socks forward: accept error: {e}");
                        continue;
                    }
                };
                debug!("socks forward: accepted connection from {peer}");

                let terminal = terminal.clone();
                let stats = stats.clone();
                let mut conn_shutdown = shutdown_rx.resubscribe();

                tokio::spawn(async move {
                    let request = match socks::read_connect_request(&mut stream).await {
                        Ok(request) => request,
                        Err(e) => {
                            debug!("socks forward: negotiation failed: {e}");
                            return;
                        }
                    };

                    let channel = match terminal
                        .open_direct_tcpip(&request.host, request.port as u32, "127.0.0.1", 0)
                        .await
                    {
                        Ok(channel) => channel,
                        Err(e) => {
                            warn!("socks forward: failed to reach {}:{}: {e}", request.host, request.port);
                            let _ = socks::reply_unreachable(&mut stream).await;
                            return;
                        }
                    };

                    if socks::reply_success(&mut stream).await.is_err() {
                        return;
                    }

                    stats.connection_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    stats.active_connections.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    pump::bridge(stream, channel.into_stream(), pump::DEFAULT_IDLE_TIMEOUT, &mut conn_shutdown, stats.as_ref()).await;
                    stats.active_connections.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
                });
            }
        }
    }
}
