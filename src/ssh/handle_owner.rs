//! Handle Owner Task
//!
//! This module implements the "single owner" pattern for SSH Handle.
//!
//! # Architecture
//!
//! Only one task owns the `Handle<ClientHandler>`. All other components
//! communicate with it via `HandleController` which sends commands through
//! an mpsc channel.
//!
//! This avoids:
//! - `Arc<Mutex<Handle>>` lock contention
//! - Deadlocks from holding locks across `.await`
//! - Protocol violations from concurrent Handle access
//!
//! The owner task also drives its own liveness: on a timer it sends an
//! SSH keepalive through the handle it owns, independently of any caller
//! command. A session that dies quietly on the remote end (killed daemon,
//! dropped network) only surfaces through a failing handle call, and
//! nothing else in this task ever calls the handle without a caller
//! command in flight — so without this self-probe a dead session would
//! sit invisible until something happened to ask it to do work.
//!
//! # Usage
//!
//! ```ignore
//! let controller = spawn_handle_owner_task(handle, session_id, remote_target);
//!
//! // Request remote forward
//! let bound_port = controller.tcpip_forward("0.0.0.0", 8080).await?;
//!
//! // React to the session dying, spontaneously or otherwise
//! let mut disconnect_rx = controller.subscribe_disconnect();
//! disconnect_rx.recv().await.ok();
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;
use crate::forwarding::RemoteTarget;

/// How often the owner task checks the handle is still alive by itself,
/// independent of whatever commands callers happen to be sending.
const KEEPALIVE_PROBE_INTERVAL: Duration = Duration::from_secs(15);
const KEEPALIVE_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a direct-tcpip channel (for local forward / dynamic forward)
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Request remote forward (tcpip-forward)
    TcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<u32, russh::Error>>,
    },

    /// Cancel remote forward
    CancelTcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<(), russh::Error>>,
    },

    /// Disconnect the SSH connection
    Disconnect,
}

/// Controller for sending commands to the Handle Owner Task
///
/// # Clone Semantics
///
/// `HandleController` implements `Clone`. This means:
/// - Any module holding a `HandleController` has **full SSH control**
/// - Can open any channel, create any forward, or disconnect
///
/// # Design Decision
///
/// This is **intentional**:
/// 1. **Simple passing**: No Arc needed, clone cost is low (just copies Sender)
/// 2. **Trust boundary**: Only in-process Rust code can obtain a Controller
/// 3. **Full capability**: Forwarding needs full control of the session
///
/// # Security Considerations
///
/// - **Do not** expose `HandleController` to untrusted code
/// - **Do not** serialize or pass across process boundaries
/// - Fine-grained permission control belongs at the daemon's request
///   boundary, not here
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    /// Broadcast sender for SSH disconnect notification.
    /// Subscribers (like port forwards) can listen for disconnection.
    disconnect_tx: broadcast::Sender<()>,
    /// Shared with this session's `ClientHandler`: what to do with
    /// forwarded-tcpip channels the server opens back at us.
    remote_target: Arc<RwLock<Option<RemoteTarget>>>,
}

impl HandleController {
    /// Create a new HandleController with the given sender
    ///
    /// This is primarily used for testing. In production, use `spawn_handle_owner_task`.
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        let (disconnect_tx, _) = broadcast::channel(1);
        Self { cmd_tx, disconnect_tx, remote_target: Arc::new(RwLock::new(None)) }
    }

    /// Route this session's forwarded-tcpip channels to `target`. Set once
    /// the forwarding engine has successfully requested a remote listener.
    pub fn set_remote_target(&self, target: RemoteTarget) {
        *self.remote_target.write() = Some(target);
    }

    pub fn clear_remote_target(&self) {
        *self.remote_target.write() = None;
    }

    /// Subscribe to SSH disconnect notifications.
    ///
    /// Returns a receiver that fires once the session is gone, whether
    /// that's an explicit `disconnect()`, every controller being dropped,
    /// or the owner task's own keepalive probe finding the handle dead.
    ///
    /// # Example
    /// ```ignore
    /// let mut disconnect_rx = controller.subscribe_disconnect();
    /// tokio::select! {
    ///     _ = disconnect_rx.recv() => {
    ///         info!("SSH disconnected, stopping forward");
    ///         break;
    ///     }
    ///     // ... other branches
    /// }
    /// ```
    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    /// Open a direct-tcpip channel (for local forward / dynamic forward)
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    /// Request remote port forward (tcpip-forward)
    ///
    /// Returns the actual bound port (may differ if requested port was 0)
    pub async fn tcpip_forward(&self, address: &str, port: u32) -> Result<u32, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::TcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ConnectionFailed(e.to_string()))
    }

    /// Cancel a remote port forward
    pub async fn cancel_tcpip_forward(&self, address: &str, port: u32) -> Result<(), SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::CancelTcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ConnectionFailed(e.to_string()))
    }

    /// Disconnect the SSH connection
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }
}

/// Spawn the Handle Owner Task
///
/// Consumes ownership of the Handle and returns a HandleController for sending commands.
///
/// # Arguments
///
/// * `handle` - The SSH Handle (ownership transferred to the task)
/// * `session_id` - Session ID for logging
///
/// # Returns
///
/// A `HandleController` that can be cloned and used to send commands.
pub fn spawn_handle_owner_task(
    handle: Handle<ClientHandler>,
    session_id: String,
    remote_target: Arc<RwLock<Option<RemoteTarget>>>,
) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let (disconnect_tx, _) = broadcast::channel::<()>(1);
    let disconnect_tx_clone = disconnect_tx.clone();

    tokio::spawn(async move {
        let mut handle = handle; // Move into task, becomes sole owner

        info!("Handle owner task started for session {}", session_id);

        let mut probe = tokio::time::interval(KEEPALIVE_PROBE_INTERVAL);
        probe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        probe.tick().await; // first tick fires immediately; skip it

        let died_on_probe = loop {
            tokio::select! {
                _ = probe.tick() => {
                    if let Err(reason) = keepalive_probe(&mut handle, &session_id).await {
                        warn!("session {session_id}: keepalive probe failed ({reason}), treating as dead");
                        break true;
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(HandleCommand::ChannelOpenDirectTcpip {
                            host,
                            port,
                            originator_host,
                            originator_port,
                            reply_tx,
                        }) => {
                            let result = handle
                                .channel_open_direct_tcpip(
                                    &host,
                                    port,
                                    &originator_host,
                                    originator_port,
                                )
                                .await;
                            if reply_tx.send(result).is_err() {
                                warn!("Caller dropped before receiving direct_tcpip result");
                            }
                        }

                        Some(HandleCommand::TcpipForward { address, port, reply_tx }) => {
                            let result = handle.tcpip_forward(&address, port).await;
                            match &result {
                                Ok(bound_port) => {
                                    let bound_port = *bound_port;
                                    if reply_tx.send(result).is_err() {
                                        // CRITICAL: Caller disappeared, but forward was established
                                        // Must cancel immediately to avoid "ghost forward"
                                        warn!(
                                            "Caller dropped after tcpip_forward succeeded. \
                                             Cancelling orphaned forward {}:{}",
                                            address, bound_port
                                        );
                                        let _ =
                                            handle.cancel_tcpip_forward(&address, bound_port).await;
                                    }
                                }
                                Err(_) => {
                                    let _ = reply_tx.send(result);
                                }
                            }
                        }

                        Some(HandleCommand::CancelTcpipForward { address, port, reply_tx }) => {
                            let result = handle.cancel_tcpip_forward(&address, port).await;
                            if reply_tx.send(result).is_err() {
                                warn!("Caller dropped before receiving cancel_tcpip_forward result");
                            }
                        }

                        Some(HandleCommand::Disconnect) => {
                            info!("Disconnect requested for session {}", session_id);
                            break false;
                        }

                        None => {
                            info!("All controllers dropped for session {}", session_id);
                            break false;
                        }
                    }
                }
            }
        };

        // === Cleanup phase ===
        // Notify all disconnect subscribers (port forwards, etc.)
        // The send() may fail if no subscribers, which is fine
        let _ = disconnect_tx_clone.send(());

        // Drain all pending commands, notify callers that connection is closed
        drain_pending_commands(&mut cmd_rx);

        if !died_on_probe {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
                .await;
        }
        info!("Handle owner task terminated for session {}", session_id);
    });

    HandleController { cmd_tx, disconnect_tx, remote_target }
}

/// Send an SSH keepalive through `handle` and judge the session by whether
/// it answers in time. Returns the failure reason as a string for logging.
async fn keepalive_probe(handle: &mut Handle<ClientHandler>, session_id: &str) -> Result<(), String> {
    debug!("keepalive probe for session {session_id}");
    match tokio::time::timeout(KEEPALIVE_PROBE_TIMEOUT, handle.send_keepalive(true)).await {
        Ok(Ok(())) => {
            debug!("keepalive OK for session {session_id}");
            Ok(())
        }
        Ok(Err(e)) => Err(format!("{e:?}")),
        Err(_) => Err(format!("no reply within {KEEPALIVE_PROBE_TIMEOUT:?}")),
    }
}

/// Drain all pending commands, returning Disconnected error to each
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    // Close receiver first, prevent new messages
    cmd_rx.close();

    // Drain all messages already in queue
    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::TcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::CancelTcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Disconnect => {
                // Already disconnecting, ignore
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn commands_fail_once_receiver_is_dropped() {
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let controller = HandleController::new(cmd_tx);
        drop(cmd_rx);

        let err = controller.open_direct_tcpip("example.com", 80, "127.0.0.1", 0).await.unwrap_err();
        assert!(matches!(err, SshError::Disconnected));
    }

    #[tokio::test]
    async fn drain_pending_commands_resolves_every_waiting_reply() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(8);

        let (direct_tx, direct_rx) = oneshot::channel();
        let (tcpip_tx, tcpip_rx) = oneshot::channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();

        cmd_tx
            .send(HandleCommand::ChannelOpenDirectTcpip {
                host: "example.com".into(),
                port: 80,
                originator_host: "127.0.0.1".into(),
                originator_port: 0,
                reply_tx: direct_tx,
            })
            .await
            .unwrap();
        cmd_tx
            .send(HandleCommand::TcpipForward {
                address: "0.0.0.0".into(),
                port: 8080,
                reply_tx: tcpip_tx,
            })
            .await
            .unwrap();
        cmd_tx
            .send(HandleCommand::CancelTcpipForward {
                address: "0.0.0.0".into(),
                port: 8080,
                reply_tx: cancel_tx,
            })
            .await
            .unwrap();

        drain_pending_commands(&mut cmd_rx);

        assert!(direct_rx.await.unwrap().is_err());
        assert!(tcpip_rx.await.unwrap().is_err());
        assert!(cancel_rx.await.unwrap().is_err());

        // The channel is closed, so the owner task would stop looping.
        assert!(cmd_rx.try_recv().is_err());
        assert!(cmd_tx.send(HandleCommand::Disconnect).await.is_err());
    }

    #[tokio::test]
    async fn remote_target_slot_round_trips() {
        let (cmd_tx, _cmd_rx) = mpsc::channel(4);
        let controller = HandleController::new(cmd_tx);
        assert!(controller.remote_target.read().is_none());

        controller.set_remote_target(RemoteTarget::Socks {
            stats: Arc::new(crate::forwarding::pump::TunnelStats::default()),
            shutdown: tokio::sync::broadcast::channel(1).0,
        });
        assert!(controller.remote_target.read().is_some());

        controller.clear_remote_target();
        assert!(controller.remote_target.read().is_none());
    }
}
