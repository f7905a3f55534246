//! One supervisor per tunnel (§4.F): drives `Pending -> Connecting -> Open`,
//! `any -> Closing -> Closed`, `Connecting -> Failed`. Owns the `HopChain`'s
//! SSH sessions and the forwarding engine's listener/remote-forward. On any
//! session-level error it transitions to `Failed` and stops; it never
//! reconnects on its own.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::error::ManagerError;
use crate::forwarding::pump::{ForwardStats, TunnelStats};
use crate::forwarding::{local, remote, socks_local};
use crate::model::{Endpoint, HopChain, TunnelDesc, TunnelMode, TunnelState};
use crate::ssh::dial::{dial, SessionChain};

enum Engine {
    Local(local::LocalForward),
    Socks(socks_local::SocksForward),
    Remote(remote::RemoteForward),
}

/// A live tunnel: its dialed sessions, its running forward, and the state
/// the control plane reports through `List`.
pub struct TunnelSupervisor {
    pub desc: TunnelDesc,
    pub bound_addr: String,
    state: Arc<AtomicU8>,
    stats: Arc<TunnelStats>,
    sessions: SessionChain,
    engine: Option<Engine>,
    shutdown_tx: broadcast::Sender<()>,
    watchdog: tokio::task::JoinHandle<()>,
}

const PENDING: u8 = 0;
const CONNECTING: u8 = 1;
const OPEN: u8 = 2;
const CLOSING: u8 = 3;
const CLOSED: u8 = 4;
const FAILED: u8 = 5;

fn state_from_u8(v: u8) -> TunnelState {
    match v {
        PENDING => TunnelState::Pending,
        CONNECTING => TunnelState::Connecting,
        OPEN => TunnelState::Open,
        CLOSING => TunnelState::Closing,
        CLOSED => TunnelState::Closed,
        _ => TunnelState::Failed,
    }
}

impl TunnelSupervisor {
    /// Dial `chain` and start the forwarding strategy `desc.mode` calls for.
    /// Returns a supervisor already in the `Open` state, or an error with
    /// nothing left running.
    pub async fn open(desc: TunnelDesc, chain: HopChain) -> Result<Self, ManagerError> {
        let state = Arc::new(AtomicU8::new(CONNECTING));
        let sessions = dial(&chain).await?;
        let terminal = sessions.terminal().clone();

        let stats = Arc::new(TunnelStats::default());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let engine_result = Self::start_engine(&desc, terminal, shutdown_rx, shutdown_tx.clone(), stats.clone()).await;

        let (engine, bound_addr) = match engine_result {
            Ok(pair) => pair,
            Err(e) => {
                sessions.close_all().await;
                return Err(e);
            }
        };

        state.store(OPEN, Ordering::SeqCst);

        let disconnect_rx = sessions.terminal().subscribe_disconnect();
        let watchdog = Self::spawn_watchdog(desc.name.clone(), disconnect_rx, state.clone());

        Ok(Self {
            desc,
            bound_addr,
            state,
            stats,
            sessions,
            engine: Some(engine),
            shutdown_tx,
            watchdog,
        })
    }

    async fn start_engine(
        desc: &TunnelDesc,
        terminal: crate::ssh::handle_owner::HandleController,
        shutdown_rx: broadcast::Receiver<()>,
        shutdown_tx: broadcast::Sender<()>,
        stats: Arc<TunnelStats>,
    ) -> Result<(Engine, String), ManagerError> {
        match desc.mode {
            TunnelMode::Local => {
                let local_endpoint = parse_required(&desc.local, "local")?;
                let remote_endpoint = parse_required(&desc.remote, "remote")?;
                let (remote_host, remote_port) = tcp_parts(&remote_endpoint)?;
                let forward = local::start(&local_endpoint, remote_host, remote_port, terminal, shutdown_rx, stats).await?;
                let bound = forward.bound_addr.clone();
                Ok((Engine::Local(forward), bound))
            }
            TunnelMode::Socks => {
                let local_endpoint = parse_required(&desc.local, "local")?;
                let forward = socks_local::start(&local_endpoint, terminal, shutdown_rx, stats).await?;
                let bound = forward.bound_addr.clone();
                Ok((Engine::Socks(forward), bound))
            }
            TunnelMode::Remote => {
                let remote_bind = parse_required(&desc.remote, "remote")?;
                let local_target = parse_required(&desc.local, "local")?;
                let forward = remote::start_fixed(&remote_bind, local_target, terminal, shutdown_tx, stats).await?;
                let bound = forward.bound_addr.clone();
                Ok((Engine::Remote(forward), bound))
            }
            TunnelMode::SocksRemote => {
                let remote_bind = parse_required(&desc.remote, "remote")?;
                let forward = remote::start_socks(&remote_bind, terminal, shutdown_tx, stats).await?;
                let bound = forward.bound_addr.clone();
                Ok((Engine::Remote(forward), bound))
            }
        }
    }

    /// Mark the tunnel `Failed` the moment its terminal session disconnects,
    /// unless it's already being closed deliberately. No auto-reconnect.
    fn spawn_watchdog(
        name: String,
        mut disconnect_rx: broadcast::Receiver<()>,
        state: Arc<AtomicU8>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let _ = disconnect_rx.recv().await;
            warn!("tunnel {name}: underlying SSH session disconnected");
            let _ = state.compare_exchange(OPEN, FAILED, Ordering::SeqCst, Ordering::SeqCst);
        })
    }

    pub fn state(&self) -> TunnelState {
        state_from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn stats(&self) -> ForwardStats {
        self.stats.snapshot()
    }

    /// `Closing -> Closed`: stop accepting new connections, tear down the
    /// forward and every dialed session.
    pub async fn close(mut self) {
        self.state.store(CLOSING, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
        self.watchdog.abort();

        match self.engine.take() {
            Some(Engine::Local(forward)) => forward.stop(),
            Some(Engine::Socks(forward)) => forward.stop(),
            Some(Engine::Remote(forward)) => forward.stop().await,
            None => {}
        }

        self.sessions.close_all().await;
        self.state.store(CLOSED, Ordering::SeqCst);
        info!("tunnel {} closed", self.desc.name);
    }
}

fn parse_required(field: &Option<String>, name: &str) -> Result<Endpoint, ManagerError> {
    let value = field
        .as_deref()
        .ok_or_else(|| ManagerError::Config(format!("tunnel mode requires a {name} endpoint")))?;
    Endpoint::parse(value)
}

fn tcp_parts(endpoint: &Endpoint) -> Result<(String, u16), ManagerError> {
    match endpoint {
        Endpoint::Tcp { host, port } => Ok((host.clone(), *port)),
        Endpoint::Unix { path } => Err(ManagerError::Config(format!(
            "expected a TCP endpoint, got unix path {}",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_endpoint() {
        let err = parse_required(&None, "local").unwrap_err();
        match err {
            ManagerError::Config(msg) => assert!(msg.contains("local")),
            other => panic!("expected Config error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn watchdog_flips_open_to_failed_on_disconnect() {
        let state = Arc::new(AtomicU8::new(OPEN));
        let (tx, rx) = broadcast::channel(1);
        let watchdog = TunnelSupervisor::spawn_watchdog("t".into(), rx, state.clone());

        let _ = tx.send(());
        watchdog.await.unwrap();

        assert_eq!(state_from_u8(state.load(Ordering::SeqCst)), TunnelState::Failed);
    }

    #[tokio::test]
    async fn watchdog_leaves_a_tunnel_already_closing_alone() {
        let state = Arc::new(AtomicU8::new(CLOSING));
        let (tx, rx) = broadcast::channel(1);
        let watchdog = TunnelSupervisor::spawn_watchdog("t".into(), rx, state.clone());

        let _ = tx.send(());
        watchdog.await.unwrap();

        assert_eq!(state_from_u8(state.load(Ordering::SeqCst)), TunnelState::Closing);
    }

    #[test]
    fn state_round_trips_through_u8() {
        assert_eq!(state_from_u8(PENDING), TunnelState::Pending);
        assert_eq!(state_from_u8(CONNECTING), TunnelState::Connecting);
        assert_eq!(state_from_u8(OPEN), TunnelState::Open);
        assert_eq!(state_from_u8(CLOSING), TunnelState::Closing);
        assert_eq!(state_from_u8(CLOSED), TunnelState::Closed);
        assert_eq!(state_from_u8(FAILED), TunnelState::Failed);
    }
}
