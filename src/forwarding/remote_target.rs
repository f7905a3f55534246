//! What a terminal hop's forwarded-tcpip channels should be routed to.
//!
//! Set on the `HandleController` once the forwarding engine has requested a
//! remote listener (§4.E "remote"/"socks-remote"), and read back by
//! `ClientHandler::server_channel_open_forwarded_tcpip` for every incoming
//! channel on that session. `None` means the session never asked for a
//! remote forward; any forwarded-tcpip channel that arrives anyway is
//! rejected rather than silently dropped on the floor.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::forwarding::pump::TunnelStats;
use crate::model::Endpoint;

#[derive(Clone)]
pub enum RemoteTarget {
    /// `remote` mode: every forwarded channel is bridged to the same local
    /// endpoint.
    Fixed {
        endpoint: Endpoint,
        stats: Arc<TunnelStats>,
        shutdown: broadcast::Sender<()>,
    },
    /// `socks-remote` mode: this process negotiates SOCKS5 on the channel
    /// itself and dials whatever the remote party asked for.
    Socks {
        stats: Arc<TunnelStats>,
        shutdown: broadcast::Sender<()>,
    },
}
