//! Control-plane accept loop: bind the Unix socket, serve one task per
//! connection, dispatch `Request`s against the shared `TunnelRegistry`
//! (§4.G/§5). Dialing and forwarding always run outside the registry's lock.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{error, info, warn};

use crate::config::{parse_ssh_config, resolve_tunnel_chain, SshConfigHost};
use crate::daemon::protocol::{Request, Response};
use crate::error::ManagerError;
use crate::forwarding::{TunnelRegistry, TunnelSupervisor};

/// Bind `socket_path`, failing if it's already bound by a live daemon.
/// A stale path left behind by a crashed daemon is removed first.
pub async fn bind(socket_path: &Path) -> Result<UnixListener, ManagerError> {
    if socket_path.exists() {
        match UnixStream::connect(socket_path).await {
            Ok(_) => {
                return Err(ManagerError::Network(format!(
                    "a daemon is already listening on {}",
                    socket_path.display()
                )))
            }
            Err(_) => {
                let _ = std::fs::remove_file(socket_path);
            }
        }
    }

    UnixListener::bind(socket_path)
        .map_err(|e| ManagerError::Network(format!("failed to bind {}: {e}", socket_path.display())))
}

/// Serve control-plane connections off `listener` until the process exits.
pub async fn serve(listener: UnixListener, registry: Arc<TunnelRegistry>) {
    loop {
        let (stream, _peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("control socket accept error: {e}");
                continue;
            }
        };

        let registry = registry.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, registry).await {
                warn!("control connection error: {e}");
            }
        });
    }
}

async fn handle_connection(stream: UnixStream, registry: Arc<TunnelRegistry>) -> Result<(), ManagerError> {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    while let Some(frame) = framed.next().await {
        let frame = frame.map_err(|e| ManagerError::Protocol(format!("frame read error: {e}")))?;

        let request: Request = match serde_json::from_slice(&frame) {
            Ok(request) => request,
            Err(e) => {
                let response = Response::err(format!("malformed request: {e}"));
                send(&mut framed, &response).await?;
                continue;
            }
        };

        let response = dispatch(request, &registry).await;
        send(&mut framed, &response).await?;
    }

    Ok(())
}

async fn send(framed: &mut Framed<UnixStream, LengthDelimitedCodec>, response: &Response) -> Result<(), ManagerError> {
    let encoded = serde_json::to_vec(response).map_err(|e| ManagerError::Protocol(format!("encode error: {e}")))?;
    framed
        .send(Bytes::from(encoded))
        .await
        .map_err(|e| ManagerError::Protocol(format!("frame write error: {e}")))
}

async fn dispatch(request: Request, registry: &TunnelRegistry) -> Response {
    match request {
        Request::Nop => Response::ok(),
        Request::List => Response::ok_with_tunnels(registry.list().await),
        Request::Close { name } => match registry.close(&name).await {
            Ok(()) => Response::ok(),
            Err(e) => Response::err(e),
        },
        Request::Open { tunnel } => match open_tunnel(tunnel, registry).await {
            Ok(()) => Response::ok(),
            Err(e) => Response::err(e),
        },
    }
}

async fn open_tunnel(desc: crate::model::TunnelDesc, registry: &TunnelRegistry) -> Result<(), ManagerError> {
    if registry.contains(&desc.name) {
        return Err(ManagerError::Config(format!("tunnel {} is already open", desc.name)));
    }

    let hosts: Vec<SshConfigHost> = parse_ssh_config(None)
        .await
        .map_err(|e| ManagerError::Config(format!("failed to read SSH config: {e}")))?;

    let mut chain = resolve_tunnel_chain(&desc, &hosts)?;
    crate::config::attach_signers(&mut chain).await?;

    info!("opening tunnel {} ({:?}) via {}", desc.name, desc.mode, desc.host);
    let name = desc.name.clone();
    let supervisor = TunnelSupervisor::open(desc, chain).await?;
    if let Err((e, supervisor)) = registry.insert(name.clone(), supervisor) {
        error!("registry rejected tunnel {name} after it was dialed; closing it");
        supervisor.close().await;
        return Err(e);
    }
    Ok(())
}
