//! Local listener abstraction: a tunnel's `local` endpoint may be a TCP
//! socket or a Unix-domain socket (§3 `Endpoint`). Both accept into the same
//! boxed stream type so the rest of the forwarding engine never needs to
//! know which one it has.

use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

use crate::error::ManagerError;
use crate::model::Endpoint;

/// Blanket marker for "anything the pump can bridge", so listeners and
/// dialers can hand back a single boxed type regardless of transport.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + ?Sized> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

pub enum LocalListener {
    Tcp(TcpListener),
    Unix(UnixListener, PathBuf),
}

impl LocalListener {
    /// Bind `endpoint`. A bare port was already expanded to
    /// `localhost:port` by `Endpoint::parse`; a Unix path is bound directly
    /// and its socket file is removed by `Drop`.
    pub async fn bind(endpoint: &Endpoint) -> Result<Self, ManagerError> {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let addr = format!("{host}:{port}");
                let listener = TcpListener::bind(&addr)
                    .await
                    .map_err(|e| ManagerError::Network(format!("failed to bind {addr}: {e}")))?;
                Ok(Self::Tcp(listener))
            }
            Endpoint::Unix { path } => {
                if path.exists() {
                    let _ = std::fs::remove_file(path);
                }
                let listener = UnixListener::bind(path)
                    .map_err(|e| ManagerError::Network(format!("failed to bind {}: {e}", path.display())))?;
                Ok(Self::Unix(listener, path.clone()))
            }
        }
    }

    pub fn local_addr_string(&self) -> String {
        match self {
            Self::Tcp(l) => l
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".into()),
            Self::Unix(_, path) => path.display().to_string(),
        }
    }

    pub async fn accept(&self) -> std::io::Result<(BoxedStream, String)> {
        match self {
            Self::Tcp(l) => {
                let (stream, peer) = l.accept().await?;
                stream.set_nodelay(true).ok();
                Ok((Box::new(stream), peer.to_string()))
            }
            Self::Unix(l, _) => {
                let (stream, _) = l.accept().await?;
                Ok((Box::new(stream), "unix-peer".to_string()))
            }
        }
    }
}

impl Drop for LocalListener {
    fn drop(&mut self) {
        if let Self::Unix(_, path) = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Dial `endpoint` from the local process (used when the remote side is an
/// SSH-forwarded channel and the local side is the real destination: the
/// `remote` and `socks-remote` modes).
pub async fn dial_local(endpoint: &Endpoint) -> Result<BoxedStream, ManagerError> {
    match endpoint {
        Endpoint::Tcp { host, port } => {
            let addr = format!("{host}:{port}");
            let stream = TcpStream::connect(&addr)
                .await
                .map_err(|e| ManagerError::Network(format!("failed to connect to {addr}: {e}")))?;
            stream.set_nodelay(true).ok();
            Ok(Box::new(stream))
        }
        Endpoint::Unix { path } => {
            let stream = UnixStream::connect(path)
                .await
                .map_err(|e| ManagerError::Network(format!("failed to connect to {}: {e}", path.display())))?;
            Ok(Box::new(stream))
        }
    }
}

pub async fn dial_local_host_port(host: &str, port: u16) -> Result<BoxedStream, ManagerError> {
    let addr = format!("{host}:{port}");
    let stream = TcpStream::connect(&addr)
        .await
        .map_err(|e| ManagerError::Network(format!("failed to connect to {addr}: {e}")))?;
    stream.set_nodelay(true).ok();
    Ok(Box::new(stream))
}
