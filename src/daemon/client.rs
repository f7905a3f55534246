//! Thin request/response sender used by the `boring` CLI: one frame out,
//! one frame back, over a socket already connected by `ensure::connect`.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::daemon::protocol::{Request, Response};
use crate::error::ManagerError;

pub async fn send(stream: UnixStream, request: &Request) -> Result<Response, ManagerError> {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    let encoded = serde_json::to_vec(request).map_err(|e| ManagerError::Protocol(format!("encode error: {e}")))?;
    framed
        .send(Bytes::from(encoded))
        .await
        .map_err(|e| ManagerError::Protocol(format!("frame write error: {e}")))?;

    let frame = framed
        .next()
        .await
        .ok_or_else(|| ManagerError::Protocol("daemon closed the connection without replying".into()))?
        .map_err(|e| ManagerError::Protocol(format!("frame read error: {e}")))?;

    serde_json::from_slice(&frame).map_err(|e| ManagerError::Protocol(format!("malformed response: {e}")))
}

/// Connect via the ensure-running bootstrap and send one request.
pub async fn request(request: Request) -> Result<Response, ManagerError> {
    let stream = crate::daemon::ensure::connect().await?;
    send(stream, &request).await
}
