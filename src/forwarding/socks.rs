//! SOCKS5 request parsing (RFC 1928), generic over the stream carrying the
//! negotiation. Shared by `socks` (negotiated over the local accepted
//! stream) and `socks-remote` (negotiated over the SSH-forwarded channel).
//! Only the `CONNECT` command and the no-auth method are supported, which is
//! all a tunnel manager needs.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ManagerError;

mod wire {
    pub const VERSION: u8 = 0x05;
    pub const AUTH_NONE: u8 = 0x00;
    pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
    pub const CMD_CONNECT: u8 = 0x01;
    pub const ATYP_IPV4: u8 = 0x01;
    pub const ATYP_DOMAIN: u8 = 0x03;
    pub const ATYP_IPV6: u8 = 0x04;
    pub const REP_SUCCESS: u8 = 0x00;
    pub const REP_HOST_UNREACHABLE: u8 = 0x04;
    pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
    pub const REP_ADDR_NOT_SUPPORTED: u8 = 0x08;
}

/// A parsed `CONNECT` request: the destination the client asked for.
pub struct ConnectRequest {
    pub host: String,
    pub port: u16,
}

/// Run the greeting + request phases of a SOCKS5 negotiation on `stream`.
/// On success, the caller still owns `stream` and must send a reply via
/// [`reply`] once it knows whether the destination is reachable.
pub async fn read_connect_request<S>(stream: &mut S) -> Result<ConnectRequest, ManagerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 262];

    stream
        .read_exact(&mut buf[..2])
        .await
        .map_err(|e| ManagerError::Peer(format!("failed to read SOCKS5 greeting: {e}")))?;
    let version = buf[0];
    let nmethods = buf[1] as usize;
    if version != wire::VERSION {
        return Err(ManagerError::Peer(format!("unsupported SOCKS version: {version}")));
    }

    stream
        .read_exact(&mut buf[..nmethods])
        .await
        .map_err(|e| ManagerError::Peer(format!("failed to read SOCKS5 auth methods: {e}")))?;

    if !buf[..nmethods].contains(&wire::AUTH_NONE) {
        let _ = stream.write_all(&[wire::VERSION, wire::AUTH_NO_ACCEPTABLE]).await;
        return Err(ManagerError::Peer("client offered no acceptable SOCKS5 auth method".into()));
    }
    stream
        .write_all(&[wire::VERSION, wire::AUTH_NONE])
        .await
        .map_err(|e| ManagerError::Peer(format!("failed to send SOCKS5 auth reply: {e}")))?;

    stream
        .read_exact(&mut buf[..4])
        .await
        .map_err(|e| ManagerError::Peer(format!("failed to read SOCKS5 request: {e}")))?;
    let version = buf[0];
    let cmd = buf[1];
    let atyp = buf[3];
    if version != wire::VERSION {
        return Err(ManagerError::Peer("invalid SOCKS5 version in request".into()));
    }
    if cmd != wire::CMD_CONNECT {
        reply(stream, wire::REP_CMD_NOT_SUPPORTED).await?;
        return Err(ManagerError::Peer(format!("unsupported SOCKS5 command: {cmd}")));
    }

    let (host, port) = match atyp {
        wire::ATYP_IPV4 => {
            stream
                .read_exact(&mut buf[..6])
                .await
                .map_err(|e| ManagerError::Peer(format!("failed to read IPv4 address: {e}")))?;
            let ip = std::net::Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            (ip.to_string(), u16::from_be_bytes([buf[4], buf[5]]))
        }
        wire::ATYP_DOMAIN => {
            stream
                .read_exact(&mut buf[..1])
                .await
                .map_err(|e| ManagerError::Peer(format!("failed to read domain length: {e}")))?;
            let len = buf[0] as usize;
            stream
                .read_exact(&mut buf[..len + 2])
                .await
                .map_err(|e| ManagerError::Peer(format!("failed to read domain: {e}")))?;
            let domain = String::from_utf8_lossy(&buf[..len]).into_owned();
            (domain, u16::from_be_bytes([buf[len], buf[len + 1]]))
        }
        wire::ATYP_IPV6 => {
            stream
                .read_exact(&mut buf[..18])
                .await
                .map_err(|e| ManagerError::Peer(format!("failed to read IPv6 address: {e}")))?;
            let ip = std::net::Ipv6Addr::new(
                u16::from_be_bytes([buf[0], buf[1]]),
                u16::from_be_bytes([buf[2], buf[3]]),
                u16::from_be_bytes([buf[4], buf[5]]),
                u16::from_be_bytes([buf[6], buf[7]]),
                u16::from_be_bytes([buf[8], buf[9]]),
                u16::from_be_bytes([buf[10], buf[11]]),
                u16::from_be_bytes([buf[12], buf[13]]),
                u16::from_be_bytes([buf[14], buf[15]]),
            );
            (ip.to_string(), u16::from_be_bytes([buf[16], buf[17]]))
        }
        other => {
            reply(stream, wire::REP_ADDR_NOT_SUPPORTED).await?;
            return Err(ManagerError::Peer(format!("unsupported SOCKS5 address type: {other}")));
        }
    };

    Ok(ConnectRequest { host, port })
}

/// Send a reply with the fixed `0.0.0.0:0` bound-address field; real SOCKS5
/// clients only care about the status byte for `CONNECT`.
pub async fn reply<S>(stream: &mut S, status: u8) -> Result<(), ManagerError>
where
    S: AsyncWrite + Unpin,
{
    let msg = [wire::VERSION, status, 0x00, wire::ATYP_IPV4, 0, 0, 0, 0, 0, 0];
    stream
        .write_all(&msg)
        .await
        .map_err(|e| ManagerError::Peer(format!("failed to send SOCKS5 reply: {e}")))
}

pub async fn reply_success<S>(stream: &mut S) -> Result<(), ManagerError>
where
    S: AsyncWrite + Unpin,
{
    reply(stream, wire::REP_SUCCESS).await
}

pub async fn reply_unreachable<S>(stream: &mut S) -> Result<(), ManagerError>
where
    S: AsyncWrite + Unpin,
{
    reply(stream, wire::REP_HOST_UNREACHABLE).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn parses_domain_connect_request() {
        let (mut client, mut server) = duplex(256);

        let request_task = tokio::spawn(async move { read_connect_request(&mut server).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut greeting_reply = [0u8; 2];
        client.read_exact(&mut greeting_reply).await.unwrap();
        assert_eq!(greeting_reply, [0x05, 0x00]);

        let domain = b"example.org";
        let mut req = vec![0x05, 0x01, 0x00, 0x03, domain.len() as u8];
        req.extend_from_slice(domain);
        req.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let parsed = request_task.await.unwrap().unwrap();
        assert_eq!(parsed.host, "example.org");
        assert_eq!(parsed.port, 443);
    }

    #[tokio::test]
    async fn parses_ipv4_connect_request() {
        let (mut client, mut server) = duplex(256);
        let request_task = tokio::spawn(async move { read_connect_request(&mut server).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut greeting_reply = [0u8; 2];
        client.read_exact(&mut greeting_reply).await.unwrap();

        let mut req = vec![0x05, 0x01, 0x00, 0x01];
        req.extend_from_slice(&[127, 0, 0, 1]);
        req.extend_from_slice(&8080u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let parsed = request_task.await.unwrap().unwrap();
        assert_eq!(parsed.host, "127.0.0.1");
        assert_eq!(parsed.port, 8080);
    }

    #[tokio::test]
    async fn rejects_bind_command() {
        let (mut client, mut server) = duplex(256);
        let request_task = tokio::spawn(async move { read_connect_request(&mut server).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut greeting_reply = [0u8; 2];
        client.read_exact(&mut greeting_reply).await.unwrap();

        // cmd = BIND (0x02)
        client.write_all(&[0x05, 0x02, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).await.unwrap();

        assert!(request_task.await.unwrap().is_err());
    }
}
