//! The paired bidirectional byte copy shared by every forwarding mode
//! (§4.E "pump"): two concurrent copies between any two streams that are
//! `AsyncRead + AsyncWrite`, with an idle timeout and cooperative shutdown.
//!
//! Generic over the stream types so the same primitive serves all four
//! tunnel modes: a local TCP or Unix socket on one side, an SSH channel
//! (via `Channel::into_stream`) on the other - and, for the SOCKS modes,
//! sometimes a plain TCP dial on both sides of what was itself negotiated
//! over an SSH channel.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tracing::debug;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Sink for per-pair byte counters. Each forwarding mode keeps its
/// statistics in whatever container suits its accept loop; this trait lets
/// the pump stay agnostic about it.
pub trait PumpStats: Send + Sync {
    fn record_sent(&self, n: u64);
    fn record_received(&self, n: u64);
}

/// Connection/byte counters for one running tunnel, shared between the
/// accept loop and every spawned pump pair.
#[derive(Debug, Default)]
pub struct TunnelStats {
    pub connection_count: std::sync::atomic::AtomicU64,
    pub active_connections: std::sync::atomic::AtomicU64,
    pub bytes_sent: std::sync::atomic::AtomicU64,
    pub bytes_received: std::sync::atomic::AtomicU64,
}

impl PumpStats for TunnelStats {
    fn record_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, std::sync::atomic::Ordering::Relaxed);
    }

    fn record_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, std::sync::atomic::Ordering::Relaxed);
    }
}

/// Snapshot of `TunnelStats` for the control plane.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ForwardStats {
    pub connection_count: u64,
    pub active_connections: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl TunnelStats {
    pub fn snapshot(&self) -> ForwardStats {
        use std::sync::atomic::Ordering::Relaxed;
        ForwardStats {
            connection_count: self.connection_count.load(Relaxed),
            active_connections: self.active_connections.load(Relaxed),
            bytes_sent: self.bytes_sent.load(Relaxed),
            bytes_received: self.bytes_received.load(Relaxed),
        }
    }
}

/// Bridge two streams until either side observes EOF or an error, or
/// `shutdown_rx` fires (the listener's own Close signal). Both copy
/// directions always run to completion before this function returns, and
/// each side's write half is shut down on exit so the peer sees a clean
/// half-close where the transport supports it.
pub async fn bridge<A, B>(
    a: A,
    b: B,
    idle_timeout: Duration,
    shutdown_rx: &mut broadcast::Receiver<()>,
    stats: &dyn PumpStats,
) where
    A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let (close_tx, _) = broadcast::channel::<()>(1);

    let mut close_rx_fwd = close_tx.subscribe();
    let mut shutdown_fwd = shutdown_rx.resubscribe();
    let close_tx_fwd = close_tx.clone();
    let forward = async move {
        let mut buf = vec![0u8; 32 * 1024];
        loop {
            tokio::select! {
                biased;
                _ = close_rx_fwd.recv() => break,
                _ = shutdown_fwd.recv() => break,
                result = tokio::time::timeout(idle_timeout, a_read.read(&mut buf)) => {
                    match result {
                        Ok(Ok(0)) => break,
                        Ok(Ok(n)) => {
                            stats.record_sent(n as u64);
                            if b_write.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                        Ok(Err(e)) => {
                            debug!("pump: read error: {e}");
                            break;
                        }
                        Err(_) => {
                            debug!("pump: idle timeout ({}s)", idle_timeout.as_secs());
                            break;
                        }
                    }
                }
            }
        }
        let _ = b_write.shutdown().await;
        let _ = close_tx_fwd.send(());
    };

    let mut close_rx_rev = close_tx.subscribe();
    let mut shutdown_rev = shutdown_rx.resubscribe();
    let close_tx_rev = close_tx.clone();
    let reverse = async move {
        let mut buf = vec![0u8; 32 * 1024];
        loop {
            tokio::select! {
                biased;
                _ = close_rx_rev.recv() => break,
                _ = shutdown_rev.recv() => break,
                result = tokio::time::timeout(idle_timeout, b_read.read(&mut buf)) => {
                    match result {
                        Ok(Ok(0)) => break,
                        Ok(Ok(n)) => {
                            stats.record_received(n as u64);
                            if a_write.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                        Ok(Err(e)) => {
                            debug!("pump: read error: {e}");
                            break;
                        }
                        Err(_) => {
                            debug!("pump: idle timeout ({}s)", idle_timeout.as_secs());
                            break;
                        }
                    }
                }
            }
        }
        let _ = a_write.shutdown().await;
        let _ = close_tx_rev.send(());
    };

    tokio::join!(forward, reverse);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    struct NullStats;
    impl PumpStats for NullStats {
        fn record_sent(&self, _: u64) {}
        fn record_received(&self, _: u64) {}
    }

    #[tokio::test]
    async fn bridges_until_both_sides_close() {
        let (a, mut a_peer) = duplex(64);
        let (b, mut b_peer) = duplex(64);
        let (_shutdown_tx, mut shutdown_rx) = broadcast::channel(1);

        let bridge_task = tokio::spawn(async move {
            bridge(a, b, Duration::from_secs(5), &mut shutdown_rx, &NullStats).await;
        });

        a_peer.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        b_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        b_peer.write_all(b"world").await.unwrap();
        let mut buf2 = [0u8; 5];
        a_peer.read_exact(&mut buf2).await.unwrap();
        assert_eq!(&buf2, b"world");

        drop(a_peer);
        drop(b_peer);
        bridge_task.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_signal_unwinds_both_directions() {
        let (a, _a_peer) = duplex(64);
        let (b, _b_peer) = duplex(64);
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);

        let bridge_task = tokio::spawn(async move {
            bridge(a, b, Duration::from_secs(30), &mut shutdown_rx, &NullStats).await;
        });

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), bridge_task)
            .await
            .expect("bridge should unwind promptly on shutdown")
            .unwrap();
    }
}
