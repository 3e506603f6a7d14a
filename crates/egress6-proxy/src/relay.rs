//! Tunnel relay: bidirectional byte copy between client and target.
//!
//! Each direction runs in its own task. The first direction to finish (EOF,
//! error or idle timeout) tears the whole tunnel down: the other task is
//! aborted, all four stream halves are dropped and both sockets close. There
//! is no half-close preservation.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Tunnel tuning
#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub buf_size: usize,
    /// Close the tunnel when no byte moved in either direction for this long.
    /// `None` keeps tunnels open until a side closes.
    pub idle_timeout: Option<Duration>,
    /// Disable Nagle on both sockets (TLS handshakes are latency bound).
    pub nodelay: bool,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            buf_size: 32 * 1024,
            idle_timeout: None,
            nodelay: true,
        }
    }
}

/// Why a tunnel ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelEnd {
    ClientClosed,
    TargetClosed,
    IdleTimeout,
    /// Read/write failure on either side.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelSummary {
    pub client_to_target: u64,
    pub target_to_client: u64,
    pub end: TunnelEnd,
}

type CopyTask = JoinHandle<io::Result<u64>>;

/// Relay until either side closes, then close both. Takes ownership of both
/// streams; nothing is left open when this returns.
pub async fn relay(client: TcpStream, target: TcpStream, options: &RelayOptions) -> TunnelSummary {
    if options.nodelay {
        let _ = client.set_nodelay(true);
        let _ = target.set_nodelay(true);
    }

    let up = Arc::new(AtomicU64::new(0));
    let down = Arc::new(AtomicU64::new(0));
    let activity = Arc::new(Activity::new());

    let (client_read, client_write) = client.into_split();
    let (target_read, target_write) = target.into_split();

    let mut upstream: CopyTask = tokio::spawn(copy_half(
        client_read,
        target_write,
        options.buf_size,
        Arc::clone(&up),
        Arc::clone(&activity),
    ));
    let mut downstream: CopyTask = tokio::spawn(copy_half(
        target_read,
        client_write,
        options.buf_size,
        Arc::clone(&down),
        Arc::clone(&activity),
    ));

    let end = tokio::select! {
        res = &mut upstream => {
            stop(&mut downstream).await;
            end_reason(res, TunnelEnd::ClientClosed)
        }
        res = &mut downstream => {
            stop(&mut upstream).await;
            end_reason(res, TunnelEnd::TargetClosed)
        }
        _ = idle_watch(options.idle_timeout, &activity) => {
            stop(&mut upstream).await;
            stop(&mut downstream).await;
            TunnelEnd::IdleTimeout
        }
    };

    TunnelSummary {
        client_to_target: up.load(Ordering::Relaxed),
        target_to_client: down.load(Ordering::Relaxed),
        end,
    }
}

/// Copy until EOF or error, then shut down the write side. Dropping the
/// halves on return releases this direction's share of both sockets.
async fn copy_half(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    buf_size: usize,
    counter: Arc<AtomicU64>,
    activity: Arc<Activity>,
) -> io::Result<u64> {
    let mut buf = vec![0u8; buf_size];
    let result = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break Ok(counter.load(Ordering::Relaxed)),
            Ok(n) => {
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    break Err(e);
                }
                counter.fetch_add(n as u64, Ordering::Relaxed);
                activity.touch();
            }
            Err(e) => break Err(e),
        }
    };
    let _ = writer.shutdown().await;
    result
}

/// Abort a copy task and wait until its halves are dropped.
async fn stop(task: &mut CopyTask) {
    task.abort();
    let _ = task.await;
}

/// Time of the last byte moved in either direction, as milliseconds since
/// the tunnel started.
struct Activity {
    started: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let ms = self.started.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(ms, Ordering::Relaxed);
    }

    fn last(&self) -> Instant {
        self.started + Duration::from_millis(self.last_ms.load(Ordering::Relaxed))
    }
}

/// Resolves once no byte moved for `idle_timeout`; never resolves without one.
async fn idle_watch(idle_timeout: Option<Duration>, activity: &Activity) {
    let Some(window) = idle_timeout else {
        return std::future::pending().await;
    };
    loop {
        let deadline = activity.last() + window;
        if Instant::now() >= deadline {
            return;
        }
        tokio::time::sleep_until(deadline).await;
    }
}

fn end_reason(
    res: Result<io::Result<u64>, tokio::task::JoinError>,
    on_eof: TunnelEnd,
) -> TunnelEnd {
    match res {
        Ok(Ok(_)) => on_eof,
        Ok(Err(e)) => {
            tracing::debug!("Tunnel relay error: {}", e);
            TunnelEnd::Error
        }
        Err(e) => {
            tracing::debug!("Tunnel relay task failed: {}", e);
            TunnelEnd::Error
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    /// A connected (outer, inner) pair over IPv4 loopback.
    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (outer, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (outer.unwrap(), accepted.unwrap().0)
    }

    async fn read_exactly(stream: &mut TcpStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
            .await
            .expect("read timed out")
            .unwrap();
        buf
    }

    async fn expect_eof(stream: &mut TcpStream) {
        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("peer was not closed")
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_relays_both_directions_and_closes_both() {
        let (mut client, client_end) = pair().await;
        let (mut target, target_end) = pair().await;

        let tunnel = tokio::spawn(async move {
            relay(client_end, target_end, &RelayOptions::default()).await
        });

        client.write_all(b"hello target").await.unwrap();
        assert_eq!(read_exactly(&mut target, 12).await, b"hello target");

        target.write_all(b"hello client!").await.unwrap();
        assert_eq!(read_exactly(&mut client, 13).await, b"hello client!");

        // Target closes: the client side must be closed too.
        drop(target);
        expect_eof(&mut client).await;

        let summary = timeout(Duration::from_secs(5), tunnel).await.unwrap().unwrap();
        assert_eq!(summary.end, TunnelEnd::TargetClosed);
        assert_eq!(summary.client_to_target, 12);
        assert_eq!(summary.target_to_client, 13);
    }

    #[tokio::test]
    async fn test_client_close_tears_down_target() {
        let (client, client_end) = pair().await;
        let (mut target, target_end) = pair().await;

        let tunnel = tokio::spawn(async move {
            relay(client_end, target_end, &RelayOptions::default()).await
        });

        drop(client);
        expect_eof(&mut target).await;

        let summary = timeout(Duration::from_secs(5), tunnel).await.unwrap().unwrap();
        assert_eq!(summary.end, TunnelEnd::ClientClosed);
        assert_eq!(summary.client_to_target, 0);
    }

    #[tokio::test]
    async fn test_large_transfer() {
        let (mut client, client_end) = pair().await;
        let (mut target, target_end) = pair().await;
        let opts = RelayOptions {
            buf_size: 1024,
            ..RelayOptions::default()
        };
        let tunnel = tokio::spawn(async move { relay(client_end, target_end, &opts).await });

        let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client
        });
        assert_eq!(read_exactly(&mut target, expected.len()).await, expected);
        let _client = writer.await.unwrap();

        drop(target);
        let summary = timeout(Duration::from_secs(5), tunnel).await.unwrap().unwrap();
        assert_eq!(summary.client_to_target, expected.len() as u64);
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_tunnel() {
        let (mut client, client_end) = pair().await;
        let (mut target, target_end) = pair().await;
        let opts = RelayOptions {
            idle_timeout: Some(Duration::from_millis(100)),
            ..RelayOptions::default()
        };
        let tunnel = tokio::spawn(async move { relay(client_end, target_end, &opts).await });

        let summary = timeout(Duration::from_secs(5), tunnel).await.unwrap().unwrap();
        assert_eq!(summary.end, TunnelEnd::IdleTimeout);
        expect_eof(&mut client).await;
        expect_eof(&mut target).await;
    }

    #[tokio::test]
    async fn test_idle_timeout_fires_after_one_window() {
        let (_client, client_end) = pair().await;
        let (_target, target_end) = pair().await;
        let opts = RelayOptions {
            idle_timeout: Some(Duration::from_millis(300)),
            ..RelayOptions::default()
        };
        let started = std::time::Instant::now();
        let summary = timeout(Duration::from_secs(5), relay(client_end, target_end, &opts))
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(summary.end, TunnelEnd::IdleTimeout);
        assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(550), "{elapsed:?}");
    }

    #[tokio::test]
    async fn test_traffic_pushes_idle_deadline() {
        let (mut client, client_end) = pair().await;
        let (mut target, target_end) = pair().await;
        let opts = RelayOptions {
            idle_timeout: Some(Duration::from_millis(300)),
            ..RelayOptions::default()
        };
        let started = std::time::Instant::now();
        let tunnel = tokio::spawn(async move { relay(client_end, target_end, &opts).await });

        tokio::time::sleep(Duration::from_millis(200)).await;
        client.write_all(b"x").await.unwrap();
        assert_eq!(read_exactly(&mut target, 1).await, b"x");

        let summary = timeout(Duration::from_secs(5), tunnel).await.unwrap().unwrap();
        assert_eq!(summary.end, TunnelEnd::IdleTimeout);
        assert!(started.elapsed() >= Duration::from_millis(500));
    }
}
