//! Listener and accept loop. One task per client connection.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use crate::http::serve_connection;
use crate::proxy::{ProxyConfig, ProxyCore};

pub struct ProxyServer {
    listener: TcpListener,
    core: Arc<ProxyCore>,
}

impl ProxyServer {
    /// Bind the listen address. Nothing is accepted until [`serve`](Self::serve).
    pub async fn bind(config: &ProxyConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(config.listen).await?;
        Ok(Self {
            listener,
            core: Arc::new(ProxyCore::new(config)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` resolves. Connections already
    /// being served keep running on their own tasks.
    pub async fn serve<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("[Proxy] Shutting down listener");
                    return;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let core = Arc::clone(&self.core);
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(core.as_ref(), stream, peer).await {
                                tracing::warn!("[Proxy] Error handling client {}: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("[Proxy] Accept error: {}", e);
                        // Typically fd exhaustion; back off instead of spinning.
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
            }
        }
    }

    /// Accept connections forever.
    pub async fn run(self) {
        self.serve(std::future::pending()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{basic_authorization, Credential};
    use crate::http::{read_head, read_response};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn ipv6_loopback_available() -> bool {
        std::net::TcpListener::bind("[::1]:0").is_ok()
    }

    async fn start_proxy(cidr: &str, credential: Credential) -> SocketAddr {
        let mut config = ProxyConfig::new("127.0.0.1:0".parse().unwrap(), cidr.parse().unwrap());
        config.credential = credential;
        let server = ProxyServer::bind(&config).await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        addr
    }

    fn alice() -> Credential {
        Credential::new("alice", "s3cret")
    }

    async fn send(proxy: SocketAddr, raw: &str) -> TcpStream {
        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(raw.as_bytes()).await.unwrap();
        client
    }

    async fn read_all(stream: &mut TcpStream) -> String {
        let mut out = Vec::new();
        timeout(WAIT, stream.read_to_end(&mut out))
            .await
            .expect("proxy did not close the connection")
            .unwrap();
        String::from_utf8_lossy(&out).to_string()
    }

    #[tokio::test]
    async fn test_missing_credentials_get_407_and_no_dial() {
        if !ipv6_loopback_available() {
            return;
        }
        // Reachable from the pool, so any dial would show up as an accept.
        let target = TcpListener::bind("[::1]:0").await.unwrap();
        let port = target.local_addr().unwrap().port();
        let proxy = start_proxy("::1/128", alice()).await;

        let mut client = send(
            proxy,
            &format!("GET http://[::1]:{port}/ HTTP/1.1\r\nHost: [::1]:{port}\r\n\r\n"),
        )
        .await;
        let out = read_all(&mut client).await;
        assert!(out.starts_with("HTTP/1.1 407 "));
        assert!(out.contains("Proxy-Authenticate: Basic realm=\"egress6\"\r\n"));

        let mut client = send(
            proxy,
            &format!(
                "CONNECT [::1]:{port} HTTP/1.1\r\nProxy-Authorization: {}\r\n\r\n",
                basic_authorization("alice", "wrong")
            ),
        )
        .await;
        assert!(read_all(&mut client).await.starts_with("HTTP/1.1 407 "));

        assert!(timeout(Duration::from_millis(200), target.accept()).await.is_err());

        // Same target with the right credentials does get dialed.
        let _client = send(
            proxy,
            &format!(
                "CONNECT [::1]:{port} HTTP/1.1\r\nProxy-Authorization: {}\r\n\r\n",
                basic_authorization("alice", "s3cret")
            ),
        )
        .await;
        let (_, peer) = timeout(WAIT, target.accept()).await.unwrap().unwrap();
        assert_eq!(peer.ip(), "::1".parse::<std::net::IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_dial_failure_is_502() {
        // Documentation prefix: binding it fails on any sane host.
        let proxy = start_proxy("2001:db8::/64", Credential::default()).await;

        let mut client = send(proxy, "CONNECT [::1]:9 HTTP/1.1\r\n\r\n").await;
        let out = read_all(&mut client).await;
        assert!(out.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "{out}");

        let mut client = send(proxy, "GET http://[::1]:9/ HTTP/1.1\r\nHost: [::1]:9\r\n\r\n").await;
        let out = read_all(&mut client).await;
        assert!(out.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "{out}");
    }

    #[tokio::test]
    async fn test_https_absolute_form_rejected() {
        let proxy = start_proxy("2001:db8::/64", Credential::default()).await;
        let mut client = send(proxy, "GET https://example.com/ HTTP/1.1\r\n\r\n").await;
        assert!(read_all(&mut client).await.starts_with("HTTP/1.1 400 "));
    }

    #[tokio::test]
    async fn test_plain_request_forwarded_from_pool_address() {
        if !ipv6_loopback_available() {
            return;
        }
        let target = TcpListener::bind("[::1]:0").await.unwrap();
        let port = target.local_addr().unwrap().port();
        let (seen_tx, seen_rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut stream, peer) = target.accept().await.unwrap();
            let (head, _) = read_head(&mut stream).await.unwrap();
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-Target: yes\r\n\r\nhello")
                .await
                .unwrap();
            let _ = seen_tx.send((String::from_utf8(head).unwrap(), peer));
        });

        let proxy = start_proxy("::1/128", alice()).await;
        let mut client = send(
            proxy,
            &format!(
                "GET http://[::1]:{port}/path?x=1 HTTP/1.1\r\n\
                 Host: [::1]:{port}\r\n\
                 Proxy-Authorization: {}\r\n\r\n",
                basic_authorization("alice", "s3cret")
            ),
        )
        .await;

        let resp = timeout(WAIT, read_response(&mut client, false)).await.unwrap().unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.header("X-Target"), Some("yes"));
        assert_eq!(resp.body, b"hello");

        let (head, peer) = timeout(WAIT, seen_rx).await.unwrap().unwrap();
        assert!(head.starts_with("GET /path?x=1 HTTP/1.1\r\n"));
        assert!(!head.to_ascii_lowercase().contains("proxy-authorization"));
        assert_eq!(peer.ip(), "::1".parse::<std::net::IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_connect_tunnel_relays_and_tears_down() {
        if !ipv6_loopback_available() {
            return;
        }
        let target = TcpListener::bind("[::1]:0").await.unwrap();
        let port = target.local_addr().unwrap().port();
        let (closed_tx, closed_rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut stream, _) = target.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = closed_tx.send(());
        });

        let proxy = start_proxy("::1/128", Credential::default()).await;
        // "early" rides in the same segment as the CONNECT head.
        let mut client = send(proxy, &format!("CONNECT [::1]:{port} HTTP/1.1\r\n\r\nearly")).await;

        let mut established = vec![0u8; CONNECT_REPLY.len()];
        timeout(WAIT, client.read_exact(&mut established)).await.unwrap().unwrap();
        assert_eq!(established, CONNECT_REPLY);

        let mut echoed = [0u8; 5];
        timeout(WAIT, client.read_exact(&mut echoed)).await.unwrap().unwrap();
        assert_eq!(&echoed, b"early");

        client.write_all(b"\x16\x03\x01ping").await.unwrap();
        let mut echoed = [0u8; 7];
        timeout(WAIT, client.read_exact(&mut echoed)).await.unwrap().unwrap();
        assert_eq!(&echoed, b"\x16\x03\x01ping");

        drop(client);
        timeout(WAIT, closed_rx).await.unwrap().unwrap();
    }

    const CONNECT_REPLY: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let config = ProxyConfig::new(
            "127.0.0.1:0".parse().unwrap(),
            "2001:db8::/64".parse().unwrap(),
        );
        let server = ProxyServer::bind(&config).await.unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.serve(async {
            let _ = stop_rx.await;
        }));
        stop_tx.send(()).unwrap();
        timeout(WAIT, handle).await.unwrap().unwrap();
    }
}
