//! Egress dialer: outbound TCP bound to a fresh pool address per connection.
//!
//! Each `dial` draws a new address, binds `[addr]:0` (the OS picks the port)
//! and makes exactly one connect attempt. Retrying is the caller's business.
//!
//! The host must route the whole prefix locally and allow non-local binds
//! (`net.ipv6.ip_nonlocal_bind=1`), or `freebind` must be enabled.

use std::io;
use std::net::{SocketAddr, SocketAddrV6};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::address_pool::AddressPool;
use crate::error::DialError;

/// Outbound socket options
#[derive(Debug, Clone)]
pub struct DialOptions {
    pub connect_timeout: Duration,
    /// Linux only: set IPV6_FREEBIND so unassigned addresses can be bound.
    pub freebind: bool,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            freebind: false,
        }
    }
}

/// An established outbound connection.
#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    /// Egress address and ephemeral port actually bound.
    pub local: SocketAddr,
    pub peer: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct EgressDialer {
    pool: AddressPool,
    options: DialOptions,
}

impl EgressDialer {
    pub fn new(pool: AddressPool, options: DialOptions) -> Self {
        Self { pool, options }
    }

    /// Connect to `target` (`host:port`) from a newly generated egress address.
    pub async fn dial(&self, target: &str) -> Result<Connection, DialError> {
        let egress = self.pool.generate();
        let local = SocketAddr::V6(SocketAddrV6::new(egress, 0, 0, 0));
        let peer = resolve_ipv6(target).await?;

        let socket = self.create_socket(target, local)?;

        // Non-blocking connect: EINPROGRESS is expected.
        match socket.connect(&peer.into()) {
            Ok(()) => {}
            Err(ref e) if connect_in_progress(e) => {}
            Err(source) => {
                return Err(DialError::Connect {
                    target: target.to_string(),
                    local,
                    source,
                })
            }
        }

        // The TcpStream owns the fd from here on and closes it on drop.
        let std_stream: std::net::TcpStream = socket.into();
        let stream = TcpStream::from_std(std_stream).map_err(|source| DialError::Socket {
            target: target.to_string(),
            source,
        })?;

        let connected = timeout(self.options.connect_timeout, async {
            stream.writable().await?;
            match stream.take_error()? {
                Some(e) => Err(e),
                None => Ok(()),
            }
        })
        .await;

        match connected {
            Ok(Ok(())) => {}
            Ok(Err(source)) => {
                return Err(DialError::Connect {
                    target: target.to_string(),
                    local,
                    source,
                })
            }
            Err(_) => {
                return Err(DialError::Timeout {
                    target: target.to_string(),
                    local,
                    timeout: self.options.connect_timeout,
                })
            }
        }

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY: {}", e);
        }
        let local = stream.local_addr().unwrap_or(local);
        tracing::debug!(
            target = %target,
            egress = %local,
            peer = %peer,
            "Egress connection established"
        );

        Ok(Connection {
            stream,
            local,
            peer,
        })
    }

    fn create_socket(&self, target: &str, local: SocketAddr) -> Result<Socket, DialError> {
        let socket_err = |source: io::Error| DialError::Socket {
            target: target.to_string(),
            source,
        };

        let socket =
            Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP)).map_err(socket_err)?;

        if self.options.freebind {
            set_freebind(&socket).map_err(socket_err)?;
        }

        socket
            .bind(&local.into())
            .map_err(|source| DialError::Bind {
                target: target.to_string(),
                local,
                source,
            })?;
        socket.set_nonblocking(true).map_err(socket_err)?;
        Ok(socket)
    }
}

/// First IPv6 address of `target`. IPv4-only targets cannot be reached from
/// an IPv6 egress address.
async fn resolve_ipv6(target: &str) -> Result<SocketAddr, DialError> {
    let mut addrs = tokio::net::lookup_host(target)
        .await
        .map_err(|source| DialError::Resolve {
            target: target.to_string(),
            source,
        })?;
    addrs
        .find(SocketAddr::is_ipv6)
        .ok_or_else(|| DialError::NoIpv6Address {
            target: target.to_string(),
        })
}

#[cfg(target_os = "linux")]
fn set_freebind(socket: &Socket) -> io::Result<()> {
    socket.set_freebind_ipv6(true)
}

#[cfg(not(target_os = "linux"))]
fn set_freebind(_socket: &Socket) -> io::Result<()> {
    tracing::debug!("IPV6_FREEBIND is only supported on Linux; ignoring");
    Ok(())
}

#[cfg(unix)]
fn connect_in_progress(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EINPROGRESS)
}

#[cfg(not(unix))]
fn connect_in_progress(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_pool::CidrBlock;

    fn dialer(cidr: &str) -> EgressDialer {
        let block: CidrBlock = cidr.parse().unwrap();
        EgressDialer::new(AddressPool::new(block), DialOptions::default())
    }

    fn ipv6_loopback_available() -> bool {
        std::net::TcpListener::bind("[::1]:0").is_ok()
    }

    #[tokio::test]
    async fn test_ipv4_only_target_rejected() {
        let err = dialer("2001:db8::/64").dial("127.0.0.1:80").await.unwrap_err();
        assert!(matches!(err, DialError::NoIpv6Address { .. }));
        assert_eq!(err.target(), "127.0.0.1:80");
    }

    #[tokio::test]
    async fn test_target_without_port_fails_to_resolve() {
        let err = dialer("2001:db8::/64").dial("[::1]").await.unwrap_err();
        assert!(matches!(err, DialError::Resolve { .. }));
    }

    #[tokio::test]
    async fn test_unassigned_egress_address_fails() {
        // 2001:db8::/32 is documentation space and never assigned locally.
        let err = dialer("2001:db8::/64").dial("[::1]:9").await.unwrap_err();
        assert!(matches!(
            err,
            DialError::Socket { .. } | DialError::Bind { .. } | DialError::Connect { .. }
        ));
    }

    #[tokio::test]
    async fn test_dial_binds_egress_address() {
        if !ipv6_loopback_available() {
            return;
        }
        let listener = tokio::net::TcpListener::bind("[::1]:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();

        let conn = dialer("::1/128").dial(&target).await.unwrap();
        let (_accepted, seen_from) = listener.accept().await.unwrap();

        assert_eq!(conn.local.ip(), "::1".parse::<std::net::IpAddr>().unwrap());
        assert_ne!(conn.local.port(), 0);
        assert_eq!(seen_from, conn.local);
        assert_eq!(conn.peer.to_string(), target);
    }

    #[tokio::test]
    async fn test_connection_refused() {
        if !ipv6_loopback_available() {
            return;
        }
        // Grab a free port, then close it so nothing listens there.
        let port = std::net::TcpListener::bind("[::1]:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let err = dialer("::1/128")
            .dial(&format!("[::1]:{}", port))
            .await
            .unwrap_err();
        assert!(matches!(err, DialError::Connect { .. }));
    }
}
