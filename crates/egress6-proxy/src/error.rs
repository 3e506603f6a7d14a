//! Error taxonomy for the proxy.
//!
//! Auth failures are not errors: [`crate::auth::AuthGate::authorize`] returns a
//! plain `bool` and the caller answers 407. Relay failures end a tunnel and
//! are reported through [`crate::relay::TunnelEnd`].

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Fatal startup errors. The process must not start when one is returned.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid IPv6 CIDR '{0}': expected <ipv6-address>/<prefix-length>")]
    InvalidCidr(String),

    #[error("invalid prefix length {0}: must be within 0..=128")]
    InvalidPrefix(u32),

    #[error("invalid listen address '{0}'")]
    InvalidListenAddr(String),
}

/// Outbound connect failure. Carries the target and the underlying cause.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("failed to resolve {target}: {source}")]
    Resolve {
        target: String,
        source: std::io::Error,
    },

    #[error("{target} has no IPv6 address to reach from the egress prefix")]
    NoIpv6Address { target: String },

    #[error("failed to create socket for {target}: {source}")]
    Socket {
        target: String,
        source: std::io::Error,
    },

    #[error("failed to bind egress address {local} for {target}: {source}")]
    Bind {
        target: String,
        local: SocketAddr,
        source: std::io::Error,
    },

    #[error("failed to connect to {target} from {local}: {source}")]
    Connect {
        target: String,
        local: SocketAddr,
        source: std::io::Error,
    },

    #[error("connect to {target} from {local} timed out after {}s", .timeout.as_secs())]
    Timeout {
        target: String,
        local: SocketAddr,
        timeout: Duration,
    },
}

impl DialError {
    /// The `host:port` the dial was aimed at.
    pub fn target(&self) -> &str {
        match self {
            DialError::Resolve { target, .. }
            | DialError::NoIpv6Address { target }
            | DialError::Socket { target, .. }
            | DialError::Bind { target, .. }
            | DialError::Connect { target, .. }
            | DialError::Timeout { target, .. } => target,
        }
    }
}

/// Malformed or unsupported HTTP traffic on either side of the proxy.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("connection closed before a complete message was received")]
    ConnectionClosed,

    #[error("message head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("message body exceeds {0} bytes")]
    BodyTooLarge(usize),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unsupported request target '{0}'")]
    UnsupportedTarget(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl HttpError {
    /// Status line to answer a client with, if one can still be sent.
    pub fn status(&self) -> Option<(u16, &'static str)> {
        match self {
            HttpError::ConnectionClosed | HttpError::Io(_) => None,
            HttpError::HeadTooLarge(_) => Some((431, "Request Header Fields Too Large")),
            HttpError::BodyTooLarge(_) => Some((413, "Payload Too Large")),
            HttpError::Malformed(_) | HttpError::UnsupportedTarget(_) => Some((400, "Bad Request")),
        }
    }
}
