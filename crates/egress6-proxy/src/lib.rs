//! egress6 proxy: an authenticated HTTP/CONNECT proxy whose every outbound
//! connection is bound to a fresh random address inside one IPv6 prefix.

pub mod address_pool;
pub mod auth;
pub mod dialer;
pub mod error;
pub mod http;
pub mod log;
pub mod proxy;
pub mod relay;
pub mod server;

pub use address_pool::{AddressPool, CidrBlock};
pub use auth::{AuthGate, Credential};
pub use dialer::{DialOptions, EgressDialer};
pub use error::{ConfigError, DialError, HttpError};
pub use proxy::{ProxyConfig, ProxyCore};
pub use relay::{RelayOptions, TunnelEnd, TunnelSummary};
pub use server::ProxyServer;
