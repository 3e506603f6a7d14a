//! Environment variable keys.
//!
//! The CLI reads the proxy keys through clap's `env` fallback; observability
//! keys are read by [`super::ObservabilityConfig`].

/// Proxy listener, pool and credential
pub mod proxy {
    pub const EGRESS6_PORT: &str = "EGRESS6_PORT";
    pub const EGRESS6_BIND: &str = "EGRESS6_BIND";
    pub const EGRESS6_CIDR: &str = "EGRESS6_CIDR";
    pub const EGRESS6_USER: &str = "EGRESS6_USER";
    pub const EGRESS6_PASSWORD: &str = "EGRESS6_PASSWORD";
    /// Tunnel idle timeout in seconds. Unset means tunnels never time out.
    pub const EGRESS6_IDLE_TIMEOUT_SECS: &str = "EGRESS6_IDLE_TIMEOUT_SECS";
    pub const EGRESS6_CONNECT_TIMEOUT_SECS: &str = "EGRESS6_CONNECT_TIMEOUT_SECS";
    /// Linux only: IPV6_FREEBIND on outbound sockets.
    pub const EGRESS6_FREEBIND: &str = "EGRESS6_FREEBIND";
}

/// Logging
pub mod observability {
    pub const EGRESS6_QUIET: &str = "EGRESS6_QUIET";
    pub const EGRESS6_LOG_LEVEL: &str = "EGRESS6_LOG_LEVEL";
    pub const EGRESS6_LOG_JSON: &str = "EGRESS6_LOG_JSON";
}
