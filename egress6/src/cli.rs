use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use clap::Parser;
use egress6_core::config::env_bool;
use egress6_core::config::env_keys::proxy as keys;
use egress6_proxy::{ConfigError, Credential, DialOptions, ProxyConfig, RelayOptions};

/// egress6 - HTTP/CONNECT proxy that sends every outbound connection from a
/// fresh random address inside an IPv6 prefix
#[derive(Parser, Debug)]
#[command(name = "egress6")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Port to listen on
    #[arg(short, long, env = keys::EGRESS6_PORT, default_value_t = 8080)]
    pub port: u16,

    /// Address to listen on
    #[arg(short, long, env = keys::EGRESS6_BIND, default_value = "0.0.0.0")]
    pub bind: String,

    /// IPv6 prefix to draw egress addresses from, e.g. 2001:db8:1234::/48
    #[arg(short, long, env = keys::EGRESS6_CIDR, value_name = "CIDR")]
    pub cidr: String,

    /// Basic-auth username (auth is off when username and password are both empty)
    #[arg(short, long, env = keys::EGRESS6_USER, default_value = "")]
    pub user: String,

    /// Basic-auth password
    #[arg(long, env = keys::EGRESS6_PASSWORD, default_value = "", hide_env_values = true)]
    pub password: String,

    /// Close tunnels idle for this many seconds (0 = never)
    #[arg(long, env = keys::EGRESS6_IDLE_TIMEOUT_SECS, default_value_t = 0)]
    pub idle_timeout: u64,

    /// Outbound connect timeout in seconds
    #[arg(long, env = keys::EGRESS6_CONNECT_TIMEOUT_SECS, default_value_t = 30)]
    pub connect_timeout: u64,

    /// Set IPV6_FREEBIND on outbound sockets (Linux; also EGRESS6_FREEBIND=1)
    #[arg(long)]
    pub freebind: bool,
}

impl Cli {
    /// Validate arguments into a runnable config. Any error here is fatal.
    pub fn proxy_config(&self) -> Result<ProxyConfig, ConfigError> {
        let ip: IpAddr = self
            .bind
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidListenAddr(self.bind.clone()))?;
        let mut config = ProxyConfig::new(SocketAddr::new(ip, self.port), self.cidr.parse()?);

        config.credential = Credential::new(self.user.as_str(), self.password.as_str());
        config.dial = DialOptions {
            connect_timeout: Duration::from_secs(self.connect_timeout),
            freebind: self.freebind || env_bool(keys::EGRESS6_FREEBIND, &[], false),
        };
        config.relay = RelayOptions {
            idle_timeout: (self.idle_timeout > 0).then(|| Duration::from_secs(self.idle_timeout)),
            ..RelayOptions::default()
        };
        Ok(config)
    }
}
