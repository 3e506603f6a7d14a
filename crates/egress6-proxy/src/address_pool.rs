//! Address pool: random host addresses inside a fixed IPv6 prefix.
//!
//! The network bits come from the configured block, every remaining bit is
//! drawn independently and uniformly. Generation is stateless: two calls
//! never depend on each other and collisions are possible (and accepted).

use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;

use cidr::{Ipv6Cidr, Ipv6Inet};
use rand::Rng;

use crate::error::ConfigError;

/// An IPv6 block given as `base/prefix_len`.
///
/// Bits of `base` past the prefix are kept as written but ignored when
/// generating, so `2001:db8::1/64` and `2001:db8::/64` behave identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidrBlock {
    inet: Ipv6Inet,
}

impl CidrBlock {
    pub fn new(base: Ipv6Addr, prefix_len: u8) -> Result<Self, ConfigError> {
        let inet = Ipv6Inet::new(base, prefix_len)
            .map_err(|_| ConfigError::InvalidPrefix(u32::from(prefix_len)))?;
        Ok(Self { inet })
    }

    /// The address exactly as configured, host bits included.
    pub fn base(&self) -> Ipv6Addr {
        self.inet.address()
    }

    pub fn prefix_len(&self) -> u8 {
        self.inet.network_length()
    }

    /// The network with host bits cleared.
    pub fn network(&self) -> Ipv6Cidr {
        self.inet.network()
    }

    /// Mask selecting the network bits (top `prefix_len` bits set).
    pub fn network_mask(&self) -> u128 {
        match self.prefix_len() {
            0 => 0,
            len => u128::MAX << (128 - u32::from(len)),
        }
    }

    pub fn contains(&self, addr: &Ipv6Addr) -> bool {
        self.network().contains(addr)
    }
}

impl FromStr for CidrBlock {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (addr, len) = s
            .split_once('/')
            .ok_or_else(|| ConfigError::InvalidCidr(s.to_string()))?;
        let base: Ipv6Addr = addr
            .parse()
            .map_err(|_| ConfigError::InvalidCidr(s.to_string()))?;
        let len: u32 = len
            .parse()
            .map_err(|_| ConfigError::InvalidCidr(s.to_string()))?;
        let len = u8::try_from(len).map_err(|_| ConfigError::InvalidPrefix(len))?;
        Self::new(base, len)
    }
}

impl fmt::Display for CidrBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network().first_address(), self.prefix_len())
    }
}

/// Produces egress addresses for one block.
///
/// Holds no random state of its own: each call uses the calling thread's
/// generator, so a shared pool needs no locking.
#[derive(Debug, Clone, Copy)]
pub struct AddressPool {
    block: CidrBlock,
}

impl AddressPool {
    pub fn new(block: CidrBlock) -> Self {
        Self { block }
    }

    /// A fresh random address inside the block.
    pub fn generate(&self) -> Ipv6Addr {
        self.generate_with(&mut rand::thread_rng())
    }

    /// Same as [`generate`](Self::generate) with a caller-supplied source.
    pub fn generate_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Ipv6Addr {
        let mask = self.block.network_mask();
        let network = u128::from(self.block.base()) & mask;
        let host = rng.gen::<u128>() & !mask;
        Ipv6Addr::from(network | host)
    }
}
