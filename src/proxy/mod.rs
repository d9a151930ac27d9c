//! Proxy implementations
//!
//! Provides:
//! - SOCKS5 front end feeding channels into the tunnel

#[cfg(feature = "socks5")]
mod socks5;

#[cfg(feature = "socks5")]
pub use socks5::Socks5Server;

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid SOCKS version: {0}")]
    InvalidSocksVersion(u8),

    #[error("Unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("Address type not supported: {0}")]
    UnsupportedAddressType(u8),

    #[error("No acceptable authentication method")]
    AuthenticationFailed,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Negotiation timed out")]
    Timeout,

    #[error("Tunnel is not connected")]
    TunnelDown,

    #[error("Channel failed: {0}")]
    Channel(#[from] crate::tunnel::TunnelError),
}

/// Proxy target address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 address and port
    Ipv4(Ipv4Addr, u16),
    /// IPv6 address and port
    Ipv6(Ipv6Addr, u16),
    /// Domain name and port
    Domain(String, u16),
}

impl Address {
    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Ipv4(_, port) | Address::Ipv6(_, port) | Address::Domain(_, port) => *port,
        }
    }

    /// Host as sent in a CONNECT request; IPv6 without brackets
    pub fn host(&self) -> String {
        match self {
            Address::Ipv4(ip, _) => ip.to_string(),
            Address::Ipv6(ip, _) => ip.to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(ip, port) => write!(f, "{}:{}", ip, port),
            Address::Ipv6(ip, port) => write!(f, "[{}]:{}", ip, port),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}
