//! Transport layer
//!
//! Provides:
//! - Upstream connection strategies for the server role
//! - An alternate DNS resolver used as the last strategy
//! - The STARTTLS upgrade seam and rustls configuration

#[cfg(feature = "alt-resolver")]
mod dns;
mod tls;
mod upstream;

#[cfg(feature = "alt-resolver")]
pub use dns::{AlternateResolver, DEFAULT_RESOLVER};
pub use tls::{
    client_tls_config, load_certs, load_private_key, server_tls_config, StartTls,
    TlsClientUpgrade, TlsServerUpgrade,
};
pub use upstream::{
    default_ipv4_fallback, normalize_host, ConnectError, ConnectStats, Strategy, StrategyKind,
    UpstreamConfig, UpstreamConnector,
};

use std::io;
use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("DNS error: {0}")]
    Dns(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Connection closed")]
    Closed,

    #[error("Timeout")]
    Timeout,
}
