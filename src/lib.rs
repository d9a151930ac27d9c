//! # SMTP Tunnel
//!
//! A TCP tunnel whose connection setup looks like an ordinary mail client
//! talking to a submission server. After a scripted SMTP exchange
//! (banner, EHLO, STARTTLS, AUTH) both sides switch to a small binary
//! protocol that multiplexes many proxied TCP flows over the one
//! TLS-wrapped connection.
//!
//! ## Features
//!
//! - **SMTP disguise** handshake with STARTTLS and HMAC token auth
//! - **Channel multiplexing** with a single serialized writer per connection
//! - **Layered upstream connects** with IPv6/IPv4 fallbacks on the server
//! - **Automatic reconnect** with backoff and dead-tunnel detection
//! - **SOCKS5** front end on the client
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   Client Role                        │
//! │     (SOCKS5 front end, reconnect supervisor)         │
//! ├─────────────────────────────────────────────────────┤
//! │                  Multiplexing Layer                  │
//! │      (channel table, frame writer, keepalive)        │
//! ├─────────────────────────────────────────────────────┤
//! │                   Framing Layer                      │
//! │   (6-byte header frames, optional payload sealing)   │
//! ├─────────────────────────────────────────────────────┤
//! │                  Disguise Layer                      │
//! │       (SMTP dialogue, STARTTLS, AUTH PLAIN)          │
//! ├─────────────────────────────────────────────────────┤
//! │                  Transport Layer                     │
//! │     (TCP, rustls, upstream connect strategies)       │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod client;
pub mod config;
pub mod crypto;
pub mod handshake;
pub mod obfuscation;
pub mod protocol;
pub mod proxy;
pub mod server;
pub mod transport;
pub mod tunnel;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Handshake error: {0}")]
    Handshake(#[from] handshake::HandshakeError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout")]
    Timeout,

    #[error("Authentication failed")]
    AuthenticationFailed,
}
