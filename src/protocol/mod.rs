//! Protocol definitions and constants
//!
//! Everything here is immutable. Stateful objects (channel tables, ciphers,
//! reconnect state) are built explicitly and passed by reference.

use std::time::Duration;
use thiserror::Error;

/// Protocol errors that are fatal to a tunnel connection
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u8, actual: u8 },

    #[error("Invalid message type: {0}")]
    InvalidMessageType(u8),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Receive buffer limit exceeded: {0} bytes")]
    BufferOverflow(usize),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
}

/// Tunnel protocol version carried in every frame header
pub const PROTOCOL_VERSION: u8 = 1;

/// Frame header: version, type, channel id, payload length
pub const FRAME_HEADER_SIZE: usize = 6;

/// Largest payload a single frame can carry (u16 length prefix)
pub const MAX_PAYLOAD_SIZE: usize = 65535;

/// Cap on buffered, not yet decoded, inbound bytes (10 MiB)
pub const MAX_BUFFER_SIZE: usize = 10 * 1024 * 1024;

/// Channel id reserved for connection-level messages
pub const CONTROL_CHANNEL: u16 = 0;

/// Bytes read from a local socket per DATA frame
pub const CHANNEL_READ_CHUNK: usize = 32 * 1024;

/// Longest host accepted in a CONNECT payload
pub const MAX_HOST_LEN: usize = 253;

/// Longest CONNECT_FAIL reason put on the wire
pub const MAX_REASON_LEN: usize = 128;

/// Client waits this long for CONNECT_OK/CONNECT_FAIL
pub const CHANNEL_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-strategy upstream connect timeout
pub const UPSTREAM_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle time on a tunnel connection before keepalive policy kicks in
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Time allowed for a KEEPALIVE to be answered
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound for reading one handshake line
pub const HANDSHAKE_LINE_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound for TCP connect plus disguise handshake on the client
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest handshake line either side will buffer
pub const MAX_LINE_LEN: usize = 1024;

/// Default freshness window for auth tokens, in seconds
pub const AUTH_MAX_AGE: u64 = 300;

/// Prefix of the string authenticated by the token MAC
pub const AUTH_CONTEXT: &str = "smtp-tunnel-auth";

/// HKDF salt for payload encryption keys
pub const KDF_SALT: &[u8] = b"smtp-tunnel-v1";

/// HKDF info for payload encryption keys
pub const KDF_INFO: &[u8] = b"tunnel-keys";

/// EHLO domain the client announces
pub const DEFAULT_EHLO_DOMAIN: &str = "tunnel-client.local";

/// Default SMTP submission port
pub const DEFAULT_PORT: u16 = 587;
