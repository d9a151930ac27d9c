//! Tunnel layer - the binary multiplexing protocol
//!
//! Provides:
//! - Frame encoding/decoding
//! - Channel id ownership
//! - Per-channel socket pumps
//! - A single serialized writer per connection
//! - The multiplexer read loop for both roles

mod channel;
mod frame;
mod multiplexer;
mod table;
mod writer;

pub use channel::{Channel, ChannelState, ClientChannel, ConnectOutcome, ServerChannel, INBOUND_QUEUE_DEPTH};
pub use frame::{ConnectRequest, FrameCodec, MessageType, TunnelMessage};
pub use multiplexer::{ClientMultiplexer, IdlePolicy, MuxConfig, ServerMultiplexer};
pub use table::ChannelTable;
pub use writer::{FrameSender, FrameWriter, FRAME_QUEUE_DEPTH};

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] crate::protocol::ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),

    #[error("Padding error: {0}")]
    Padding(#[from] crate::obfuscation::PaddingError),

    #[error("Too many channels (limit {0})")]
    TooManyChannels(u16),

    #[error("Channel {0} already in use")]
    ChannelInUse(u16),

    #[error("Channel {0} closed")]
    ChannelClosed(u16),

    #[error("Channel {0} is not draining its socket")]
    ChannelStalled(u16),

    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("Connect timed out")]
    ConnectTimeout,

    #[error("Tunnel connection closed")]
    ConnectionClosed,

    #[error("Keepalive not answered")]
    KeepaliveTimeout,
}

/// Reported by channel pumps to the multiplexer
#[derive(Debug)]
pub enum ChannelEvent {
    /// Local socket reached EOF
    LocalEof(u16),
    /// Reading the local socket failed
    LocalError(u16, String),
    /// Writing to the local socket failed
    WriteFailed(u16, String),
}

impl ChannelEvent {
    pub fn channel_id(&self) -> u16 {
        match self {
            ChannelEvent::LocalEof(id)
            | ChannelEvent::LocalError(id, _)
            | ChannelEvent::WriteFailed(id, _) => *id,
        }
    }
}

/// Last time any bytes crossed the tunnel connection
pub struct Activity {
    origin: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        let elapsed = self.origin.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    pub fn last(&self) -> Instant {
        self.origin + Duration::from_millis(self.last_ms.load(Ordering::Relaxed))
    }

    pub fn idle_for(&self) -> Duration {
        self.last().elapsed()
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}
