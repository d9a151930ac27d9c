//! SMTP disguise handshake
//!
//! Both roles walk the same strict sequence:
//!
//! ```text
//! Greeting -> Ehlo1 -> StartTls -> (TLS upgrade) -> Ehlo2 -> Auth -> BinarySwitch
//! ```
//!
//! Any unexpected line, timeout or failed check aborts the connection.
//! After `BinarySwitch` the stream carries tunnel frames only.

mod client;
mod server;

pub use client::ClientHandshake;
pub use server::{Authenticator, ServerHandshake};
pub use crate::transport::StartTls;

use crate::protocol::{HANDSHAKE_LINE_TIMEOUT, MAX_LINE_LEN};
use crate::transport::TransportError;
use bytes::BytesMut;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Literal reply lines shared by both roles
pub(crate) mod lines {
    pub const STARTTLS_READY: &str = "220 2.0.0 Ready to start TLS";
    pub const CAP_STARTTLS: &str = "250-STARTTLS";
    pub const CAP_AUTH: &str = "250-AUTH PLAIN LOGIN";
    pub const CAP_LAST: &str = "250 8BITMIME";
    pub const AUTH_OK: &str = "235 2.7.0 Authentication successful";
    pub const AUTH_FAILED: &str = "535 5.7.8 Authentication failed";
    pub const BINARY: &str = "BINARY";
    pub const BINARY_OK: &str = "299 Binary mode activated";
    pub const STARTTLS: &str = "STARTTLS";
}

/// Handshake step, in wire order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandshakeStage {
    Greeting,
    Ehlo1,
    StartTls,
    Ehlo2,
    Auth,
    BinarySwitch,
}

impl fmt::Display for HandshakeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakeStage::Greeting => "greeting",
            HandshakeStage::Ehlo1 => "EHLO",
            HandshakeStage::StartTls => "STARTTLS",
            HandshakeStage::Ehlo2 => "EHLO after TLS",
            HandshakeStage::Auth => "AUTH",
            HandshakeStage::BinarySwitch => "BINARY",
        };
        f.write_str(name)
    }
}

/// Handshake errors; each one ends the connection attempt
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Timed out during {0}")]
    Timeout(HandshakeStage),

    #[error("Connection closed during {0}")]
    ConnectionClosed(HandshakeStage),

    #[error("Line too long during {0}")]
    LineTooLong(HandshakeStage),

    #[error("Unexpected line during {stage}: {line:?}")]
    UnexpectedLine { stage: HandshakeStage, line: String },

    #[error("Data sent ahead of the TLS upgrade")]
    PipelinedData,

    #[error("Authentication failed")]
    AuthFailed,
}

impl HandshakeError {
    fn unexpected(stage: HandshakeStage, line: &str) -> Self {
        let mut end = line.len().min(64);
        while !line.is_char_boundary(end) {
            end -= 1;
        }
        HandshakeError::UnexpectedLine {
            stage,
            line: line[..end].to_string(),
        }
    }

    /// Stage the handshake had reached, when known
    pub fn stage(&self) -> Option<HandshakeStage> {
        match self {
            HandshakeError::Timeout(stage)
            | HandshakeError::ConnectionClosed(stage)
            | HandshakeError::LineTooLong(stage)
            | HandshakeError::UnexpectedLine { stage, .. } => Some(*stage),
            HandshakeError::PipelinedData => Some(HandshakeStage::StartTls),
            HandshakeError::AuthFailed => Some(HandshakeStage::Auth),
            HandshakeError::Io(_) | HandshakeError::Transport(_) => None,
        }
    }
}

/// A stream that finished the handshake
pub struct Established<S> {
    pub stream: S,
    /// Bytes read past the BINARY exchange; the first tunnel frames
    pub leftover: BytesMut,
    /// Authenticated identity; empty for legacy tokens
    pub username: String,
}

/// Line-oriented half of the handshake
pub(crate) struct LineIo<S> {
    inner: BufReader<S>,
    line_timeout: Duration,
}

impl<S> LineIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(stream: S) -> Self {
        Self::with_timeout(stream, HANDSHAKE_LINE_TIMEOUT)
    }

    pub(crate) fn with_timeout(stream: S, line_timeout: Duration) -> Self {
        Self {
            inner: BufReader::with_capacity(MAX_LINE_LEN * 4, stream),
            line_timeout,
        }
    }

    /// Read one CRLF-terminated line, without the terminator
    pub(crate) async fn read_line(&mut self, stage: HandshakeStage) -> Result<String, HandshakeError> {
        let mut raw = Vec::with_capacity(128);
        let limit = MAX_LINE_LEN as u64;

        let read = tokio::time::timeout(
            self.line_timeout,
            (&mut self.inner).take(limit).read_until(b'\n', &mut raw),
        )
        .await
        .map_err(|_| HandshakeError::Timeout(stage))??;

        if read == 0 {
            return Err(HandshakeError::ConnectionClosed(stage));
        }
        if raw.last() != Some(&b'\n') {
            return Err(if raw.len() as u64 >= limit {
                HandshakeError::LineTooLong(stage)
            } else {
                HandshakeError::ConnectionClosed(stage)
            });
        }

        raw.pop();
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    pub(crate) async fn write_line(&mut self, line: &str) -> Result<(), HandshakeError> {
        let stream = self.inner.get_mut();
        let mut out = Vec::with_capacity(line.len() + 2);
        out.extend_from_slice(line.as_bytes());
        out.extend_from_slice(b"\r\n");
        stream.write_all(&out).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Write several lines in one flush
    pub(crate) async fn write_lines(&mut self, lines: &[&str]) -> Result<(), HandshakeError> {
        let stream = self.inner.get_mut();
        let mut out = Vec::new();
        for line in lines {
            out.extend_from_slice(line.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        stream.write_all(&out).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Give the raw stream back for the TLS upgrade
    ///
    /// Nothing may be buffered at this point: plaintext sent after
    /// STARTTLS would otherwise leak into the encrypted session.
    pub(crate) fn into_plain(self) -> Result<S, HandshakeError> {
        if !self.inner.buffer().is_empty() {
            return Err(HandshakeError::PipelinedData);
        }
        Ok(self.inner.into_inner())
    }

    /// Give the stream back together with anything already buffered
    pub(crate) fn into_parts(self) -> (S, BytesMut) {
        let leftover = BytesMut::from(self.inner.buffer());
        (self.inner.into_inner(), leftover)
    }
}

/// Case-insensitive command match on the first word
pub(crate) fn is_command(line: &str, command: &str) -> bool {
    line.split_whitespace()
        .next()
        .is_some_and(|word| word.eq_ignore_ascii_case(command))
}
