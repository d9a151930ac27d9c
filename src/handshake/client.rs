//! Initiator side of the disguise handshake

use super::{lines, Established, HandshakeError, HandshakeStage, LineIo};
use crate::crypto::{AuthToken, Secret};
use crate::protocol::{DEFAULT_EHLO_DOMAIN, HANDSHAKE_LINE_TIMEOUT};
use crate::transport::StartTls;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Drives the handshake from the client side
pub struct ClientHandshake<U> {
    upgrade: U,
    secret: Secret,
    username: Option<String>,
    ehlo_domain: String,
    line_timeout: Duration,
}

impl<U> ClientHandshake<U> {
    pub fn new(upgrade: U, secret: Secret, username: Option<String>) -> Self {
        Self {
            upgrade,
            secret,
            username,
            ehlo_domain: DEFAULT_EHLO_DOMAIN.to_string(),
            line_timeout: HANDSHAKE_LINE_TIMEOUT,
        }
    }

    pub fn with_ehlo_domain(mut self, domain: impl Into<String>) -> Self {
        self.ehlo_domain = domain.into();
        self
    }

    pub fn with_line_timeout(mut self, timeout: Duration) -> Self {
        self.line_timeout = timeout;
        self
    }

    /// Run the handshake over a freshly connected stream
    pub async fn run<S>(&self, stream: S) -> Result<Established<U::Output>, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        U: StartTls<S>,
    {
        let mut io = LineIo::with_timeout(stream, self.line_timeout);

        let greeting = io.read_line(HandshakeStage::Greeting).await?;
        if !greeting.starts_with("220") {
            return Err(HandshakeError::unexpected(HandshakeStage::Greeting, &greeting));
        }
        debug!("Server greeting: {}", greeting);

        io.write_line(&format!("EHLO {}", self.ehlo_domain)).await?;
        let capabilities = read_capabilities(&mut io, HandshakeStage::Ehlo1).await?;
        if !capabilities.iter().any(|c| c.eq_ignore_ascii_case(lines::STARTTLS)) {
            return Err(HandshakeError::unexpected(
                HandshakeStage::Ehlo1,
                "STARTTLS not advertised",
            ));
        }

        io.write_line(lines::STARTTLS).await?;
        let ready = io.read_line(HandshakeStage::StartTls).await?;
        if !ready.starts_with("220") {
            return Err(HandshakeError::unexpected(HandshakeStage::StartTls, &ready));
        }

        let tls = self.upgrade.upgrade(io.into_plain()?).await?;
        debug!("TLS established");
        let mut io = LineIo::with_timeout(tls, self.line_timeout);

        io.write_line(&format!("EHLO {}", self.ehlo_domain)).await?;
        read_capabilities(&mut io, HandshakeStage::Ehlo2).await?;

        let token = AuthToken::generate_now(&self.secret, self.username.as_deref());
        io.write_line(&format!("AUTH PLAIN {}", token)).await?;
        let reply = io.read_line(HandshakeStage::Auth).await?;
        if reply.starts_with("535") {
            return Err(HandshakeError::AuthFailed);
        }
        if !reply.starts_with("235") {
            return Err(HandshakeError::unexpected(HandshakeStage::Auth, &reply));
        }

        io.write_line(lines::BINARY).await?;
        let reply = io.read_line(HandshakeStage::BinarySwitch).await?;
        if !reply.starts_with("299") {
            return Err(HandshakeError::unexpected(HandshakeStage::BinarySwitch, &reply));
        }

        let (stream, leftover) = io.into_parts();
        Ok(Established {
            stream,
            leftover,
            username: self.username.clone().unwrap_or_default(),
        })
    }
}

/// Read a 250 reply, returning the capability keyword of each line
async fn read_capabilities<S>(io: &mut LineIo<S>, stage: HandshakeStage) -> Result<Vec<String>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut capabilities = Vec::new();

    loop {
        let line = io.read_line(stage).await?;

        if let Some(rest) = line.strip_prefix("250-") {
            capabilities.push(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("250 ") {
            capabilities.push(rest.trim().to_string());
            return Ok(capabilities);
        } else if line == "250" {
            return Ok(capabilities);
        } else {
            return Err(HandshakeError::unexpected(stage, &line));
        }
    }
}
