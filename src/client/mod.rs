//! Client role
//!
//! [`TunnelClient`] dials the server, runs the disguise handshake and
//! starts a [`ClientMultiplexer`] over the result. The
//! [`ReconnectSupervisor`] keeps calling it whenever the tunnel is lost.

mod reconnect;

pub use reconnect::{
    ReconnectPolicy, ReconnectState, ReconnectStats, ReconnectSupervisor, TunnelConnector,
    TunnelHandle,
};

use crate::crypto::{Secret, SessionKeys};
use crate::handshake::ClientHandshake;
use crate::protocol::HANDSHAKE_TIMEOUT;
use crate::transport::StartTls;
use crate::tunnel::{ClientMultiplexer, MuxConfig};
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Dials one tunnel connection per call
pub struct TunnelClient<U> {
    server_host: String,
    server_port: u16,
    handshake: ClientHandshake<U>,
    mux: MuxConfig,
    keys: Option<SessionKeys>,
    handshake_timeout: Duration,
}

impl<U> TunnelClient<U>
where
    U: StartTls<TcpStream>,
{
    pub fn new(
        server_host: impl Into<String>,
        server_port: u16,
        handshake: ClientHandshake<U>,
        mux: MuxConfig,
    ) -> Self {
        Self {
            server_host: server_host.into(),
            server_port,
            handshake,
            mux,
            keys: None,
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }

    /// Seal DATA payloads with keys derived from `secret`
    pub fn with_payload_encryption(mut self, secret: &Secret) -> crate::Result<Self> {
        self.keys = Some(SessionKeys::derive(secret)?);
        Ok(self)
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Connect, handshake and start multiplexing
    pub async fn dial(&self) -> crate::Result<ClientMultiplexer> {
        let addr = (self.server_host.as_str(), self.server_port);
        debug!("Connecting to {}:{}", self.server_host, self.server_port);

        let established = tokio::time::timeout(self.handshake_timeout, async {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok::<_, crate::Error>(self.handshake.run(stream).await?)
        })
        .await
        .map_err(|_| crate::Error::Timeout)??;

        let ciphers = match &self.keys {
            Some(keys) => Some(keys.client_ciphers()?),
            None => None,
        };

        info!(
            "Tunnel established to {}:{}{}",
            self.server_host,
            self.server_port,
            if ciphers.is_some() { " (payload encryption on)" } else { "" }
        );

        Ok(ClientMultiplexer::start(
            established.stream,
            established.leftover,
            self.mux.clone(),
            ciphers,
        ))
    }
}

#[async_trait]
impl<U> TunnelConnector for TunnelClient<U>
where
    U: StartTls<TcpStream>,
{
    async fn connect(&self) -> crate::Result<ClientMultiplexer> {
        self.dial().await
    }
}
