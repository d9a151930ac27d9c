//! Server role
//!
//! Accepts TCP connections, runs the responder side of the disguise
//! handshake and then serves one [`ServerMultiplexer`] per connection.

use crate::config::UserTable;
use crate::crypto::SessionKeys;
use crate::handshake::{Authenticator, ServerHandshake};
use crate::protocol::HANDSHAKE_TIMEOUT;
use crate::transport::{StartTls, UpstreamConnector};
use crate::tunnel::{MuxConfig, ServerMultiplexer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Tunnel server shared by every accepted connection
pub struct TunnelServer<U> {
    handshake: ServerHandshake<U, Arc<UserTable>>,
    users: Arc<UserTable>,
    connector: Arc<UpstreamConnector>,
    mux: MuxConfig,
    limit: Arc<Semaphore>,
    payload_encryption: bool,
    log_users: bool,
    handshake_timeout: Duration,
}

impl<U> TunnelServer<U>
where
    U: StartTls<TcpStream> + 'static,
{
    pub fn new(
        handshake: ServerHandshake<U, Arc<UserTable>>,
        users: Arc<UserTable>,
        connector: Arc<UpstreamConnector>,
        mux: MuxConfig,
    ) -> Self {
        Self {
            handshake,
            users,
            connector,
            mux,
            limit: Arc::new(Semaphore::new(1000)),
            payload_encryption: false,
            log_users: true,
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }

    /// Bound on concurrent tunnel connections
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.limit = Arc::new(Semaphore::new(max));
        self
    }

    pub fn with_payload_encryption(mut self, enabled: bool) -> Self {
        self.payload_encryption = enabled;
        self
    }

    /// Whether usernames appear in log lines
    pub fn with_log_users(mut self, enabled: bool) -> Self {
        self.log_users = enabled;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn connector(&self) -> &Arc<UpstreamConnector> {
        &self.connector
    }

    /// Accept connections until the listener fails
    ///
    /// A connection slot is taken before each accept, so at the limit new
    /// clients wait in the listen backlog.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        info!("Listening on {}", listener.local_addr()?);

        loop {
            let permit = Arc::clone(&self.limit)
                .acquire_owned()
                .await
                .map_err(|_| std::io::Error::other("connection limit closed"))?;

            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("New connection from {}", peer);
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(e) = server.handle_connection(stream, peer).await {
                            debug!("Connection from {} ended: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Serve a single accepted connection to completion
    ///
    /// Does not count against the connection limit; [`serve`](Self::serve)
    /// holds the slot.
    pub async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> crate::Result<()> {
        stream.set_nodelay(true)?;

        let established = match tokio::time::timeout(
            self.handshake_timeout,
            self.handshake.run(stream, peer.ip()),
        )
        .await
        {
            Ok(Ok(established)) => established,
            Ok(Err(e)) => {
                warn!("Handshake with {} failed: {}", peer, e);
                return Err(e.into());
            }
            Err(_) => {
                warn!("Handshake with {} timed out", peer);
                return Err(crate::Error::Timeout);
            }
        };

        let user = established.username.clone();
        let logging = self.users.logging_enabled(&user);
        let label = self.label(&user);

        let ciphers = if self.payload_encryption {
            let secret = self
                .users
                .secret_for(Some(user.as_str()).filter(|name| !name.is_empty()))
                .ok_or(crate::Error::AuthenticationFailed)?;
            Some(SessionKeys::derive(&secret)?.server_ciphers()?)
        } else {
            None
        };

        if logging {
            info!("{} connected from {}", label, peer);
        }

        let started = Instant::now();
        let result = ServerMultiplexer::new(Arc::clone(&self.connector), self.mux.clone())
            .with_user(label.clone(), logging)
            .with_ciphers(ciphers)
            .run(established.stream, established.leftover)
            .await;

        if logging {
            match &result {
                Ok(()) => info!("{} disconnected after {:?}", label, started.elapsed()),
                Err(e) => info!("{} disconnected after {:?}: {}", label, started.elapsed(), e),
            }
            info!("Upstream connects: {}", self.connector.stats());
        }

        result.map_err(Into::into)
    }

    fn label(&self, user: &str) -> String {
        match (self.log_users, user.is_empty()) {
            (false, _) => "client".to_string(),
            (true, true) => "legacy client".to_string(),
            (true, false) => format!("user {}", user),
        }
    }
}
