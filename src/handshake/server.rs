//! Responder side of the disguise handshake

use super::{is_command, lines, Established, HandshakeError, HandshakeStage, LineIo};
use crate::crypto::{AuthToken, Secret};
use crate::protocol::{AUTH_MAX_AGE, HANDSHAKE_LINE_TIMEOUT};
use crate::transport::StartTls;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

/// Source of per-user secrets and source address policy
pub trait Authenticator: Send + Sync {
    /// Secret for `username`; `None` stands for a legacy token without one
    fn secret_for(&self, username: Option<&str>) -> Option<Secret>;

    /// Whether `username` may connect from `peer`
    fn permits(&self, _username: &str, _peer: IpAddr) -> bool {
        true
    }
}

impl<A: Authenticator + ?Sized> Authenticator for Arc<A> {
    fn secret_for(&self, username: Option<&str>) -> Option<Secret> {
        (**self).secret_for(username)
    }

    fn permits(&self, username: &str, peer: IpAddr) -> bool {
        (**self).permits(username, peer)
    }
}

/// Drives the handshake from the server side
pub struct ServerHandshake<U, A> {
    hostname: String,
    upgrade: U,
    auth: A,
    max_age: u64,
    line_timeout: Duration,
}

impl<U, A: Authenticator> ServerHandshake<U, A> {
    pub fn new(hostname: impl Into<String>, upgrade: U, auth: A) -> Self {
        Self {
            hostname: hostname.into(),
            upgrade,
            auth,
            max_age: AUTH_MAX_AGE,
            line_timeout: HANDSHAKE_LINE_TIMEOUT,
        }
    }

    /// Token freshness window in seconds
    pub fn with_max_age(mut self, max_age: u64) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_line_timeout(mut self, timeout: Duration) -> Self {
        self.line_timeout = timeout;
        self
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Run the handshake on an accepted connection from `peer`
    pub async fn run<S>(&self, stream: S, peer: IpAddr) -> Result<Established<U::Output>, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        U: StartTls<S>,
    {
        let mut io = LineIo::with_timeout(stream, self.line_timeout);
        let host_line = format!("250-{}", self.hostname);

        io.write_line(&format!("220 {} ESMTP Postfix (Ubuntu)", self.hostname))
            .await?;

        let ehlo = io.read_line(HandshakeStage::Ehlo1).await?;
        if !is_command(&ehlo, "EHLO") && !is_command(&ehlo, "HELO") {
            return Err(HandshakeError::unexpected(HandshakeStage::Ehlo1, &ehlo));
        }
        io.write_lines(&[&host_line, lines::CAP_STARTTLS, lines::CAP_AUTH, lines::CAP_LAST])
            .await?;

        let starttls = io.read_line(HandshakeStage::StartTls).await?;
        if !starttls.trim().eq_ignore_ascii_case(lines::STARTTLS) {
            return Err(HandshakeError::unexpected(HandshakeStage::StartTls, &starttls));
        }
        io.write_line(lines::STARTTLS_READY).await?;

        let tls = self.upgrade.upgrade(io.into_plain()?).await?;
        let mut io = LineIo::with_timeout(tls, self.line_timeout);

        let ehlo = io.read_line(HandshakeStage::Ehlo2).await?;
        if !is_command(&ehlo, "EHLO") && !is_command(&ehlo, "HELO") {
            return Err(HandshakeError::unexpected(HandshakeStage::Ehlo2, &ehlo));
        }
        io.write_lines(&[&host_line, lines::CAP_AUTH, lines::CAP_LAST]).await?;

        let auth = io.read_line(HandshakeStage::Auth).await?;
        let username = match self.authenticate(&auth, peer) {
            Some(username) => username,
            None => {
                io.write_line(lines::AUTH_FAILED).await?;
                return Err(HandshakeError::AuthFailed);
            }
        };
        io.write_line(lines::AUTH_OK).await?;

        let binary = io.read_line(HandshakeStage::BinarySwitch).await?;
        if !binary.trim().eq_ignore_ascii_case(lines::BINARY) {
            return Err(HandshakeError::unexpected(HandshakeStage::BinarySwitch, &binary));
        }
        io.write_line(lines::BINARY_OK).await?;

        let (stream, leftover) = io.into_parts();
        Ok(Established {
            stream,
            leftover,
            username,
        })
    }

    /// Check an `AUTH PLAIN <token>` line; every failure looks the same on the wire
    fn authenticate(&self, line: &str, peer: IpAddr) -> Option<String> {
        let mut parts = line.split_whitespace();
        let (Some(command), Some(mechanism), Some(token)) = (parts.next(), parts.next(), parts.next())
        else {
            debug!(%peer, "AUTH line without token");
            return None;
        };
        if !command.eq_ignore_ascii_case("AUTH") || !mechanism.eq_ignore_ascii_case("PLAIN") {
            debug!(%peer, "Unsupported AUTH command");
            return None;
        }

        let username = match AuthToken::verify_now(token, |user| self.auth.secret_for(user), self.max_age) {
            Ok(username) => username,
            Err(e) => {
                warn!(%peer, "Authentication failed: {}", e);
                return None;
            }
        };

        if !self.auth.permits(&username, peer) {
            warn!(%peer, user = %username, "Source address not allowed");
            return None;
        }

        Some(username)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::testing::PlainUpgrade;
    use crate::handshake::ClientHandshake;
    use crate::protocol::MAX_LINE_LEN;
    use std::collections::HashMap;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    struct Users {
        secrets: HashMap<String, Secret>,
        legacy: Option<Secret>,
        allowed: Option<IpAddr>,
    }

    impl Authenticator for Users {
        fn secret_for(&self, username: Option<&str>) -> Option<Secret> {
            match username {
                Some(user) => self.secrets.get(user).cloned(),
                None => self.legacy.clone(),
            }
        }

        fn permits(&self, _username: &str, peer: IpAddr) -> bool {
            self.allowed.map_or(true, |ip| ip == peer)
        }
    }

    fn users() -> Users {
        Users {
            secrets: HashMap::from([
                ("alice".to_string(), Secret::from("alice-secret")),
                ("bob".to_string(), Secret::from("bob-secret")),
            ]),
            legacy: Some(Secret::from("shared")),
            allowed: None,
        }
    }

    const PEER: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10));

    async fn run_pair(
        users: Users,
        secret: &str,
        username: Option<&str>,
    ) -> (
        Result<Established<DuplexStream>, HandshakeError>,
        Result<Established<DuplexStream>, HandshakeError>,
    ) {
        let (a, b) = tokio::io::duplex(16 * 1024);
        let server = ServerHandshake::new("mail.example.com", PlainUpgrade, users);
        let client = ClientHandshake::new(PlainUpgrade, Secret::from(secret), username.map(str::to_string));

        tokio::join!(server.run(a, PEER), client.run(b))
    }

    #[tokio::test]
    async fn test_full_handshake() {
        let (server, client) = run_pair(users(), "alice-secret", Some("alice")).await;
        let server = server.unwrap();
        let client = client.unwrap();

        assert_eq!(server.username, "alice");
        assert_eq!(client.username, "alice");
        assert!(server.leftover.is_empty());
    }

    #[tokio::test]
    async fn test_legacy_token() {
        let (server, client) = run_pair(users(), "shared", None).await;
        assert_eq!(server.unwrap().username, "");
        assert!(client.is_ok());
    }

    #[tokio::test]
    async fn test_wrong_secret_rejected() {
        let (server, client) = run_pair(users(), "bob-secret", Some("alice")).await;
        assert!(matches!(server, Err(HandshakeError::AuthFailed)));
        assert!(matches!(client, Err(HandshakeError::AuthFailed)));
    }

    #[tokio::test]
    async fn test_unknown_user_rejected() {
        let (server, client) = run_pair(users(), "whatever", Some("mallory")).await;
        assert!(matches!(server, Err(HandshakeError::AuthFailed)));
        assert!(matches!(client, Err(HandshakeError::AuthFailed)));
    }

    #[tokio::test]
    async fn test_source_address_policy() {
        let mut restricted = users();
        restricted.allowed = Some(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)));

        let (server, client) = run_pair(restricted, "alice-secret", Some("alice")).await;
        assert!(matches!(server, Err(HandshakeError::AuthFailed)));
        assert!(matches!(client, Err(HandshakeError::AuthFailed)));
    }

    /// Scripted client checking the exact server lines
    #[tokio::test]
    async fn test_server_transcript() {
        let (a, b) = tokio::io::duplex(16 * 1024);
        let server = ServerHandshake::new("mx.example.org", PlainUpgrade, users());
        let task = tokio::spawn(async move { server.run(a, PEER).await.map(|e| e.leftover) });

        let mut b = BufReader::new(b);

        async fn line(b: &mut BufReader<DuplexStream>) -> String {
            let mut line = String::new();
            b.read_line(&mut line).await.unwrap();
            line
        }

        assert_eq!(line(&mut b).await, "220 mx.example.org ESMTP Postfix (Ubuntu)\r\n");
        b.write_all(b"ehlo checker\r\n").await.unwrap();
        assert_eq!(line(&mut b).await, "250-mx.example.org\r\n");
        assert_eq!(line(&mut b).await, "250-STARTTLS\r\n");
        assert_eq!(line(&mut b).await, "250-AUTH PLAIN LOGIN\r\n");
        assert_eq!(line(&mut b).await, "250 8BITMIME\r\n");

        b.write_all(b"STARTTLS\r\n").await.unwrap();
        assert_eq!(line(&mut b).await, "220 2.0.0 Ready to start TLS\r\n");

        b.write_all(b"EHLO checker\r\n").await.unwrap();
        assert_eq!(line(&mut b).await, "250-mx.example.org\r\n");
        assert_eq!(line(&mut b).await, "250-AUTH PLAIN LOGIN\r\n");
        assert_eq!(line(&mut b).await, "250 8BITMIME\r\n");

        let token = AuthToken::generate_now(&Secret::from("bob-secret"), Some("bob"));
        b.write_all(format!("AUTH PLAIN {}\r\n", token).as_bytes()).await.unwrap();
        assert_eq!(line(&mut b).await, "235 2.7.0 Authentication successful\r\n");

        // First frame pipelined behind BINARY
        b.write_all(b"BINARY\r\n\x01\x06\x00\x00\x00\x00").await.unwrap();
        assert_eq!(line(&mut b).await, "299 Binary mode activated\r\n");

        let leftover = task.await.unwrap().unwrap();
        assert_eq!(&leftover[..], &[1, 6, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_stale_token_gets_generic_failure() {
        let (a, b) = tokio::io::duplex(16 * 1024);
        let server = ServerHandshake::new("mx", PlainUpgrade, users()).with_max_age(300);
        let task = tokio::spawn(async move { server.run(a, PEER).await.err() });

        let mut b = BufReader::new(b);
        let mut sink = String::new();
        b.read_line(&mut sink).await.unwrap();
        b.write_all(b"EHLO x\r\nSTARTTLS\r\n").await.unwrap();
        for _ in 0..5 {
            b.read_line(&mut sink).await.unwrap();
        }

        b.write_all(b"EHLO x\r\n").await.unwrap();
        for _ in 0..3 {
            b.read_line(&mut sink).await.unwrap();
        }

        let stale = AuthToken::generate(&Secret::from("alice-secret"), 1_000, Some("alice"));
        b.write_all(format!("AUTH PLAIN {}\r\n", stale).as_bytes()).await.unwrap();
        let mut reply = String::new();
        b.read_line(&mut reply).await.unwrap();
        assert_eq!(reply, "535 5.7.8 Authentication failed\r\n");

        assert!(matches!(task.await.unwrap(), Some(HandshakeError::AuthFailed)));
    }

    #[tokio::test]
    async fn test_binary_verb_is_case_insensitive() {
        let (a, b) = tokio::io::duplex(16 * 1024);
        let server = ServerHandshake::new("mx", PlainUpgrade, users());
        let task = tokio::spawn(async move { server.run(a, PEER).await.map(|e| e.username) });

        let mut b = BufReader::new(b);
        let mut sink = String::new();
        b.read_line(&mut sink).await.unwrap();
        b.write_all(b"EHLO x\r\nSTARTTLS\r\n").await.unwrap();
        for _ in 0..5 {
            b.read_line(&mut sink).await.unwrap();
        }

        b.write_all(b"EHLO x\r\n").await.unwrap();
        for _ in 0..3 {
            b.read_line(&mut sink).await.unwrap();
        }

        let token = AuthToken::generate_now(&Secret::from("alice-secret"), Some("alice"));
        b.write_all(format!("AUTH PLAIN {}\r\n", token).as_bytes()).await.unwrap();
        b.read_line(&mut sink).await.unwrap();

        b.write_all(b"binary\r\n").await.unwrap();
        let mut reply = String::new();
        b.read_line(&mut reply).await.unwrap();
        assert_eq!(reply, "299 Binary mode activated\r\n");
        assert_eq!(task.await.unwrap().unwrap(), "alice");
    }

    #[tokio::test]
    async fn test_plaintext_after_starttls_aborts() {
        let (a, b) = tokio::io::duplex(16 * 1024);
        let server = ServerHandshake::new("mx", PlainUpgrade, users());
        let task = tokio::spawn(async move { server.run(a, PEER).await.err() });

        let mut b = BufReader::new(b);
        let mut sink = String::new();
        b.read_line(&mut sink).await.unwrap();
        b.write_all(b"EHLO x\r\nSTARTTLS\r\nEHLO sneaky\r\n").await.unwrap();

        assert!(matches!(task.await.unwrap(), Some(HandshakeError::PipelinedData)));
    }

    #[tokio::test]
    async fn test_rejects_wrong_command() {
        let (a, b) = tokio::io::duplex(16 * 1024);
        let server = ServerHandshake::new("mx", PlainUpgrade, users());
        let task = tokio::spawn(async move { server.run(a, PEER).await.err() });

        let mut b = BufReader::new(b);
        let mut sink = String::new();
        b.read_line(&mut sink).await.unwrap();
        b.write_all(format!("MAIL FROM:<{}>\r\n", "a".repeat(MAX_LINE_LEN / 2)).as_bytes())
            .await
            .unwrap();

        let err = task.await.unwrap().unwrap();
        assert_eq!(err.stage(), Some(HandshakeStage::Ehlo1));
    }
}
