//! Configuration management

mod users;

pub use users::{IpAllowList, UserEntry, UserTable, UsersFile};

use crate::client::ReconnectPolicy;
use crate::obfuscation::{PaddingConfig, ShapingConfig};
use crate::protocol::{
    AUTH_MAX_AGE, CHANNEL_CONNECT_TIMEOUT, DEFAULT_EHLO_DOMAIN, DEFAULT_PORT, IDLE_TIMEOUT,
    KEEPALIVE_TIMEOUT, UPSTREAM_ATTEMPT_TIMEOUT,
};
use crate::transport::{default_ipv4_fallback, UpstreamConfig};
use crate::tunnel::{IdlePolicy, MuxConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: Option<ServerConfig>,
    /// Client configuration
    #[serde(default)]
    pub client: Option<ClientConfig>,
    /// Multiplexer settings shared by both roles
    #[serde(default)]
    pub tunnel: TunnelConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        Self::parse(&content)
    }

    /// Parse and validate configuration text
    pub fn parse(content: &str) -> Result<Self, crate::Error> {
        let config: Self = toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Check values serde cannot
    pub fn validate(&self) -> Result<(), crate::Error> {
        if let Some(server) = &self.server {
            server.validate()?;
        }
        if let Some(client) = &self.client {
            client.validate()?;
        }
        self.tunnel.validate()
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub listen: String,
    /// Name announced in the SMTP banner
    pub hostname: String,
    /// PEM certificate chain for STARTTLS
    pub cert_file: String,
    /// PEM private key for STARTTLS
    pub key_file: String,
    /// TOML file with the `[users.<name>]` table
    pub users_file: String,
    /// Include usernames in log lines
    pub log_users: bool,
    /// Maximum concurrent tunnel connections
    pub max_connections: usize,
    /// Auth token freshness window in seconds
    pub auth_max_age: u64,
    /// Seal DATA payloads on top of TLS
    pub payload_encryption: bool,
    /// Shared secret for tokens that carry no username
    pub secret: Option<String>,
    /// Static IPv4 pool for unreachable IPv6 literals, keyed by service
    pub ipv4_fallback: BTreeMap<String, Vec<Ipv4Addr>>,
    /// Last-resort DNS server; empty disables it
    pub alternate_resolver: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: format!("0.0.0.0:{}", DEFAULT_PORT),
            hostname: "mail.example.com".to_string(),
            cert_file: "server.crt".to_string(),
            key_file: "server.key".to_string(),
            users_file: "users.toml".to_string(),
            log_users: true,
            max_connections: 1000,
            auth_max_age: AUTH_MAX_AGE,
            payload_encryption: false,
            secret: None,
            ipv4_fallback: default_ipv4_fallback(),
            alternate_resolver: "8.8.8.8:53".to_string(),
        }
    }
}

impl ServerConfig {
    fn validate(&self) -> Result<(), crate::Error> {
        if self.hostname.trim().is_empty() {
            return Err(crate::Error::Config("server.hostname must not be empty".into()));
        }
        if self.max_connections == 0 {
            return Err(crate::Error::Config("server.max_connections must be at least 1".into()));
        }
        if self.auth_max_age == 0 {
            return Err(crate::Error::Config("server.auth_max_age must be at least 1".into()));
        }
        if self.secret.as_deref() == Some("") {
            return Err(crate::Error::Config("server.secret must not be empty when set".into()));
        }
        self.resolver_addr()?;
        Ok(())
    }

    fn resolver_addr(&self) -> Result<Option<SocketAddr>, crate::Error> {
        let resolver = self.alternate_resolver.trim();
        if resolver.is_empty() {
            return Ok(None);
        }
        resolver.parse().map(Some).map_err(|e| {
            crate::Error::Config(format!("Invalid server.alternate_resolver {:?}: {}", resolver, e))
        })
    }

    /// Settings for the upstream connector
    pub fn upstream_config(&self) -> Result<UpstreamConfig, crate::Error> {
        Ok(UpstreamConfig {
            attempt_timeout: UPSTREAM_ATTEMPT_TIMEOUT,
            ipv6_supported: None,
            ipv4_fallback: self.ipv4_fallback.clone(),
            alternate_resolver: self.resolver_addr()?,
        })
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Tunnel server host
    pub server_host: String,
    /// Tunnel server port
    pub server_port: u16,
    /// Local SOCKS5 bind address
    pub socks_host: String,
    /// Local SOCKS5 port
    pub socks_port: u16,
    /// Empty sends a legacy token without a username
    pub username: String,
    pub secret: String,
    /// CA certificate used to verify the server; unset accepts any
    pub ca_cert: Option<String>,
    /// Name sent in EHLO
    pub ehlo_domain: String,
    /// Seal DATA payloads on top of TLS
    pub payload_encryption: bool,
    pub reconnect: ReconnectConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_host: "127.0.0.1".to_string(),
            server_port: DEFAULT_PORT,
            socks_host: "127.0.0.1".to_string(),
            socks_port: 1080,
            username: String::new(),
            secret: String::new(),
            ca_cert: None,
            ehlo_domain: DEFAULT_EHLO_DOMAIN.to_string(),
            payload_encryption: false,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ClientConfig {
    fn validate(&self) -> Result<(), crate::Error> {
        if self.server_host.trim().is_empty() {
            return Err(crate::Error::Config("client.server_host must not be empty".into()));
        }
        if self.secret.is_empty() {
            return Err(crate::Error::Config("client.secret must not be empty".into()));
        }
        if self.username.contains(':') {
            return Err(crate::Error::Config("client.username must not contain ':'".into()));
        }
        self.reconnect.validate()
    }

    pub fn username(&self) -> Option<&str> {
        Some(self.username.as_str()).filter(|name| !name.is_empty())
    }

    /// Local SOCKS5 listen address
    pub fn socks_addr(&self) -> String {
        format!("{}:{}", self.socks_host, self.socks_port)
    }
}

/// Client reconnect settings, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay: u64,
    pub max_delay: u64,
    pub failure_threshold: u32,
    pub failure_window: u64,
    pub healthy_after: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        let policy = ReconnectPolicy::default();
        Self {
            initial_delay: policy.initial_delay.as_secs(),
            max_delay: policy.max_delay.as_secs(),
            failure_threshold: policy.failure_threshold,
            failure_window: policy.failure_window.as_secs(),
            healthy_after: policy.healthy_after.as_secs(),
        }
    }
}

impl ReconnectConfig {
    fn validate(&self) -> Result<(), crate::Error> {
        if self.initial_delay == 0 || self.max_delay < self.initial_delay {
            return Err(crate::Error::Config(
                "client.reconnect needs 0 < initial_delay <= max_delay".into(),
            ));
        }
        if self.failure_threshold == 0 {
            return Err(crate::Error::Config(
                "client.reconnect.failure_threshold must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_secs(self.initial_delay),
            max_delay: Duration::from_secs(self.max_delay),
            failure_threshold: self.failure_threshold,
            failure_window: Duration::from_secs(self.failure_window),
            healthy_after: Duration::from_secs(self.healthy_after),
        }
    }
}

/// Multiplexer settings; timeouts in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub idle_timeout: u64,
    pub idle_policy: IdlePolicy,
    pub keepalive_timeout: u64,
    pub connect_timeout: u64,
    pub max_channels: u16,
    /// Random delay before each write batch
    pub traffic_shaping: bool,
    pub shaping_min_delay_ms: u64,
    pub shaping_max_delay_ms: u64,
    /// Pad DATA payloads to standard sizes; both ends must match
    pub padding: bool,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        let shaping = ShapingConfig::default();
        Self {
            idle_timeout: IDLE_TIMEOUT.as_secs(),
            idle_policy: IdlePolicy::Ping,
            keepalive_timeout: KEEPALIVE_TIMEOUT.as_secs(),
            connect_timeout: CHANNEL_CONNECT_TIMEOUT.as_secs(),
            max_channels: 1000,
            traffic_shaping: false,
            shaping_min_delay_ms: shaping.min_delay_ms,
            shaping_max_delay_ms: shaping.max_delay_ms,
            padding: false,
        }
    }
}

impl TunnelConfig {
    fn validate(&self) -> Result<(), crate::Error> {
        if self.max_channels == 0 {
            return Err(crate::Error::Config("tunnel.max_channels must be at least 1".into()));
        }
        if self.idle_timeout == 0 || self.keepalive_timeout == 0 || self.connect_timeout == 0 {
            return Err(crate::Error::Config("tunnel timeouts must be at least 1 second".into()));
        }
        if self.shaping_min_delay_ms > self.shaping_max_delay_ms {
            return Err(crate::Error::Config(
                "tunnel.shaping_min_delay_ms exceeds shaping_max_delay_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn mux_config(&self) -> MuxConfig {
        MuxConfig {
            idle_timeout: Duration::from_secs(self.idle_timeout),
            idle_policy: self.idle_policy,
            keepalive_timeout: Duration::from_secs(self.keepalive_timeout),
            connect_timeout: Duration::from_secs(self.connect_timeout),
            max_channels: self.max_channels,
            shaping: self.traffic_shaping.then_some(ShapingConfig {
                min_delay_ms: self.shaping_min_delay_ms,
                max_delay_ms: self.shaping_max_delay_ms,
            }),
            padding: self.padding.then(PaddingConfig::default),
            ..MuxConfig::default()
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        server: Some(ServerConfig::default()),
        client: Some(ClientConfig {
            username: "alice".to_string(),
            secret: "change-me".to_string(),
            ..ClientConfig::default()
        }),
        tunnel: TunnelConfig::default(),
        logging: LoggingConfig::default(),
    }
}
