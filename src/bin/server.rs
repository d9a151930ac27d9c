//! SMTP Tunnel Server
//!
//! Listens like a mail submission server and:
//! - Answers the SMTP dialogue and upgrades with STARTTLS
//! - Authenticates users against the users file
//! - Opens the channels each client asks for and relays their data

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use smtp_tunnel::{
    config::{generate_example_config, Config, UserTable, UsersFile},
    crypto::Secret,
    handshake::ServerHandshake,
    server::TunnelServer,
    transport::{server_tls_config, TlsServerUpgrade, UpstreamConnector},
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// SMTP Tunnel Server - TCP tunnel disguised as mail submission
#[derive(Parser, Debug)]
#[command(name = "smtp-tunnel-server")]
#[command(about = "SMTP Tunnel Server - TCP tunneling behind an SMTP STARTTLS dialogue")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Print an example configuration and exit
    #[arg(long)]
    example_config: bool,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Users file (overrides config)
    #[arg(short, long)]
    users: Option<PathBuf>,

    /// Log level or filter directive (overrides config)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.example_config {
        print!("{}", toml::to_string_pretty(&generate_example_config())?);
        return Ok(());
    }

    let config = Config::load(&args.config).context("Failed to load configuration")?;

    // Initialize logging
    let level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(level).context("Invalid log level")?)
        .init();

    let server_config = config
        .server
        .clone()
        .ok_or_else(|| anyhow!("No [server] section in config file"))?;

    let users_path = args
        .users
        .unwrap_or_else(|| relative_to(&args.config, &server_config.users_file));
    let users_file = UsersFile::load(&users_path).context("Failed to load users")?;
    let legacy = server_config.secret.as_deref().map(Secret::from);
    let users = Arc::new(UserTable::from_file(&users_file, legacy).context("Invalid users file")?);
    info!("Loaded {} user(s) from {}", users.len(), users_path.display());

    let tls = server_tls_config(
        relative_to(&args.config, &server_config.cert_file),
        relative_to(&args.config, &server_config.key_file),
    )
    .context("Failed to load TLS certificate")?;

    let upstream = server_config
        .upstream_config()
        .context("Invalid upstream settings")?;
    if upstream.alternate_resolver.is_some() && cfg!(not(feature = "alt-resolver")) {
        warn!("alternate_resolver is set but this build has no alt-resolver support");
    }
    let connector = Arc::new(UpstreamConnector::new(upstream));
    info!(
        "IPv6 upstream connects {}",
        if connector.ipv6_supported() { "enabled" } else { "unavailable" }
    );

    let handshake = ServerHandshake::new(
        server_config.hostname.clone(),
        TlsServerUpgrade::new(tls),
        Arc::clone(&users),
    )
    .with_max_age(server_config.auth_max_age);

    let server = Arc::new(
        TunnelServer::new(handshake, users, connector, config.tunnel.mux_config())
            .with_max_connections(server_config.max_connections)
            .with_payload_encryption(server_config.payload_encryption)
            .with_log_users(server_config.log_users),
    );

    let listen_addr = args.listen.unwrap_or(server_config.listen);

    info!("SMTP Tunnel Server v{}", smtp_tunnel::VERSION);
    info!("Hostname: {}", server_config.hostname);
    if server_config.payload_encryption {
        info!("Payload encryption enabled");
    }

    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", listen_addr))?;

    let stats = server.connector().stats();
    tokio::select! {
        result = server.serve(listener) => {
            result.context("Listener failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    info!("Upstream connects: {}", stats);
    Ok(())
}

/// Resolve `file` against the directory holding the config file
fn relative_to(config: &Path, file: &str) -> PathBuf {
    let file = Path::new(file);
    match config.parent() {
        Some(dir) if file.is_relative() => dir.join(file),
        _ => file.to_path_buf(),
    }
}
