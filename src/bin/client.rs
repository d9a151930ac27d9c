//! SMTP Tunnel Client
//!
//! A tunnel client that:
//! - Connects to the server and passes as a mail client
//! - Keeps the tunnel up across failures
//! - Runs a local SOCKS5 proxy whose connections ride the tunnel

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use smtp_tunnel::{
    client::{ReconnectSupervisor, TunnelClient},
    config::Config,
    crypto::Secret,
    handshake::ClientHandshake,
    proxy::Socks5Server,
    transport::{client_tls_config, TlsClientUpgrade},
};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// SMTP Tunnel Client - TCP tunnel disguised as mail submission
#[derive(Parser, Debug)]
#[command(name = "smtp-tunnel-client")]
#[command(about = "SMTP Tunnel Client - local SOCKS5 proxy over an SMTP-disguised tunnel")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Server host (overrides config)
    #[arg(short, long)]
    server: Option<String>,

    /// Server port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Local SOCKS5 proxy address, host:port (overrides config)
    #[arg(long)]
    socks5: Option<String>,

    /// CA certificate for verifying the server (overrides config)
    #[arg(long)]
    ca_cert: Option<String>,

    /// Log level or filter directive (overrides config)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = Config::load(&args.config).context("Failed to load configuration")?;

    // Initialize logging
    let level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(level).context("Invalid log level")?)
        .init();

    let client_config = config
        .client
        .clone()
        .ok_or_else(|| anyhow!("No [client] section in config file"))?;

    let server_host = args.server.unwrap_or(client_config.server_host.clone());
    let server_port = args.port.unwrap_or(client_config.server_port);
    let socks_addr = args.socks5.unwrap_or_else(|| client_config.socks_addr());
    let ca_cert = args.ca_cert.or(client_config.ca_cert.clone());

    let tls = client_tls_config(ca_cert.as_deref().map(Path::new)).context("Failed to set up TLS")?;
    let upgrade = TlsClientUpgrade::new(tls, &server_host).context("Invalid server name")?;

    let secret = Secret::from(client_config.secret.as_str());
    let handshake = ClientHandshake::new(
        upgrade,
        secret.clone(),
        client_config.username().map(str::to_string),
    )
    .with_ehlo_domain(client_config.ehlo_domain.clone());

    let mut dialer = TunnelClient::new(
        server_host.clone(),
        server_port,
        handshake,
        config.tunnel.mux_config(),
    );
    if client_config.payload_encryption {
        dialer = dialer
            .with_payload_encryption(&secret)
            .context("Failed to derive payload keys")?;
    }

    info!("SMTP Tunnel Client v{}", smtp_tunnel::VERSION);
    info!("Server: {}:{}", server_host, server_port);
    match client_config.username() {
        Some(user) => info!("User: {}", user),
        None => info!("Using legacy shared-secret authentication"),
    }

    let supervisor = Arc::new(ReconnectSupervisor::new(dialer, client_config.reconnect.policy()));
    let socks = Socks5Server::bind(&socks_addr)
        .await
        .with_context(|| format!("Failed to bind SOCKS5 proxy on {}", socks_addr))?;

    let tunnel_task = tokio::spawn({
        let supervisor = Arc::clone(&supervisor);
        async move { supervisor.run().await }
    });

    let handle = supervisor.handle();
    tokio::select! {
        result = socks.run(handle) => {
            if let Err(e) = result {
                error!("SOCKS5 proxy error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    supervisor.shutdown();
    if let Err(e) = tunnel_task.await {
        error!("Reconnect supervisor task failed: {}", e);
    }
    info!("Reconnect stats: {}", supervisor.stats());

    Ok(())
}
