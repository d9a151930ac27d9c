//! SOCKS5 proxy implementation (RFC 1928), no-auth CONNECT only
//!
//! The success reply is held back until the server has answered the
//! channel's CONNECT, so a SOCKS client never sees a connection that the
//! tunnel could not actually open.

use super::{Address, ProxyError};
use crate::client::TunnelHandle;
use crate::tunnel::TunnelError;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

/// SOCKS5 version
const SOCKS_VERSION: u8 = 0x05;

/// Bound on the greeting and request exchange
const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Authentication methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum AuthMethod {
    NoAuth = 0x00,
    NoAcceptable = 0xFF,
}

/// SOCKS5 commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

impl TryFrom<u8> for Command {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::Connect),
            0x02 => Ok(Command::Bind),
            0x03 => Ok(Command::UdpAssociate),
            _ => Err(ProxyError::UnsupportedCommand(value)),
        }
    }
}

/// Address types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum AddressType {
    Ipv4 = 0x01,
    Domain = 0x03,
    Ipv6 = 0x04,
}

impl TryFrom<u8> for AddressType {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(AddressType::Ipv4),
            0x03 => Ok(AddressType::Domain),
            0x04 => Ok(AddressType::Ipv6),
            _ => Err(ProxyError::UnsupportedAddressType(value)),
        }
    }
}

/// Reply codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    HostUnreachable = 0x04,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl Reply {
    /// Map a failed channel open; never leaks upstream detail
    fn for_error(error: &TunnelError) -> Self {
        match error {
            TunnelError::ConnectionClosed | TunnelError::TooManyChannels(_) => Reply::GeneralFailure,
            _ => Reply::HostUnreachable,
        }
    }

    /// Reply with an all-zero IPv4 bound address
    fn encode(self) -> [u8; 10] {
        [SOCKS_VERSION, self as u8, 0x00, AddressType::Ipv4 as u8, 0, 0, 0, 0, 0, 0]
    }
}

/// SOCKS5 proxy server
pub struct Socks5Server {
    listener: TcpListener,
}

impl Socks5Server {
    /// Create a new SOCKS5 server
    pub async fn bind(addr: &str) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr).await?;
        info!("SOCKS5 server listening on {}", listener.local_addr()?);

        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept clients and open a tunnel channel for each
    pub async fn run(&self, tunnel: TunnelHandle) -> Result<(), ProxyError> {
        loop {
            let (stream, peer_addr) = self.listener.accept().await?;
            debug!("New SOCKS5 connection from {}", peer_addr);

            let tunnel = tunnel.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, tunnel).await {
                    match e {
                        ProxyError::Io(_) | ProxyError::Timeout => {
                            debug!("SOCKS5 client {} went away: {}", peer_addr, e)
                        }
                        _ => error!("SOCKS5 connection error: {}", e),
                    }
                }
            });
        }
    }

    async fn handle_connection(mut stream: TcpStream, tunnel: TunnelHandle) -> Result<(), ProxyError> {
        let _ = stream.set_nodelay(true);

        let address = tokio::time::timeout(NEGOTIATION_TIMEOUT, negotiate(&mut stream))
            .await
            .map_err(|_| ProxyError::Timeout)??;

        if !tunnel.is_connected() {
            stream.write_all(&Reply::GeneralFailure.encode()).await?;
            return Err(ProxyError::TunnelDown);
        }

        let channel = match tunnel.open_channel(&address.host(), address.port()).await {
            Ok(channel) => channel,
            Err(e) => {
                debug!("Cannot open channel to {}: {}", address, e);
                stream.write_all(&Reply::for_error(&e).encode()).await?;
                return Ok(());
            }
        };

        stream.write_all(&Reply::Succeeded.encode()).await?;
        channel.attach(stream).await?;
        Ok(())
    }
}

/// Method selection and request; returns the CONNECT target
///
/// Unsupported commands and address types are answered here.
async fn negotiate<S>(stream: &mut S) -> Result<Address, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Read greeting
    let mut buf = [0u8; 255];
    stream.read_exact(&mut buf[..2]).await?;

    if buf[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(buf[0]));
    }

    let nmethods = buf[1] as usize;
    stream.read_exact(&mut buf[..nmethods]).await?;

    let method = if buf[..nmethods].contains(&(AuthMethod::NoAuth as u8)) {
        AuthMethod::NoAuth
    } else {
        AuthMethod::NoAcceptable
    };
    stream.write_all(&[SOCKS_VERSION, method as u8]).await?;

    if method == AuthMethod::NoAcceptable {
        return Err(ProxyError::AuthenticationFailed);
    }

    // Read request
    stream.read_exact(&mut buf[..4]).await?;

    if buf[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(buf[0]));
    }

    let command = match Command::try_from(buf[1]) {
        Ok(command) => command,
        Err(e) => {
            stream.write_all(&Reply::CommandNotSupported.encode()).await?;
            return Err(e);
        }
    };
    // buf[2] is reserved
    let addr_type = match AddressType::try_from(buf[3]) {
        Ok(addr_type) => addr_type,
        Err(e) => {
            stream.write_all(&Reply::AddressTypeNotSupported.encode()).await?;
            return Err(e);
        }
    };

    let address = match addr_type {
        AddressType::Ipv4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            Address::Ipv4(Ipv4Addr::from(ip), stream.read_u16().await?)
        }
        AddressType::Domain => {
            let len = stream.read_u8().await? as usize;
            stream.read_exact(&mut buf[..len]).await?;
            let domain = std::str::from_utf8(&buf[..len])
                .map_err(|_| ProxyError::InvalidAddress("domain is not UTF-8".into()))?
                .to_string();
            if domain.is_empty() {
                return Err(ProxyError::InvalidAddress("empty domain".into()));
            }
            Address::Domain(domain, stream.read_u16().await?)
        }
        AddressType::Ipv6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            Address::Ipv6(Ipv6Addr::from(ip), stream.read_u16().await?)
        }
    };

    debug!("SOCKS5 {:?} to {}", command, address);

    match command {
        Command::Connect => Ok(address),
        Command::Bind | Command::UdpAssociate => {
            stream.write_all(&Reply::CommandNotSupported.encode()).await?;
            Err(ProxyError::UnsupportedCommand(command as u8))
        }
    }
}
