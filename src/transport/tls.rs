//! STARTTLS upgrade of an existing connection
//!
//! The disguise handshake hands its plain TCP stream to a [`StartTls`]
//! implementation and continues on whatever stream comes back. The rustls
//! implementations below wrap the same socket in place; no new connection
//! is made.

use super::TransportError;
use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring as ring_provider, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{info, warn};

/// Upgrades a plain stream to TLS after the STARTTLS exchange
#[async_trait]
pub trait StartTls<S>: Send + Sync
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Output: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn upgrade(&self, stream: S) -> Result<Self::Output, TransportError>;
}

/// Server side of the upgrade
#[derive(Clone)]
pub struct TlsServerUpgrade {
    acceptor: TlsAcceptor,
}

impl TlsServerUpgrade {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self {
            acceptor: TlsAcceptor::from(config),
        }
    }
}

#[async_trait]
impl<S> StartTls<S> for TlsServerUpgrade
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Output = tokio_rustls::server::TlsStream<S>;

    async fn upgrade(&self, stream: S) -> Result<Self::Output, TransportError> {
        self.acceptor
            .accept(stream)
            .await
            .map_err(|e| TransportError::Tls(e.to_string()))
    }
}

/// Client side of the upgrade
#[derive(Clone)]
pub struct TlsClientUpgrade {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl TlsClientUpgrade {
    pub fn new(config: Arc<ClientConfig>, server_host: &str) -> Result<Self, TransportError> {
        let server_name = ServerName::try_from(server_host.to_string())
            .map_err(|e| TransportError::Tls(format!("Invalid server name '{}': {}", server_host, e)))?;

        Ok(Self {
            connector: TlsConnector::from(config),
            server_name,
        })
    }
}

#[async_trait]
impl<S> StartTls<S> for TlsClientUpgrade
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Output = tokio_rustls::client::TlsStream<S>;

    async fn upgrade(&self, stream: S) -> Result<Self::Output, TransportError> {
        self.connector
            .connect(self.server_name.clone(), stream)
            .await
            .map_err(|e| TransportError::Tls(e.to_string()))
    }
}

/// Load PEM certificates
pub fn load_certs(path: impl AsRef<Path>) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let path = path.as_ref();
    let file = std::fs::File::open(path).map_err(|e| {
        TransportError::Certificate(format!("Failed to open cert file {}: {}", path.display(), e))
    })?;
    let mut reader = std::io::BufReader::new(file);

    let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Certificate(format!("Failed to parse PEM certificates: {}", e)))?;
    if certs.is_empty() {
        return Err(TransportError::Certificate(format!(
            "No certificates found in {}",
            path.display()
        )));
    }

    info!("Loaded {} certificate(s) from {}", certs.len(), path.display());
    Ok(certs)
}

/// Load a PEM private key
pub fn load_private_key(path: impl AsRef<Path>) -> Result<PrivateKeyDer<'static>, TransportError> {
    let path = path.as_ref();
    let file = std::fs::File::open(path).map_err(|e| {
        TransportError::Certificate(format!("Failed to open key file {}: {}", path.display(), e))
    })?;
    let mut reader = std::io::BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::Certificate(format!("Failed to parse PEM private key: {}", e)))?
        .ok_or_else(|| TransportError::Certificate(format!("No private key found in {}", path.display())))
}

/// Server TLS configuration from certificate and key files
pub fn server_tls_config(
    cert_file: impl AsRef<Path>,
    key_file: impl AsRef<Path>,
) -> Result<Arc<ServerConfig>, TransportError> {
    let certs = load_certs(cert_file)?;
    let key = load_private_key(key_file)?;

    let config = ServerConfig::builder_with_provider(Arc::new(ring_provider::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::Tls(e.to_string()))?;

    Ok(Arc::new(config))
}

/// Client TLS configuration
///
/// With a CA file the server certificate is verified against it; without
/// one any certificate is accepted.
pub fn client_tls_config(ca_file: Option<&Path>) -> Result<Arc<ClientConfig>, TransportError> {
    let provider = Arc::new(ring_provider::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?;

    let config = match ca_file {
        Some(path) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(path)? {
                roots
                    .add(cert)
                    .map_err(|e| TransportError::Certificate(e.to_string()))?;
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        }
        None => {
            warn!("No CA certificate configured, server certificate will not be verified");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
                .with_no_client_auth()
        }
    };

    Ok(Arc::new(config))
}

/// Verifier that checks handshake signatures but trusts any certificate
#[derive(Debug)]
struct AcceptAnyCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
