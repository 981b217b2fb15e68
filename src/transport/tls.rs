//! TLS transport implementation
//!
//! TLS links using rustls. The underlying TCP connection is made by a
//! [`TcpTransport`], so upstream proxies work for TLS tethers as well.

use super::{AddrMaybeCached, StreamDyn, TcpTransport, Transport, TransportDyn};
use crate::config::{TetherConfig, TlsConfig};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io::BufReader;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;

/// TLS stream type alias
pub type TlsStream = tokio_rustls::client::TlsStream<TcpStream>;

/// TLS transport for encrypted links
#[derive(Clone)]
pub struct TlsTransport {
    connector: TlsConnector,
    /// Name used for certificate verification
    hostname: String,
    tcp: TcpTransport,
}

impl std::fmt::Debug for TlsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsTransport")
            .field("hostname", &self.hostname)
            .field("tcp", &self.tcp)
            .finish()
    }
}

impl TlsTransport {
    /// Create a TLS transport on top of `tcp`
    pub fn with_config(config: &TlsConfig, hostname: &str, tcp: TcpTransport) -> Result<Self> {
        let tls_config = if config.skip_verify {
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
                .with_no_client_auth()
        } else {
            let mut root_store = RootCertStore::empty();
            let native_certs = rustls_native_certs::load_native_certs();
            for cert in native_certs.certs {
                root_store.add(cert).ok();
            }

            if let Some(ref root_path) = config.trusted_root {
                let file = std::fs::File::open(root_path)
                    .with_context(|| format!("Failed to open certificate file: {}", root_path))?;
                let mut reader = BufReader::new(file);
                let certs = rustls_pemfile::certs(&mut reader)
                    .collect::<Result<Vec<_>, _>>()
                    .with_context(|| format!("Failed to parse certificates from: {}", root_path))?;
                for cert in certs {
                    root_store
                        .add(cert)
                        .with_context(|| "Failed to add certificate to store")?;
                }
            }

            ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth()
        };

        Ok(TlsTransport {
            connector: TlsConnector::from(Arc::new(tls_config)),
            hostname: config
                .hostname
                .clone()
                .unwrap_or_else(|| hostname.to_string()),
            tcp,
        })
    }
}

/// Certificate verifier that accepts all certificates
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[async_trait]
impl Transport for TlsTransport {
    type Stream = TlsStream;

    fn new(config: &TetherConfig) -> Result<Self> {
        let tcp = TcpTransport::new(config)?;
        TlsTransport::with_config(&config.tls, &config.host, tcp)
    }

    async fn connect(&self, addr: &AddrMaybeCached) -> Result<Self::Stream> {
        let tcp_stream = self.tcp.connect(addr).await?;

        let server_name = ServerName::try_from(self.hostname.clone())
            .with_context(|| format!("Invalid hostname: {}", self.hostname))?;

        let tls_stream = tokio::time::timeout(
            self.tcp.connect_timeout(),
            self.connector.connect(server_name, tcp_stream),
        )
        .await
        .with_context(|| format!("TLS handshake timeout with {}", self.hostname))?
        .with_context(|| format!("TLS handshake failed with {}", self.hostname))?;

        tracing::debug!("TLS connection established to {}", self.hostname);

        Ok(tls_stream)
    }
}

#[async_trait]
impl TransportDyn for TlsTransport {
    async fn connect_dyn(&self, addr: &AddrMaybeCached) -> Result<Box<dyn StreamDyn>> {
        let stream = self.connect(addr).await?;
        Ok(Box::new(stream))
    }
}
