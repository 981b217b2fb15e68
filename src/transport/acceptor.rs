//! Inbound transport links
//!
//! Tether listeners accept TCP connections and optionally wrap them in a
//! server side TLS session before the link handshake.

use super::{SocketOpts, StreamDyn};
use crate::config::ServerTlsConfig;
use anyhow::Result;
use tokio::net::TcpStream;

/// Turns accepted TCP connections into transport links
#[derive(Clone)]
pub struct LinkAcceptor {
    #[cfg(feature = "rustls-tls")]
    tls: Option<tokio_rustls::TlsAcceptor>,
    socket_opts: SocketOpts,
}

impl std::fmt::Debug for LinkAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkAcceptor")
            .field("tls", &self.is_tls())
            .field("socket_opts", &self.socket_opts)
            .finish()
    }
}

impl LinkAcceptor {
    /// Plain TCP acceptor
    pub fn plain() -> Self {
        LinkAcceptor {
            #[cfg(feature = "rustls-tls")]
            tls: None,
            socket_opts: SocketOpts::default(),
        }
    }

    /// Acceptor for a listener's optional TLS material
    pub fn from_config(tls: Option<&ServerTlsConfig>) -> Result<Self> {
        match tls {
            None => Ok(LinkAcceptor::plain()),
            #[cfg(feature = "rustls-tls")]
            Some(config) => Ok(LinkAcceptor {
                tls: Some(server_tls::load(config)?),
                socket_opts: SocketOpts::default(),
            }),
            #[cfg(not(feature = "rustls-tls"))]
            Some(_) => Err(anyhow::anyhow!(
                "TLS listener requires the rustls-tls feature"
            )),
        }
    }

    /// True if links are TLS wrapped
    pub fn is_tls(&self) -> bool {
        #[cfg(feature = "rustls-tls")]
        {
            self.tls.is_some()
        }
        #[cfg(not(feature = "rustls-tls"))]
        {
            false
        }
    }

    /// Finish accepting one connection
    pub async fn accept(&self, stream: TcpStream) -> Result<Box<dyn StreamDyn>> {
        if let Err(e) = self.socket_opts.apply(&stream) {
            tracing::warn!("Failed to apply socket options: {}", e);
        }
        #[cfg(feature = "rustls-tls")]
        {
            if let Some(acceptor) = &self.tls {
                use anyhow::Context;
                let tls = acceptor
                    .accept(stream)
                    .await
                    .with_context(|| "TLS accept failed")?;
                return Ok(Box::new(tls));
            }
        }
        Ok(Box::new(stream))
    }
}

#[cfg(feature = "rustls-tls")]
mod server_tls {
    use crate::config::ServerTlsConfig;
    use anyhow::{anyhow, Context, Result};
    use std::io::BufReader;
    use std::sync::Arc;
    use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
    use tokio_rustls::rustls::ServerConfig;
    use tokio_rustls::TlsAcceptor;

    pub(super) fn load(config: &ServerTlsConfig) -> Result<TlsAcceptor> {
        let certs = load_certs(&config.cert)?;
        let key = load_private_key(&config.key)?;
        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .with_context(|| "Invalid certificate or key")?;
        tracing::info!(cert = %config.cert, "TLS configured");
        Ok(TlsAcceptor::from(Arc::new(server_config)))
    }

    fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open certificate file: {}", path))?;
        let certs = rustls_pemfile::certs(&mut BufReader::new(file))
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("Failed to parse certificates from: {}", path))?;
        if certs.is_empty() {
            return Err(anyhow!("No certificates found in {}", path));
        }
        Ok(certs)
    }

    fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
        let file =
            std::fs::File::open(path).with_context(|| format!("Failed to open key file: {}", path))?;
        rustls_pemfile::private_key(&mut BufReader::new(file))
            .with_context(|| format!("Failed to parse key from: {}", path))?
            .ok_or_else(|| anyhow!("No private key found in {}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_plain_acceptor() {
        let acceptor = LinkAcceptor::from_config(None).unwrap();
        assert!(!acceptor.is_tls());
    }

    #[cfg(feature = "rustls-tls")]
    #[test]
    fn test_missing_cert_file() {
        let config = ServerTlsConfig {
            cert: "/nonexistent/cert.pem".to_string(),
            key: "/nonexistent/key.pem".to_string(),
        };
        assert!(LinkAcceptor::from_config(Some(&config)).is_err());
    }

    #[tokio::test]
    async fn test_plain_accept_passes_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let mut conn = TcpStream::connect(addr).await.unwrap();
            conn.write_all(b"ping").await.unwrap();
        });

        let (stream, _) = listener.accept().await.unwrap();
        let mut link = LinkAcceptor::plain().accept(stream).await.unwrap();
        let mut buf = [0u8; 4];
        link.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        client.await.unwrap();
    }
}
