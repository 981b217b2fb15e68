//! Transport module for Tetherd
//!
//! Dialing transport links to remote agents (plain TCP or TLS, optionally
//! through an upstream HTTP/SOCKS5 proxy) and accepting them on tether
//! listeners. A transport link is any reliable, ordered byte stream; the
//! multiplexing layer does not care which of these produced it.

mod acceptor;
mod addr;
mod proxy;
mod tcp;
#[cfg(feature = "rustls-tls")]
mod tls;

pub use acceptor::LinkAcceptor;
pub use addr::AddrMaybeCached;
pub use proxy::UpstreamProxy;
pub use tcp::TcpTransport;
#[cfg(feature = "rustls-tls")]
pub use tls::TlsTransport;

use crate::config::{ConnectionType, TcpConfig, TetherConfig};
use anyhow::Result;
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Socket options for configuring connections
#[derive(Debug, Clone)]
pub struct SocketOpts {
    /// Enable TCP_NODELAY
    pub nodelay: bool,
    /// TCP keepalive timeout
    pub keepalive_secs: Option<u64>,
    /// TCP keepalive interval
    pub keepalive_interval: Option<u64>,
}

impl Default for SocketOpts {
    fn default() -> Self {
        SocketOpts {
            nodelay: true,
            keepalive_secs: Some(20),
            keepalive_interval: Some(8),
        }
    }
}

impl SocketOpts {
    /// Options for relayed client connections (no TCP keepalive)
    pub fn for_relay() -> Self {
        SocketOpts {
            nodelay: true,
            keepalive_secs: None,
            keepalive_interval: None,
        }
    }

    /// Create socket options from TCP config
    pub fn from_tcp_config(config: &TcpConfig) -> Self {
        SocketOpts {
            nodelay: config.nodelay,
            keepalive_secs: Some(config.keepalive_secs),
            keepalive_interval: Some(config.keepalive_interval),
        }
    }

    /// Apply socket options to a TCP stream
    pub fn apply(&self, stream: &TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(self.nodelay)?;

        if let (Some(timeout), Some(interval)) = (self.keepalive_secs, self.keepalive_interval) {
            let socket = socket2::SockRef::from(stream);
            let keepalive = socket2::TcpKeepalive::new()
                .with_time(Duration::from_secs(timeout))
                .with_interval(Duration::from_secs(interval));
            socket.set_tcp_keepalive(&keepalive)?;
        }

        Ok(())
    }
}

/// Transport trait for different link types
#[async_trait]
pub trait Transport: Debug + Send + Sync + 'static {
    /// The stream type produced by this transport
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync + Debug + 'static;

    /// Create a new transport instance for a tether
    fn new(config: &TetherConfig) -> Result<Self>
    where
        Self: Sized;

    /// Connect to a remote address
    async fn connect(&self, addr: &AddrMaybeCached) -> Result<Self::Stream>;
}

/// Create the transport a tether dials with
pub fn create_transport(config: &TetherConfig) -> Result<Arc<dyn TransportDyn>> {
    match config.connection_type {
        ConnectionType::Plain => Ok(Arc::new(TcpTransport::new(config)?)),
        #[cfg(feature = "rustls-tls")]
        ConnectionType::Tls => Ok(Arc::new(TlsTransport::new(config)?)),
        #[cfg(not(feature = "rustls-tls"))]
        ConnectionType::Tls => Err(anyhow::anyhow!(
            "tether '{}' requires TLS but tetherd was built without the rustls-tls feature",
            config.name
        )),
    }
}

/// Dynamic transport trait for shared transports
#[async_trait]
pub trait TransportDyn: Debug + Send + Sync {
    /// Connect to a remote address and return a boxed stream
    async fn connect_dyn(&self, addr: &AddrMaybeCached) -> Result<Box<dyn StreamDyn>>;
}

/// Dynamic stream trait for boxed streams
pub trait StreamDyn: AsyncRead + AsyncWrite + Unpin + Send + Sync + Debug {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + Debug> StreamDyn for T {}
