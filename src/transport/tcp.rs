//! TCP transport implementation
//!
//! Plain TCP links, dialed directly or through an upstream proxy.

use super::{AddrMaybeCached, SocketOpts, StreamDyn, Transport, TransportDyn, UpstreamProxy};
use crate::config::TetherConfig;
use crate::helper::split_host_port;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;

/// TCP transport for plain connections
#[derive(Debug, Clone)]
pub struct TcpTransport {
    /// Socket options to apply to connections
    socket_opts: SocketOpts,
    /// Connection timeout
    connect_timeout: Duration,
    /// Optional upstream proxy
    proxy: Option<UpstreamProxy>,
}

impl TcpTransport {
    /// Create a new TCP transport with default options
    pub fn with_defaults() -> Self {
        TcpTransport {
            socket_opts: SocketOpts::default(),
            connect_timeout: Duration::from_secs(10),
            proxy: None,
        }
    }

    /// Set socket options
    pub fn with_socket_opts(mut self, opts: SocketOpts) -> Self {
        self.socket_opts = opts;
        self
    }

    /// Set connection timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Dial through an upstream proxy
    pub fn with_proxy(mut self, proxy: Option<UpstreamProxy>) -> Self {
        self.proxy = proxy;
        self
    }

    /// Connection timeout in use
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

#[async_trait]
impl Transport for TcpTransport {
    type Stream = TcpStream;

    fn new(config: &TetherConfig) -> Result<Self> {
        let proxy = config
            .proxy
            .as_deref()
            .map(UpstreamProxy::parse)
            .transpose()?;
        Ok(TcpTransport {
            socket_opts: SocketOpts::from_tcp_config(&config.tcp),
            connect_timeout: Duration::from_secs(config.connect_timeout),
            proxy,
        })
    }

    async fn connect(&self, addr: &AddrMaybeCached) -> Result<Self::Stream> {
        let stream = match &self.proxy {
            Some(proxy) => {
                let (host, port) = split_host_port(addr.addr())
                    .ok_or_else(|| anyhow!("Invalid address: {}", addr.addr()))?;
                proxy.connect(&host, port, self.connect_timeout).await?
            }
            None => {
                let resolved = addr.resolve().await?;
                tokio::time::timeout(self.connect_timeout, TcpStream::connect(resolved))
                    .await
                    .with_context(|| format!("Connection timeout to {}", addr.addr()))?
                    .with_context(|| format!("Failed to connect to {}", addr.addr()))?
            }
        };

        self.socket_opts.apply(&stream)?;
        tracing::debug!("TCP connection established to {}", addr.addr());

        Ok(stream)
    }
}

#[async_trait]
impl TransportDyn for TcpTransport {
    async fn connect_dyn(&self, addr: &AddrMaybeCached) -> Result<Box<dyn StreamDyn>> {
        let stream = self.connect(addr).await?;
        Ok(Box::new(stream))
    }
}
