//! Remote agent address with DNS caching
//!
//! Every link of a tether dials the same `host:port`. The first successful
//! resolution is cached and shared by all links; a failed dial invalidates
//! it so a reconnect picks up DNS changes.

use anyhow::{Context, Result};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Address that may have a cached resolved address
#[derive(Debug, Clone)]
pub struct AddrMaybeCached {
    addr: String,
    cached: Arc<RwLock<Option<SocketAddr>>>,
}

impl AddrMaybeCached {
    /// Create a new address without cached resolution
    pub fn new(addr: &str) -> Self {
        AddrMaybeCached {
            addr: addr.to_string(),
            cached: Arc::new(RwLock::new(None)),
        }
    }

    /// Get the original address string
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Drop the cached resolution
    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
    }

    /// Resolve the address, using cache if available
    pub async fn resolve(&self) -> Result<SocketAddr> {
        if let Some(cached) = *self.cached.read().await {
            return Ok(cached);
        }

        let addr = self.addr.clone();
        let resolved = tokio::task::spawn_blocking(move || {
            addr.to_socket_addrs()
                .with_context(|| format!("Failed to resolve address: {}", addr))?
                .next()
                .with_context(|| format!("No addresses found for: {}", addr))
        })
        .await
        .with_context(|| "DNS resolution task panicked")??;

        *self.cached.write().await = Some(resolved);
        Ok(resolved)
    }
}

impl From<SocketAddr> for AddrMaybeCached {
    fn from(addr: SocketAddr) -> Self {
        AddrMaybeCached {
            addr: addr.to_string(),
            cached: Arc::new(RwLock::new(Some(addr))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[tokio::test]
    async fn test_resolve_caches() {
        let addr = AddrMaybeCached::new("127.0.0.1:8080");
        let resolved = addr.resolve().await.unwrap();
        assert_eq!(resolved.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(resolved.port(), 8080);
        assert_eq!(*addr.cached.read().await, Some(resolved));
    }

    #[tokio::test]
    async fn test_clones_share_cache_and_invalidate() {
        let socket_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 1234);
        let addr = AddrMaybeCached::from(socket_addr);
        let clone = addr.clone();
        assert_eq!(clone.resolve().await.unwrap(), socket_addr);

        addr.invalidate().await;
        assert!(clone.cached.read().await.is_none());
    }

    #[tokio::test]
    async fn test_resolve_failure() {
        let addr = AddrMaybeCached::new("not-an-address");
        assert!(addr.resolve().await.is_err());
    }
}
