//! Listener configuration types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Listener mode
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum ListenerType {
    /// SOCKS5 proxy (CONNECT only)
    #[serde(rename = "socks5", alias = "Socks5")]
    Socks5,
    /// Raw TCP relay to a fixed target
    #[serde(rename = "relay_tcp", alias = "relayTcp")]
    RelayTcp,
    /// Accepts transport links from remote agents
    #[serde(rename = "tether")]
    Tether,
}

impl std::fmt::Display for ListenerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerType::Socks5 => write!(f, "socks5"),
            ListenerType::RelayTcp => write!(f, "relay_tcp"),
            ListenerType::Tether => write!(f, "tether"),
        }
    }
}

fn default_local_only() -> bool {
    true
}

/// Server side TLS material for tether listeners
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerTlsConfig {
    /// Certificate chain (PEM)
    pub cert: String,
    /// Private key (PEM)
    pub key: String,
}

/// Configuration of one listener
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ListenerConfig {
    /// Optional display name
    #[serde(default)]
    pub name: Option<String>,

    /// Local port
    pub port: u16,

    /// Listener mode
    #[serde(rename = "type")]
    pub listener_type: ListenerType,

    /// Bind 127.0.0.1 instead of 0.0.0.0
    #[serde(default = "default_local_only")]
    pub local_only: bool,

    /// Require username/password from clients
    #[serde(default)]
    pub use_authentication: bool,

    /// Credential map: name -> secret
    #[serde(default)]
    pub authorized_clients: HashMap<String, String>,

    /// Fixed tether for relay listeners
    #[serde(default)]
    pub tether: Option<String>,

    /// `host:port` the far end of a relay connects to
    #[serde(default)]
    pub target: Option<String>,

    /// Routing key for relay listeners without a fixed tether
    #[serde(default)]
    pub identity: Option<String>,

    /// TLS material for tether listeners
    #[serde(default)]
    pub tls: Option<ServerTlsConfig>,
}

impl ListenerConfig {
    /// Socket address to bind
    pub fn bind_addr(&self) -> SocketAddr {
        let ip = if self.local_only {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        };
        SocketAddr::new(ip, self.port)
    }

    /// Name used in log lines and as the relay identity fallback
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("{}:{}", self.listener_type, self.port),
        }
    }

    /// Routing key for connections that did not authenticate
    pub fn routing_identity(&self) -> String {
        self.identity.clone().unwrap_or_else(|| self.label())
    }

    /// Validate the listener configuration
    pub fn validate(&self) -> Result<(), String> {
        let label = self.label();
        if self.use_authentication && self.authorized_clients.is_empty() {
            return Err(format!(
                "listener '{}': use_authentication requires authorized_clients",
                label
            ));
        }
        match self.listener_type {
            ListenerType::RelayTcp => {
                let target = self
                    .target
                    .as_deref()
                    .ok_or_else(|| format!("listener '{}': relay_tcp requires target", label))?;
                if crate::helper::split_host_port(target).is_none() {
                    return Err(format!(
                        "listener '{}': target '{}' is not host:port",
                        label, target
                    ));
                }
            }
            ListenerType::Tether => {
                if self.authorized_clients.is_empty() {
                    return Err(format!(
                        "listener '{}': tether listener requires authorized_clients",
                        label
                    ));
                }
            }
            ListenerType::Socks5 => {}
        }
        if self.tls.is_some() && self.listener_type != ListenerType::Tether {
            return Err(format!(
                "listener '{}': tls is only supported on tether listeners",
                label
            ));
        }
        Ok(())
    }
}
