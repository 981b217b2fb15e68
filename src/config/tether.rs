//! Tether configuration types
//!
//! A tether is a named pool of transport links to one remote agent.

use serde::{Deserialize, Serialize};

/// Security of the transport link
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionType {
    /// TLS over TCP
    #[default]
    #[serde(rename = "tls")]
    Tls,
    /// Plain TCP
    #[serde(rename = "plain", alias = "tcp")]
    Plain,
}

/// Default keepalive seconds
fn default_keepalive_secs() -> u64 {
    20
}

/// Default keepalive interval
fn default_keepalive_interval() -> u64 {
    8
}

/// Default connect timeout in seconds
fn default_connect_timeout() -> u64 {
    10
}

/// TCP socket configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TcpConfig {
    /// Enable TCP_NODELAY
    #[serde(default)]
    pub nodelay: bool,

    /// TCP keepalive timeout in seconds
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// TCP keepalive interval in seconds
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            nodelay: true,
            keepalive_secs: default_keepalive_secs(),
            keepalive_interval: default_keepalive_interval(),
        }
    }
}

/// Client side TLS configuration
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct TlsConfig {
    /// Name used for certificate verification (defaults to the tether host)
    #[serde(default)]
    pub hostname: Option<String>,

    /// Extra trusted root certificate (PEM)
    #[serde(default)]
    pub trusted_root: Option<String>,

    /// Accept any server certificate
    #[serde(default)]
    pub skip_verify: bool,
}

/// Configuration of one tether
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TetherConfig {
    /// Tether name, referenced by the routing table
    pub name: String,

    /// Remote agent host
    pub host: String,

    /// Remote agent port
    pub port: u16,

    /// Link security
    #[serde(default)]
    pub connection_type: ConnectionType,

    /// Secret proving our client id to the remote agent
    pub secret: String,

    /// Links in this tether's pool (agent default when absent)
    #[serde(default)]
    pub pool_size: Option<usize>,

    /// Upstream proxy URL (`http://`, `socks5://`)
    #[serde(default)]
    pub proxy: Option<String>,

    /// TLS options
    #[serde(default)]
    pub tls: TlsConfig,

    /// Socket options
    #[serde(default)]
    pub tcp: TcpConfig,

    /// Dial timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

impl TetherConfig {
    /// `host:port` of the remote agent
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Pool size after applying the agent default
    pub fn effective_pool_size(&self, default: usize) -> usize {
        self.pool_size.unwrap_or(default)
    }

    /// Validate the tether configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("tether name must not be empty".to_string());
        }
        if self.name.eq_ignore_ascii_case("local") || self.name == "*" {
            return Err(format!("tether name '{}' is reserved", self.name));
        }
        if self.host.trim().is_empty() {
            return Err(format!("tether '{}': host must not be empty", self.name));
        }
        if self.port == 0 {
            return Err(format!("tether '{}': port must not be 0", self.name));
        }
        if self.pool_size == Some(0) {
            return Err(format!("tether '{}': pool_size must be greater than 0", self.name));
        }
        if let Some(proxy) = &self.proxy {
            let url = url::Url::parse(proxy)
                .map_err(|e| format!("tether '{}': invalid proxy '{}': {}", self.name, proxy, e))?;
            match url.scheme() {
                "http" | "socks5" => {}
                other => {
                    return Err(format!(
                        "tether '{}': unsupported proxy scheme '{}'",
                        self.name, other
                    ))
                }
            }
        }
        Ok(())
    }
}
