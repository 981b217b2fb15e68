//! Configuration module for Tetherd
//!
//! This module provides configuration types, parsing and validation for the
//! agent. TOML is the primary format; files ending in `.json` are parsed as
//! JSON with the same schema.

mod agent;
mod listener;
mod mux;
mod pool;
mod tether;

pub use agent::{AgentConfig, RoutingMode};
pub use listener::{ListenerConfig, ListenerType, ServerTlsConfig};
pub use mux::MuxConfig;
pub use pool::{PoolConfig, SelectionPolicy};
pub use tether::{ConnectionType, TcpConfig, TetherConfig, TlsConfig};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// Agent identity and routing
    pub agent: AgentConfig,

    /// Multiplex session tuning
    #[serde(default)]
    pub mux: MuxConfig,

    /// Tether pool behaviour
    #[serde(default)]
    pub pool: PoolConfig,

    /// Outbound tethers
    #[serde(default)]
    pub tethers: Vec<TetherConfig>,

    /// Local listeners
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
}

impl Config {
    /// Validate every section and the references between them
    pub fn validate(&self) -> Result<(), String> {
        self.agent.validate()?;
        self.mux.validate()?;
        self.pool.validate()?;

        let mut names = HashSet::new();
        for tether in &self.tethers {
            tether.validate()?;
            if !names.insert(tether.name.as_str()) {
                return Err(format!("duplicate tether name '{}'", tether.name));
            }
        }

        // Peers accepted by tether listeners form passive pools under their client id
        for listener in &self.listeners {
            if listener.listener_type == ListenerType::Tether {
                names.extend(listener.authorized_clients.keys().map(String::as_str));
            }
        }

        let mut ports = HashSet::new();
        for listener in &self.listeners {
            listener.validate()?;
            if !ports.insert(listener.port) {
                return Err(format!("duplicate listener port {}", listener.port));
            }
            if let Some(tether) = &listener.tether {
                if !names.contains(tether.as_str()) {
                    return Err(format!(
                        "listener '{}' references unknown tether '{}'",
                        listener.label(),
                        tether
                    ));
                }
            }
        }
        Ok(())
    }

    /// Tethers with the agent-level proxy applied where they have none
    pub fn effective_tethers(&self) -> Vec<TetherConfig> {
        self.tethers
            .iter()
            .cloned()
            .map(|mut t| {
                if t.proxy.is_none() {
                    t.proxy = self.agent.proxy.clone();
                }
                t
            })
            .collect()
    }
}

/// Load configuration from a TOML or JSON file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_json_config(&content)?,
        _ => parse_config(&content)?,
    };
    config
        .validate()
        .map_err(|e| anyhow!("Invalid configuration in {:?}: {}", path, e))?;
    Ok(config)
}

/// Parse configuration from a TOML string
pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).with_context(|| "Failed to parse configuration")
}

/// Parse configuration from a JSON string
pub fn parse_json_config(content: &str) -> Result<Config> {
    serde_json::from_str(content).with_context(|| "Failed to parse JSON configuration")
}

/// A starter configuration with freshly generated secrets
pub fn template(client_id: &str) -> Config {
    let mut socks_clients = HashMap::new();
    socks_clients.insert(
        "socks5User".to_string(),
        crate::helper::random_secret(32),
    );
    let mut relay_clients = HashMap::new();
    relay_clients.insert(
        "firstClient".to_string(),
        crate::helper::random_secret(32),
    );

    let mut mapping = HashMap::new();
    mapping.insert("*".to_string(), "local".to_string());

    Config {
        agent: AgentConfig {
            client_id: client_id.to_string(),
            pool_size: 10,
            routing_mode: RoutingMode::Identity,
            mapping,
            proxy: None,
        },
        mux: MuxConfig::default(),
        pool: PoolConfig::default(),
        tethers: vec![TetherConfig {
            name: "remote".to_string(),
            host: "remote.example.com".to_string(),
            port: 10201,
            connection_type: ConnectionType::Tls,
            secret: crate::helper::random_secret(32),
            pool_size: None,
            proxy: None,
            tls: TlsConfig::default(),
            tcp: TcpConfig::default(),
            connect_timeout: 10,
        }],
        listeners: vec![
            ListenerConfig {
                name: Some("socks".to_string()),
                port: 10101,
                listener_type: ListenerType::Socks5,
                local_only: true,
                use_authentication: true,
                authorized_clients: socks_clients,
                tether: None,
                target: None,
                identity: None,
                tls: None,
            },
            ListenerConfig {
                name: Some("relay".to_string()),
                port: 10102,
                listener_type: ListenerType::RelayTcp,
                local_only: false,
                use_authentication: true,
                authorized_clients: relay_clients,
                tether: Some("remote".to_string()),
                target: Some("127.0.0.1:22".to_string()),
                identity: None,
                tls: None,
            },
        ],
    }
}

/// Write a template configuration, choosing the format by extension
pub fn write_template<P: AsRef<Path>>(path: P, client_id: &str) -> Result<()> {
    let path = path.as_ref();
    let config = template(client_id);
    let content = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::to_string_pretty(&config)
            .with_context(|| "Failed to serialize template")?,
        _ => toml::to_string_pretty(&config).with_context(|| "Failed to serialize template")?,
    };
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write config file: {:?}", path))?;
    Ok(())
}
