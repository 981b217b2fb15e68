//! Agent-wide configuration
//!
//! Identity, default pool size and the routing table source.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default number of transport links per tether
fn default_pool_size() -> usize {
    10
}

/// Default mapping routes everything to the local network
fn default_mapping() -> HashMap<String, String> {
    let mut mapping = HashMap::new();
    mapping.insert("*".to_string(), "local".to_string());
    mapping
}

/// Which key the routing table is consulted with
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    /// Key is the authenticated client identity
    #[default]
    Identity,
    /// Key is the requested target (`host:port`, then `host`)
    Destination,
}

/// Agent configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AgentConfig {
    /// Identity presented to remote agents by our tethers
    pub client_id: String,

    /// Links per tether unless a tether overrides it
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Routing key selection
    #[serde(default)]
    pub routing_mode: RoutingMode,

    /// Routing table: key -> "local" | tether name
    #[serde(default = "default_mapping")]
    pub mapping: HashMap<String, String>,

    /// Upstream proxy for tethers that do not set their own
    #[serde(default)]
    pub proxy: Option<String>,
}

impl AgentConfig {
    /// Validate the agent configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.client_id.trim().is_empty() {
            return Err("agent.client_id must not be empty".to_string());
        }
        if self.pool_size == 0 {
            return Err("agent.pool_size must be greater than 0".to_string());
        }
        if self.mapping.keys().any(|k| k.is_empty()) {
            return Err("agent.mapping contains an empty key".to_string());
        }
        if let Some((key, _)) = self.mapping.iter().find(|(_, v)| v.trim().is_empty()) {
            return Err(format!("agent.mapping entry '{}' has an empty destination", key));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> AgentConfig {
        AgentConfig {
            client_id: "laptop".to_string(),
            pool_size: default_pool_size(),
            routing_mode: RoutingMode::default(),
            mapping: default_mapping(),
            proxy: None,
        }
    }

    #[test]
    fn test_defaults() {
        let config = agent();
        assert_eq!(config.pool_size, 10);
        assert_eq!(config.routing_mode, RoutingMode::Identity);
        assert_eq!(config.mapping.get("*").map(String::as_str), Some("local"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_identity() {
        let config = AgentConfig {
            client_id: "  ".to_string(),
            ..agent()
        };
        assert!(config.validate().unwrap_err().contains("client_id"));
    }

    #[test]
    fn test_validate_rejects_zero_pool() {
        let config = AgentConfig {
            pool_size: 0,
            ..agent()
        };
        assert!(config.validate().unwrap_err().contains("pool_size"));
    }

    #[test]
    fn test_validate_rejects_empty_destination() {
        let mut config = agent();
        config.mapping.insert("alice".to_string(), String::new());
        assert!(config.validate().unwrap_err().contains("alice"));
    }

    #[test]
    fn test_routing_mode_serde() {
        #[derive(Deserialize)]
        struct Wrapper {
            mode: RoutingMode,
        }
        let w: Wrapper = toml::from_str("mode = \"destination\"").unwrap();
        assert_eq!(w.mode, RoutingMode::Destination);
    }
}
