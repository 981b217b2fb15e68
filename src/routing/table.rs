//! Routing table
//!
//! Maps a key (client identity, target or `*`) to where traffic goes: out
//! to a local address, or through a named tether.

use crate::config::{AgentConfig, RoutingMode};
use crate::error::TetherError;
use crate::helper::split_host_port;
use std::collections::HashMap;

/// Wildcard key matching anything without a specific entry
pub const WILDCARD: &str = "*";

/// Mapping value that terminates traffic on this agent
pub const LOCAL: &str = "local";

/// Where a routed connection goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Dial the requested target from this agent
    Local,
    /// Forward through the named tether pool
    ViaTether(String),
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::Local => write!(f, "local"),
            Destination::ViaTether(name) => write!(f, "tether '{}'", name),
        }
    }
}

/// Immutable key to destination table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTable {
    entries: HashMap<String, Destination>,
    mode: RoutingMode,
}

impl RoutingTable {
    /// Empty table; every lookup fails with `NoRoute`
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a configuration mapping (`key -> "local" | tether`)
    pub fn from_mapping(mapping: &HashMap<String, String>) -> Self {
        let entries = mapping
            .iter()
            .map(|(key, value)| {
                let destination = if value.eq_ignore_ascii_case(LOCAL) {
                    Destination::Local
                } else {
                    Destination::ViaTether(value.clone())
                };
                (key.clone(), destination)
            })
            .collect();
        RoutingTable {
            entries,
            mode: RoutingMode::default(),
        }
    }

    /// Build from the agent section (mapping and routing mode)
    pub fn from_config(agent: &AgentConfig) -> Self {
        RoutingTable::from_mapping(&agent.mapping).with_mode(agent.routing_mode)
    }

    /// Set which key [`RoutingTable::route`] looks up
    pub fn with_mode(mut self, mode: RoutingMode) -> Self {
        self.mode = mode;
        self
    }

    /// Routing mode in effect
    pub fn mode(&self) -> RoutingMode {
        self.mode
    }

    /// Add or replace an entry
    pub fn insert(&mut self, key: impl Into<String>, destination: Destination) {
        self.entries.insert(key.into(), destination);
    }

    /// Exact match, then `*`, else `NoRoute`
    pub fn resolve(&self, key: &str) -> Result<Destination, TetherError> {
        self.entries
            .get(key)
            .or_else(|| self.entries.get(WILDCARD))
            .cloned()
            .ok_or_else(|| TetherError::NoRoute(key.to_string()))
    }

    /// Destination lookup for a `host:port` target: `host:port`, `host`, `*`
    pub fn resolve_target(&self, target: &str) -> Result<Destination, TetherError> {
        if let Some(destination) = self.entries.get(target) {
            return Ok(destination.clone());
        }
        if let Some((host, _)) = split_host_port(target) {
            if let Some(destination) = self.entries.get(&host) {
                return Ok(destination.clone());
            }
        }
        self.entries
            .get(WILDCARD)
            .cloned()
            .ok_or_else(|| TetherError::NoRoute(target.to_string()))
    }

    /// Resolve per routing mode
    ///
    /// Destination mode without a target falls back to the identity key.
    pub fn route(&self, identity: &str, target: Option<&str>) -> Result<Destination, TetherError> {
        match (self.mode, target) {
            (RoutingMode::Destination, Some(target)) => self.resolve_target(target),
            _ => self.resolve(identity),
        }
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the table has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tethers referenced by the table
    pub fn tethers(&self) -> impl Iterator<Item = &str> {
        self.entries.values().filter_map(|d| match d {
            Destination::ViaTether(name) => Some(name.as_str()),
            Destination::Local => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(pairs: &[(&str, &str)]) -> RoutingTable {
        let mapping = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RoutingTable::from_mapping(&mapping)
    }

    #[test]
    fn test_exact_then_wildcard() {
        let table = table(&[("alice", "home"), ("*", "local")]);
        assert_eq!(
            table.resolve("alice").unwrap(),
            Destination::ViaTether("home".to_string())
        );
        assert_eq!(table.resolve("bob").unwrap(), Destination::Local);
    }

    #[test]
    fn test_no_route_without_wildcard() {
        let table = table(&[("alice", "home")]);
        let err = table.resolve("bob").unwrap_err();
        assert!(matches!(err, TetherError::NoRoute(ref key) if key == "bob"));
    }

    #[test]
    fn test_local_is_case_insensitive() {
        let table = table(&[("alice", "Local"), ("bob", "LOCAL")]);
        assert_eq!(table.resolve("alice").unwrap(), Destination::Local);
        assert_eq!(table.resolve("bob").unwrap(), Destination::Local);
    }

    #[test]
    fn test_resolve_target_precedence() {
        let table = table(&[
            ("db.internal:5432", "office"),
            ("db.internal", "home"),
            ("*", "local"),
        ]);
        assert_eq!(
            table.resolve_target("db.internal:5432").unwrap(),
            Destination::ViaTether("office".to_string())
        );
        assert_eq!(
            table.resolve_target("db.internal:80").unwrap(),
            Destination::ViaTether("home".to_string())
        );
        assert_eq!(
            table.resolve_target("example.com:80").unwrap(),
            Destination::Local
        );
    }

    #[test]
    fn test_route_by_mode() {
        let identity = table(&[("alice", "home"), ("example.com", "office")]);
        assert_eq!(identity.mode(), RoutingMode::Identity);
        assert_eq!(
            identity.route("alice", Some("example.com:80")).unwrap(),
            Destination::ViaTether("home".to_string())
        );

        let destination = identity.with_mode(RoutingMode::Destination);
        assert_eq!(
            destination.route("alice", Some("example.com:80")).unwrap(),
            Destination::ViaTether("office".to_string())
        );
        assert_eq!(
            destination.route("alice", None).unwrap(),
            Destination::ViaTether("home".to_string())
        );
    }

    #[test]
    fn test_insert_replaces() {
        let mut table = RoutingTable::new();
        assert!(table.is_empty());
        table.insert("*", Destination::Local);
        table.insert("*", Destination::ViaTether("home".to_string()));
        assert_eq!(table.len(), 1);
        assert_eq!(table.tethers().collect::<Vec<_>>(), vec!["home"]);
    }
}
