//! Tether pool configuration
//!
//! Defines reconnection and selection behaviour shared by all tether pools.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default health check interval in seconds
fn default_health_check_interval() -> u64 {
    30
}

/// Default first reconnect delay in milliseconds
fn default_reconnect_initial_delay_ms() -> u64 {
    500
}

/// Default reconnect delay cap in seconds
fn default_reconnect_max_delay() -> u64 {
    30
}

/// Default reconnect budget in seconds
fn default_reconnect_max_elapsed() -> u64 {
    300
}

/// Default merged accept queue capacity
fn default_accept_queue() -> usize {
    16
}

/// How an outbound stream picks its session
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Rotate across live sessions
    #[default]
    RoundRobin,
    /// Pick the session that was used longest ago
    LeastRecentlyUsed,
}

/// Tether pool configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PoolConfig {
    /// Maintenance interval in seconds
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u64,

    /// First reconnect delay in milliseconds
    #[serde(default = "default_reconnect_initial_delay_ms")]
    pub reconnect_initial_delay_ms: u64,

    /// Upper bound of the reconnect delay in seconds
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay: u64,

    /// A replacement attempt gives up after this many seconds
    #[serde(default = "default_reconnect_max_elapsed")]
    pub reconnect_max_elapsed: u64,

    /// Session selection policy
    #[serde(default)]
    pub selection: SelectionPolicy,

    /// Capacity of the merged inbound stream queue
    #[serde(default = "default_accept_queue")]
    pub accept_queue: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            health_check_interval: default_health_check_interval(),
            reconnect_initial_delay_ms: default_reconnect_initial_delay_ms(),
            reconnect_max_delay: default_reconnect_max_delay(),
            reconnect_max_elapsed: default_reconnect_max_elapsed(),
            selection: SelectionPolicy::default(),
            accept_queue: default_accept_queue(),
        }
    }
}

impl PoolConfig {
    /// Backoff policy for reconnecting a dead link
    pub fn reconnect_backoff(&self) -> backoff::ExponentialBackoff {
        let initial = Duration::from_millis(self.reconnect_initial_delay_ms);
        backoff::ExponentialBackoff {
            current_interval: initial,
            initial_interval: initial,
            max_interval: Duration::from_secs(self.reconnect_max_delay),
            max_elapsed_time: Some(Duration::from_secs(self.reconnect_max_elapsed)),
            ..Default::default()
        }
    }

    /// Validate the pool configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.health_check_interval == 0 {
            return Err("pool.health_check_interval must be greater than 0".to_string());
        }
        if self.accept_queue == 0 {
            return Err("pool.accept_queue must be greater than 0".to_string());
        }
        if Duration::from_millis(self.reconnect_initial_delay_ms)
            > Duration::from_secs(self.reconnect_max_delay)
        {
            return Err(
                "pool.reconnect_initial_delay_ms cannot exceed reconnect_max_delay".to_string(),
            );
        }
        Ok(())
    }
}
