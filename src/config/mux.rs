//! Multiplex session configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_max_frame_payload() -> u32 {
    65535
}

fn default_keepalive_interval() -> u64 {
    15
}

fn default_keepalive_timeout() -> u64 {
    10
}

fn default_accept_backlog() -> usize {
    64
}

fn default_handshake_timeout() -> u64 {
    10
}

/// Multiplex session tuning
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MuxConfig {
    /// Largest payload accepted in one frame
    #[serde(default = "default_max_frame_payload")]
    pub max_frame_payload: u32,

    /// Seconds of inbound silence before a PING is sent
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: u64,

    /// Seconds to wait for any frame after a PING
    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout: u64,

    /// Inbound streams waiting for `accept_next`
    #[serde(default = "default_accept_backlog")]
    pub accept_backlog: usize,

    /// Seconds allowed for the link handshake
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: u64,
}

impl Default for MuxConfig {
    fn default() -> Self {
        MuxConfig {
            max_frame_payload: default_max_frame_payload(),
            keepalive_interval: default_keepalive_interval(),
            keepalive_timeout: default_keepalive_timeout(),
            accept_backlog: default_accept_backlog(),
            handshake_timeout: default_handshake_timeout(),
        }
    }
}

impl MuxConfig {
    /// Keep-alive idle threshold
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval)
    }

    /// Keep-alive answer deadline
    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.keepalive_timeout)
    }

    /// Handshake deadline
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout)
    }

    /// Validate the mux configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_frame_payload < 1024 {
            return Err("mux.max_frame_payload must be at least 1024".to_string());
        }
        if self.keepalive_interval == 0 || self.keepalive_timeout == 0 {
            return Err("mux keep-alive interval and timeout must be greater than 0".to_string());
        }
        if self.accept_backlog == 0 {
            return Err("mux.accept_backlog must be greater than 0".to_string());
        }
        Ok(())
    }
}
