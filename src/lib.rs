//! # Tetherd - Peer-to-peer Tunnel Agent
//!
//! Tetherd keeps pools of outbound "tether" links to remote agents and runs
//! local listeners (SOCKS5, raw TCP relay) whose connections are forwarded
//! through those tethers. Many logical streams share a small number of
//! physical links through a framed multiplexing protocol.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tetherd::{load_config, Router};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config("tetherd.toml")?;
//!     let router = Router::new(&config);
//!     for tether in config.effective_tethers() {
//!         let size = tether.effective_pool_size(config.agent.pool_size);
//!         router.connect_tether(&tether, size).await?;
//!     }
//!     for listener in config.listeners.clone() {
//!         router.serve(listener).await?;
//!     }
//!     tokio::signal::ctrl_c().await?;
//!     router.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! client -> Listener -> Router -> Routing Table
//!                          |
//!                          +-> local target
//!                          +-> Tether Pool -> Multiplex Session -> Transport Link -> remote agent
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod helper;
pub mod listener;
pub mod mux;
pub mod pool;
pub mod protocol;
pub mod router;
pub mod routing;
pub mod transport;

// Re-export commonly used items
pub use config::{load_config, Config};
pub use error::{Socks5Error, TetherError};
pub use mux::{LogicalStream, Session};
pub use pool::TetherPool;
pub use router::Router;
pub use routing::{Destination, RoutingTable};

/// Version of the Tetherd library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_name() {
        assert_eq!(NAME, "tetherd");
    }
}
