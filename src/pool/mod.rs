//! Tether pool module for Tetherd
//!
//! A tether is backed by a pool of multiplex sessions to one remote agent.
//! Dialled pools keep their configured link count alive; passive pools hold
//! the sessions a remote agent opened to one of our tether listeners.

mod channel;
mod manager;
mod tether_pool;

pub use channel::PooledSession;
pub use manager::{PoolManager, PoolStats, PoolStatsSnapshot};
pub use tether_pool::{TetherDialer, TetherPool};
