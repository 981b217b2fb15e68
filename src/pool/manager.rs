//! Pool manager for health monitoring and maintenance
//!
//! Holds the statistics and shutdown state shared by a pool's background
//! tasks (session pumps, replacements and the maintenance loop).

use crate::config::PoolConfig;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Statistics for a tether pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total sessions established
    pub total_created: AtomicUsize,
    /// Sessions currently alive
    pub alive_count: AtomicUsize,
    /// Sessions lost to link death
    pub total_lost: AtomicUsize,
    /// Failed dial or handshake attempts
    pub dial_failures: AtomicUsize,
    /// Streams opened through the pool
    pub streams_opened: AtomicUsize,
    /// Streams accepted from the peer
    pub streams_accepted: AtomicUsize,
}

impl PoolStats {
    /// Create new pool stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a session creation
    pub fn record_created(&self) {
        self.total_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a session loss
    pub fn record_lost(&self) {
        self.total_lost.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed dial
    pub fn record_dial_failure(&self) {
        self.dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an outbound stream
    pub fn record_opened(&self) {
        self.streams_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an inbound stream
    pub fn record_accepted(&self) {
        self.streams_accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Update alive count
    pub fn set_alive_count(&self, count: usize) {
        self.alive_count.store(count, Ordering::Relaxed);
    }

    /// Get current stats snapshot
    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            total_created: self.total_created.load(Ordering::Relaxed),
            alive_count: self.alive_count.load(Ordering::Relaxed),
            total_lost: self.total_lost.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            streams_opened: self.streams_opened.load(Ordering::Relaxed),
            streams_accepted: self.streams_accepted.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of pool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatsSnapshot {
    pub total_created: usize,
    pub alive_count: usize,
    pub total_lost: usize,
    pub dial_failures: usize,
    pub streams_opened: usize,
    pub streams_accepted: usize,
}

/// Pool manager for background maintenance
#[derive(Debug)]
pub struct PoolManager {
    /// Configuration
    config: PoolConfig,
    /// Statistics
    stats: Arc<PoolStats>,
    /// Cancelled on shutdown; every background task selects on it
    shutdown: CancellationToken,
}

impl PoolManager {
    /// Create a new pool manager
    pub fn new(config: PoolConfig, stats: Arc<PoolStats>) -> Self {
        PoolManager {
            config,
            stats,
            shutdown: CancellationToken::new(),
        }
    }

    /// Get pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get pool statistics
    pub fn stats(&self) -> &Arc<PoolStats> {
        &self.stats
    }

    /// Signal shutdown
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Check if shutdown has been requested
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Get the health check interval
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.config.health_check_interval)
    }

    /// Wait for shutdown signal
    pub async fn wait_shutdown(&self) {
        self.shutdown.cancelled().await;
    }

    /// Log pool health status
    pub fn log_health(&self, name: &str) {
        let stats = self.stats.snapshot();
        debug!(
            tether = %name,
            "Pool health: alive={}, created={}, lost={}, dial_failures={}, opened={}, accepted={}",
            stats.alive_count,
            stats.total_created,
            stats.total_lost,
            stats.dial_failures,
            stats.streams_opened,
            stats.streams_accepted
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_stats_new() {
        let stats = PoolStats::new();
        let snapshot = stats.snapshot();

        assert_eq!(snapshot.total_created, 0);
        assert_eq!(snapshot.alive_count, 0);
        assert_eq!(snapshot.streams_opened, 0);
    }

    #[test]
    fn test_pool_stats_counters() {
        let stats = PoolStats::new();
        stats.record_created();
        stats.record_created();
        stats.record_lost();
        stats.record_dial_failure();
        stats.record_opened();
        stats.record_accepted();
        stats.set_alive_count(1);

        assert_eq!(
            stats.snapshot(),
            PoolStatsSnapshot {
                total_created: 2,
                alive_count: 1,
                total_lost: 1,
                dial_failures: 1,
                streams_opened: 1,
                streams_accepted: 1,
            }
        );
    }

    #[test]
    fn test_pool_manager_new() {
        let config = PoolConfig::default();
        let stats = Arc::new(PoolStats::new());
        let manager = PoolManager::new(config.clone(), stats);

        assert_eq!(
            manager.health_check_interval(),
            Duration::from_secs(config.health_check_interval)
        );
    }

    #[tokio::test]
    async fn test_pool_manager_shutdown() {
        let manager = PoolManager::new(PoolConfig::default(), Arc::new(PoolStats::new()));

        assert!(!manager.is_shutdown());
        manager.shutdown();
        assert!(manager.is_shutdown());
        manager.wait_shutdown().await;
    }
}
