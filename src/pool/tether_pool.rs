//! Tether pool implementation
//!
//! A tether pool makes N transport links to one remote agent behave as one
//! logical tunnel. Outbound streams are spread across the live sessions,
//! inbound streams from every session are merged into one queue, and dead
//! sessions are replaced in the background.

use super::channel::PooledSession;
use super::manager::{PoolManager, PoolStats, PoolStatsSnapshot};
use crate::config::{MuxConfig, PoolConfig, SelectionPolicy, TetherConfig};
use crate::error::TetherError;
use crate::mux::{lock, LogicalStream, Role, Session};
use crate::protocol::handshake;
use crate::transport::{create_transport, AddrMaybeCached, TransportDyn};
use anyhow::{Context, Result};
use futures::future::join_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Everything needed to establish one more link of a tether
#[derive(Debug, Clone)]
pub struct TetherDialer {
    transport: Arc<dyn TransportDyn>,
    addr: AddrMaybeCached,
    client_id: String,
    secret: String,
}

impl TetherDialer {
    /// Create a dialer from its parts
    pub fn new(
        transport: Arc<dyn TransportDyn>,
        addr: AddrMaybeCached,
        client_id: &str,
        secret: &str,
    ) -> Self {
        TetherDialer {
            transport,
            addr,
            client_id: client_id.to_string(),
            secret: secret.to_string(),
        }
    }

    /// Create a dialer for a configured tether
    pub fn from_config(config: &TetherConfig, client_id: &str) -> Result<Self> {
        let transport = create_transport(config)
            .with_context(|| format!("Failed to create transport for tether '{}'", config.name))?;
        Ok(TetherDialer::new(
            transport,
            AddrMaybeCached::new(&config.addr()),
            client_id,
            &config.secret,
        ))
    }

    /// Remote address
    pub fn addr(&self) -> &str {
        self.addr.addr()
    }

    /// Dial, authenticate and start a client-role session
    pub async fn dial(&self, mux: &MuxConfig) -> Result<Session> {
        let mut link = match self.transport.connect_dyn(&self.addr).await {
            Ok(link) => link,
            Err(e) => {
                self.addr.invalidate().await;
                return Err(e);
            }
        };

        tokio::time::timeout(
            mux.handshake_timeout(),
            handshake::connect(&mut link, &self.client_id, &self.secret),
        )
        .await
        .map_err(|_| TetherError::Timeout(format!("handshake with {}", self.addr.addr())))??;

        Ok(Session::new(link, Role::Client, mux))
    }
}

/// Pool of multiplex sessions to one remote agent
pub struct TetherPool {
    name: String,
    /// None for passive pools fed by a tether listener
    dialer: Option<TetherDialer>,
    configured_size: usize,
    mux: MuxConfig,
    manager: PoolManager,
    sessions: Mutex<Vec<PooledSession>>,
    cursor: AtomicUsize,
    /// Replacement dials in flight
    pending: AtomicUsize,
    accept_tx: mpsc::Sender<LogicalStream>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<LogicalStream>>,
}

impl std::fmt::Debug for TetherPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TetherPool")
            .field("name", &self.name)
            .field("passive", &self.is_passive())
            .field("configured_size", &self.configured_size)
            .field("alive", &self.alive_count())
            .finish()
    }
}

impl TetherPool {
    fn build(
        name: &str,
        dialer: Option<TetherDialer>,
        configured_size: usize,
        mux: MuxConfig,
        config: PoolConfig,
    ) -> Self {
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_queue.max(1));
        TetherPool {
            name: name.to_string(),
            dialer,
            configured_size,
            mux,
            manager: PoolManager::new(config, Arc::new(PoolStats::new())),
            sessions: Mutex::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            accept_tx,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
        }
    }

    /// Establish `pool_size` links concurrently
    ///
    /// Succeeds as soon as at least one link came up; missing slots are
    /// refilled in the background. Fails with `DialFailure` when every
    /// attempt failed.
    pub async fn connect(
        name: &str,
        dialer: TetherDialer,
        pool_size: usize,
        mux: MuxConfig,
        config: PoolConfig,
    ) -> Result<Arc<TetherPool>, TetherError> {
        let pool = Arc::new(TetherPool::build(name, Some(dialer), pool_size, mux, config));
        info!(
            "Connecting tether '{}' to {} with {} links",
            name,
            pool.remote_addr(),
            pool_size
        );

        let results = join_all((0..pool_size).map(|_| pool.dial_once())).await;

        let mut failed = 0;
        let mut last_error = None;
        for result in results {
            match result {
                Ok(session) => pool.register(session),
                Err(e) => {
                    failed += 1;
                    last_error = Some(e);
                }
            }
        }

        if pool.alive_count() == 0 {
            pool.shutdown();
            let reason = last_error
                .map(|e| format!("{:#}", e))
                .unwrap_or_else(|| "pool size is 0".to_string());
            return Err(TetherError::DialFailure(format!("tether '{}': {}", name, reason)));
        }

        if failed > 0 {
            warn!(
                "Tether '{}' up with {}/{} links, refilling in background",
                name,
                pool_size - failed,
                pool_size
            );
            for _ in 0..failed {
                pool.schedule_replacement();
            }
        } else {
            info!("Tether '{}' up with {} links", name, pool_size);
        }

        pool.spawn_maintenance();
        Ok(pool)
    }

    /// Pool for links accepted from a remote agent
    ///
    /// Sessions are added with [`TetherPool::add_session`]; a passive pool
    /// never redials.
    pub fn passive(name: &str, mux: MuxConfig, config: PoolConfig) -> Arc<TetherPool> {
        Arc::new(TetherPool::build(name, None, 0, mux, config))
    }

    /// Register an externally established session
    pub fn add_session(self: &Arc<Self>, session: Session) {
        self.register(session);
    }

    /// Open a stream on a live session
    ///
    /// Fails with `PoolExhausted` only if no session is alive.
    pub fn open_stream(self: &Arc<Self>) -> Result<LogicalStream, TetherError> {
        loop {
            let session = self
                .select()
                .ok_or_else(|| TetherError::PoolExhausted(self.name.clone()))?;
            match session.open() {
                Ok(stream) => {
                    self.manager.stats().record_opened();
                    debug!(tether = %self.name, stream_id = stream.id(), "Opened stream");
                    return Ok(stream);
                }
                // Died between selection and open; its pump schedules the replacement
                Err(TetherError::LinkDead) => {
                    self.remove(&session);
                }
                // Out of stream ids: still serves inbound streams, never opens again
                Err(TetherError::ProtocolViolation(reason)) => {
                    warn!(tether = %self.name, "Retiring session from selection: {}", reason);
                    if self.remove(&session) {
                        self.schedule_replacement();
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Next stream opened by the remote agent on any session
    ///
    /// Fails with `SessionClosed` once the pool is shut down.
    pub async fn accept_stream(&self) -> Result<LogicalStream, TetherError> {
        let mut rx = self.accept_rx.lock().await;
        tokio::select! {
            stream = rx.recv() => stream.ok_or(TetherError::SessionClosed),
            _ = self.manager.wait_shutdown() => Err(TetherError::SessionClosed),
        }
    }

    /// Close every session and stop background tasks
    pub fn shutdown(&self) {
        if self.manager.is_shutdown() {
            return;
        }
        self.manager.shutdown();
        let sessions: Vec<PooledSession> = lock(&self.sessions).drain(..).collect();
        for pooled in &sessions {
            pooled.session.close();
        }
        self.manager.stats().set_alive_count(0);
        info!("Tether '{}' shut down ({} sessions closed)", self.name, sessions.len());
    }

    /// Tether name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True for pools fed by a tether listener
    pub fn is_passive(&self) -> bool {
        self.dialer.is_none()
    }

    /// True once [`TetherPool::shutdown`] was called
    pub fn is_shutdown(&self) -> bool {
        self.manager.is_shutdown()
    }

    /// Sessions currently alive
    pub fn alive_count(&self) -> usize {
        lock(&self.sessions)
            .iter()
            .filter(|s| s.is_alive())
            .count()
    }

    /// Number of links the pool tries to keep
    pub fn configured_size(&self) -> usize {
        self.configured_size
    }

    /// Statistics snapshot
    pub fn stats(&self) -> PoolStatsSnapshot {
        self.manager.stats().snapshot()
    }

    fn remote_addr(&self) -> &str {
        self.dialer.as_ref().map(|d| d.addr()).unwrap_or("-")
    }

    async fn dial_once(&self) -> Result<Session> {
        let dialer = self
            .dialer
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("passive pool '{}' cannot dial", self.name))?;
        match dialer.dial(&self.mux).await {
            Ok(session) => Ok(session),
            Err(e) => {
                self.manager.stats().record_dial_failure();
                warn!("Tether '{}' failed to connect to {}: {:#}", self.name, dialer.addr(), e);
                Err(e)
            }
        }
    }

    fn register(self: &Arc<Self>, session: Session) {
        if self.manager.is_shutdown() {
            session.close();
            return;
        }
        {
            let mut sessions = lock(&self.sessions);
            sessions.push(PooledSession::new(session.clone()));
            self.manager.stats().set_alive_count(sessions.len());
        }
        self.manager.stats().record_created();
        debug!(tether = %self.name, peer = ?session.peer_identity(), "Session registered");

        let pool = self.clone();
        tokio::spawn(async move {
            pool.pump(session).await;
        });
    }

    /// Forward the session's inbound streams into the merged queue until it dies
    async fn pump(self: Arc<Self>, session: Session) {
        loop {
            let accepted = tokio::select! {
                r = session.accept_next() => r,
                _ = self.manager.wait_shutdown() => return,
            };
            let stream = match accepted {
                Ok(stream) => stream,
                Err(_) => break,
            };
            self.manager.stats().record_accepted();
            tokio::select! {
                r = self.accept_tx.send(stream) => {
                    if r.is_err() {
                        break;
                    }
                }
                _ = session.closed() => break,
                _ = self.manager.wait_shutdown() => return,
            }
        }

        let selectable = self.remove(&session);
        self.manager.stats().record_lost();
        // A retired session was already replaced when it left the selection set
        if self.manager.is_shutdown() || !selectable {
            return;
        }
        warn!(
            "Tether '{}' lost a session, {} still alive",
            self.name,
            self.alive_count()
        );
        self.schedule_replacement();
    }

    fn select(&self) -> Option<Session> {
        let mut sessions = lock(&self.sessions);
        let alive: Vec<usize> = sessions
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_alive())
            .map(|(i, _)| i)
            .collect();
        if alive.is_empty() {
            return None;
        }

        let index = match self.manager.config().selection {
            SelectionPolicy::RoundRobin => {
                alive[self.cursor.fetch_add(1, Ordering::Relaxed) % alive.len()]
            }
            SelectionPolicy::LeastRecentlyUsed => alive
                .iter()
                .copied()
                .min_by_key(|&i| sessions[i].last_used)
                .unwrap_or(alive[0]),
        };
        let pooled = &mut sessions[index];
        pooled.touch();
        Some(pooled.session.clone())
    }

    /// Drop `session` from the selection set; false if it was not in it
    fn remove(&self, session: &Session) -> bool {
        let mut sessions = lock(&self.sessions);
        let before = sessions.len();
        sessions.retain(|s| !s.session.same_as(session));
        self.manager.stats().set_alive_count(sessions.len());
        sessions.len() != before
    }

    /// Dial one replacement link with exponential backoff
    fn schedule_replacement(self: &Arc<Self>) {
        if self.dialer.is_none() || self.manager.is_shutdown() {
            return;
        }
        self.pending.fetch_add(1, Ordering::SeqCst);

        let pool = self.clone();
        tokio::spawn(async move {
            let policy = pool.manager.config().reconnect_backoff();
            let attempt = backoff::future::retry(policy, || {
                let pool = pool.clone();
                async move {
                    pool.dial_once()
                        .await
                        .map_err(|e| match e.downcast_ref::<TetherError>() {
                            Some(TetherError::AuthFailure(_)) => backoff::Error::permanent(e),
                            _ => backoff::Error::transient(e),
                        })
                }
            });
            let result = tokio::select! {
                r = attempt => Some(r),
                _ = pool.manager.wait_shutdown() => None,
            };
            pool.pending.fetch_sub(1, Ordering::SeqCst);

            match result {
                Some(Ok(session)) => {
                    pool.register(session);
                    info!(
                        "Tether '{}' reconnected, {}/{} links alive",
                        pool.name,
                        pool.alive_count(),
                        pool.configured_size
                    );
                }
                Some(Err(e)) => warn!(
                    "Tether '{}' gave up reconnecting for now: {:#}",
                    pool.name, e
                ),
                None => {}
            }
        });
    }

    fn spawn_maintenance(self: &Arc<Self>) {
        let pool = Arc::downgrade(self);
        let interval = self.manager.health_check_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else {
                    return;
                };
                if pool.manager.is_shutdown() {
                    return;
                }
                pool.top_up();
                pool.manager.log_health(&pool.name);
            }
        });
    }

    /// Restore the configured link count if replacements gave up
    fn top_up(self: &Arc<Self>) {
        let current = self.alive_count() + self.pending.load(Ordering::SeqCst);
        if current >= self.configured_size {
            return;
        }
        let missing = self.configured_size - current;
        debug!(tether = %self.name, missing, "Topping up pool");
        for _ in 0..missing {
            self.schedule_replacement();
        }
    }
}
