//! Router
//!
//! Owns every tether pool and listener of the agent. Connections accepted
//! by listeners are resolved through the routing table and connected either
//! to a local address or to a stream on a tether; streams arriving from
//! tethers are dispatched the same way.

mod dispatch;
mod splice;

pub use splice::{splice, SpliceStats};

use crate::config::{Config, ListenerConfig, ListenerType, MuxConfig, PoolConfig, TetherConfig};
use crate::error::{Socks5Error, Socks5ReplyCode, TetherError};
use crate::helper::DEFAULT_CONNECT_TIMEOUT_SECS;
use crate::listener;
use crate::mux::Session;
use crate::pool::{TetherDialer, TetherPool};
use crate::protocol::{read_status, write_request, StreamRequest};
use crate::routing::{Destination, RoutingTable};
use crate::transport::{LinkAcceptor, SocketOpts, StreamDyn};
use anyhow::{anyhow, Context, Result};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Credentials of one listener: name -> secret
pub type Credentials = HashMap<String, String>;

/// Top-level coordinator of tethers, listeners and routing
pub struct Router {
    client_id: String,
    mux: MuxConfig,
    pool_config: PoolConfig,
    pools: RwLock<HashMap<String, Arc<TetherPool>>>,
    routes: ArcSwap<RoutingTable>,
    /// Keyed by bound listener port
    credentials: ArcSwap<HashMap<u16, Arc<Credentials>>>,
    connect_timeout: Duration,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("client_id", &self.client_id)
            .field("tethers", &self.tether_names())
            .field("routes", &self.routes.load().len())
            .finish()
    }
}

impl Router {
    /// Create a router for `config`; nothing is connected or bound yet
    pub fn new(config: &Config) -> Arc<Router> {
        Arc::new(Router {
            client_id: config.agent.client_id.clone(),
            mux: config.mux.clone(),
            pool_config: config.pool.clone(),
            pools: RwLock::new(HashMap::new()),
            routes: ArcSwap::from_pointee(RoutingTable::from_config(&config.agent)),
            credentials: ArcSwap::from_pointee(HashMap::new()),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            shutdown: CancellationToken::new(),
        })
    }

    /// Identity our tethers present
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Multiplex settings for new sessions
    pub fn mux_config(&self) -> &MuxConfig {
        &self.mux
    }

    /// Build and register a tether pool
    ///
    /// A pool already registered under the same name is replaced and shut
    /// down. On failure nothing is registered.
    pub async fn connect_tether(
        self: &Arc<Self>,
        config: &TetherConfig,
        pool_size: usize,
    ) -> Result<(), TetherError> {
        if self.is_shutdown() {
            return Err(TetherError::SessionClosed);
        }
        let dialer = TetherDialer::from_config(config, &self.client_id)
            .map_err(|e| TetherError::Config(format!("{:#}", e)))?;
        let pool = TetherPool::connect(
            &config.name,
            dialer,
            pool_size,
            self.mux.clone(),
            self.pool_config.clone(),
        )
        .await?;
        self.register_pool(pool)
    }

    /// Bind a listener and start serving it
    ///
    /// Returns the bound address.
    pub async fn serve(self: &Arc<Self>, config: ListenerConfig) -> Result<SocketAddr> {
        let acceptor = match config.listener_type {
            ListenerType::Tether => LinkAcceptor::from_config(config.tls.as_ref())?,
            _ => LinkAcceptor::plain(),
        };
        let listener = TcpListener::bind(config.bind_addr())
            .await
            .with_context(|| format!("Failed to bind listener '{}'", config.label()))?;
        let addr = listener
            .local_addr()
            .with_context(|| "Failed to read listener address")?;

        self.set_credentials(addr.port(), config.authorized_clients.clone());
        info!(
            "Listening on {} ({}, auth={})",
            addr,
            config.listener_type,
            config.use_authentication || config.listener_type == ListenerType::Tether
        );

        let router = self.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            listener::run(router, listener, Arc::new(config), acceptor, addr.port(), shutdown).await;
        });
        Ok(addr)
    }

    /// Atomically replace the routing table
    pub fn update_routes(&self, table: RoutingTable) {
        info!("Routing table updated ({} entries)", table.len());
        self.routes.store(Arc::new(table));
    }

    /// Current routing table snapshot
    pub fn routes(&self) -> Arc<RoutingTable> {
        self.routes.load_full()
    }

    /// Apply routing and credential changes from a reloaded configuration
    ///
    /// Tethers and listener bindings are left as they are.
    pub fn reconfigure(&self, config: &Config) {
        self.update_routes(RoutingTable::from_config(&config.agent));
        let mut credentials = HashMap::clone(&self.credentials.load());
        for listener in &config.listeners {
            if credentials.contains_key(&listener.port) {
                credentials.insert(listener.port, Arc::new(listener.authorized_clients.clone()));
            } else {
                warn!(
                    "Listener '{}' is not running; restart to bind it",
                    listener.label()
                );
            }
        }
        self.credentials.store(Arc::new(credentials));
    }

    /// Credentials snapshot for a bound listener port
    pub fn credentials(&self, port: u16) -> Arc<Credentials> {
        self.credentials
            .load()
            .get(&port)
            .cloned()
            .unwrap_or_default()
    }

    fn set_credentials(&self, port: u16, clients: Credentials) {
        let clients = Arc::new(clients);
        self.credentials.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(port, clients.clone());
            next
        });
    }

    /// Registered pool by name
    pub fn pool(&self, name: &str) -> Option<Arc<TetherPool>> {
        self.read_pools().get(name).cloned()
    }

    /// Names of registered pools
    pub fn tether_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read_pools().keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop listeners and shut down every pool
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!("Shutting down router");
        self.shutdown.cancel();
        let pools: Vec<Arc<TetherPool>> = match self.pools.write() {
            Ok(mut pools) => pools.drain().map(|(_, p)| p).collect(),
            Err(poisoned) => poisoned.into_inner().drain().map(|(_, p)| p).collect(),
        };
        for pool in pools {
            pool.shutdown();
        }
    }

    /// True once [`Router::shutdown`] was called
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolve and connect a request from a local client
    pub async fn open_route(&self, identity: &str, target: &str) -> Result<Box<dyn StreamDyn>> {
        let destination = self.routes.load().route(identity, Some(target))?;
        debug!(identity, target, "Routing to {}", destination);
        self.connect_destination(&destination, identity, target).await
    }

    /// Open a stream through `tether` and wait for the far end's status
    pub async fn open_via_tether(
        &self,
        tether: &str,
        identity: &str,
        target: &str,
    ) -> Result<Box<dyn StreamDyn>> {
        let pool = self
            .pool(tether)
            .ok_or_else(|| TetherError::PoolExhausted(tether.to_string()))?;
        let mut stream = pool.open_stream()?;

        let request = StreamRequest::new(identity, Some(target.to_string()));
        write_request(&mut stream, &request).await?;
        let status = tokio::time::timeout(self.connect_timeout * 2, read_status(&mut stream))
            .await
            .map_err(|_| TetherError::Timeout(format!("{} via tether '{}'", target, tether)))??;

        if status != Socks5ReplyCode::Succeeded {
            return Err(TetherError::Socks5(Socks5Error::Refused(status)))
                .with_context(|| format!("{} via tether '{}'", target, tether));
        }
        Ok(Box::new(stream))
    }

    /// Dial `target` from this agent
    pub async fn connect_local(&self, target: &str) -> Result<Box<dyn StreamDyn>> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(target))
            .await
            .map_err(|_| TetherError::Timeout(format!("connecting to {}", target)))?
            .with_context(|| format!("Failed to connect to {}", target))?;
        if let Err(e) = SocketOpts::for_relay().apply(&stream) {
            debug!("Failed to apply socket options: {}", e);
        }
        Ok(Box::new(stream))
    }

    pub(crate) async fn connect_destination(
        &self,
        destination: &Destination,
        identity: &str,
        target: &str,
    ) -> Result<Box<dyn StreamDyn>> {
        match destination {
            Destination::Local => self.connect_local(target).await,
            Destination::ViaTether(tether) => self.open_via_tether(tether, identity, target).await,
        }
    }

    /// Add a session accepted by a tether listener to its peer's pool
    pub(crate) fn attach_peer_session(self: &Arc<Self>, peer: &str, session: Session) -> Result<()> {
        if self.is_shutdown() {
            session.close();
            return Err(anyhow!("router is shutting down"));
        }
        let existing = self.pool(peer).filter(|p| !p.is_shutdown());
        let pool = match existing {
            Some(pool) if pool.is_passive() => pool,
            Some(_) => {
                session.close();
                return Err(TetherError::Config(format!(
                    "peer '{}' collides with a configured tether name",
                    peer
                ))
                .into());
            }
            None => {
                let pool = TetherPool::passive(peer, self.mux.clone(), self.pool_config.clone());
                if let Err(e) = self.register_pool(pool.clone()) {
                    session.close();
                    return Err(e.into());
                }
                pool
            }
        };
        pool.add_session(session);
        info!(
            "Peer '{}' attached a link ({} alive)",
            peer,
            pool.alive_count()
        );
        Ok(())
    }

    /// Insert `pool`, shutting it down instead if the router already stopped
    fn register_pool(self: &Arc<Self>, pool: Arc<TetherPool>) -> Result<(), TetherError> {
        let previous = {
            let mut pools = self.pools.write().unwrap_or_else(|e| e.into_inner());
            // Checked under the lock: `shutdown` cancels before it drains the map
            if self.is_shutdown() {
                drop(pools);
                pool.shutdown();
                return Err(TetherError::SessionClosed);
            }
            pools.insert(pool.name().to_string(), pool.clone())
        };
        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous, &pool) {
                info!("Replacing tether '{}'", pool.name());
                previous.shutdown();
            }
        }

        let router = self.clone();
        tokio::spawn(async move {
            dispatch::run_inbound(router, pool).await;
        });
        Ok(())
    }

    fn read_pools(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<TetherPool>>> {
        self.pools.read().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn config() -> Config {
        parse_config(
            r#"
[agent]
client_id = "laptop"

[agent.mapping]
"alice" = "home"
"*" = "local"
"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_connect_tether_failure_registers_nothing() {
        let router = Router::new(&config());
        let tether: TetherConfig = toml::from_str(
            r#"
name = "home"
host = "127.0.0.1"
port = 1
connection_type = "plain"
secret = "s"
connect_timeout = 1
"#,
        )
        .unwrap();

        let err = router.connect_tether(&tether, 2).await.unwrap_err();
        assert!(matches!(err, TetherError::DialFailure(_)));
        assert!(router.pool("home").is_none());
    }

    #[tokio::test]
    async fn test_open_route_via_missing_tether_is_pool_exhausted() {
        let router = Router::new(&config());
        let err = router
            .open_route("alice", "example.com:80")
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TetherError>(),
            Some(TetherError::PoolExhausted(_))
        ));
    }

    #[tokio::test]
    async fn test_open_route_local() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = echo.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut conn, _) = echo.accept().await.unwrap();
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
        });

        let router = Router::new(&config());
        let mut stream = router.open_route("bob", &target).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_update_routes_swaps_snapshot() {
        let router = Router::new(&config());
        let before = router.routes();
        let mut table = RoutingTable::new();
        table.insert("*", Destination::ViaTether("office".to_string()));
        router.update_routes(table);

        assert_eq!(before.len(), 2);
        assert_eq!(
            router.routes().resolve("alice").unwrap(),
            Destination::ViaTether("office".to_string())
        );
    }

    #[tokio::test]
    async fn test_reconfigure_updates_credentials() {
        let router = Router::new(&config());
        let listener: ListenerConfig = toml::from_str(
            r#"
port = 0
type = "socks5"
use_authentication = true
[authorized_clients]
u = "s"
"#,
        )
        .unwrap();
        let addr = router.serve(listener).await.unwrap();
        assert_eq!(router.credentials(addr.port())["u"], "s");

        let mut reloaded = config();
        let mut clients = HashMap::new();
        clients.insert("u".to_string(), "rotated".to_string());
        reloaded.listeners.push(ListenerConfig {
            name: None,
            port: addr.port(),
            listener_type: ListenerType::Socks5,
            local_only: true,
            use_authentication: true,
            authorized_clients: clients,
            tether: None,
            target: None,
            identity: None,
            tls: None,
        });
        reloaded.agent.mapping.clear();
        router.reconfigure(&reloaded);

        assert_eq!(router.credentials(addr.port())["u"], "rotated");
        assert!(router.routes().is_empty());
        router.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_during_connect_discards_pool() {
        use crate::mux::Role;
        use crate::protocol::handshake;

        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let (session_tx, session_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (mut conn, _) = server.accept().await.unwrap();
            // Hold the dialer in its handshake while the router shuts down
            tokio::time::sleep(Duration::from_millis(300)).await;
            let clients = HashMap::from([("laptop".to_string(), "s".to_string())]);
            let peer = handshake::accept(&mut conn, &clients).await.unwrap();
            let session = Session::authenticated(conn, Role::Server, &MuxConfig::default(), peer);
            let _ = session_tx.send(session);
        });

        let router = Router::new(&config());
        let tether: TetherConfig = toml::from_str(&format!(
            "name = \"home\"\nhost = \"127.0.0.1\"\nport = {}\nconnection_type = \"plain\"\nsecret = \"s\"\n",
            addr.port()
        ))
        .unwrap();
        let connecting = tokio::spawn({
            let router = router.clone();
            async move { router.connect_tether(&tether, 1).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        router.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(5), connecting)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(TetherError::SessionClosed)));
        assert!(router.pool("home").is_none());

        // The link that came up late is torn down
        let session = session_rx.await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), session.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let router = Router::new(&config());
        router.shutdown();
        router.shutdown();
        assert!(router.is_shutdown());
        assert!(router.tether_names().is_empty());
    }
}
