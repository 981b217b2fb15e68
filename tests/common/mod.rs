//! Test utilities and mocks for Tetherd
//!
//! This module provides common test utilities used across integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use tetherd::config::{
    AgentConfig, Config, ConnectionType, ListenerConfig, ListenerType, MuxConfig, PoolConfig,
    RoutingMode, TcpConfig, TetherConfig, TlsConfig,
};
use tetherd::mux::{Role, Session};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Create a test TCP listener on an available port
pub async fn create_test_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Echo server answering every connection until EOF
pub async fn spawn_echo_server() -> SocketAddr {
    let (listener, addr) = create_test_listener().await;
    tokio::spawn(async move {
        while let Ok((mut conn, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = conn.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// Two connected sessions over an in-memory link
pub fn session_pair(config: &MuxConfig) -> (Session, Session) {
    let (a, b) = duplex(1024 * 1024);
    (
        Session::new(a, Role::Client, config),
        Session::new(b, Role::Server, config),
    )
}

/// Mux settings with short keep-alive for tests that kill links
pub fn fast_mux() -> MuxConfig {
    MuxConfig {
        keepalive_interval: 1,
        keepalive_timeout: 1,
        handshake_timeout: 2,
        ..MuxConfig::default()
    }
}

/// Pool settings with quick reconnects
pub fn fast_pool() -> PoolConfig {
    PoolConfig {
        health_check_interval: 1,
        reconnect_initial_delay_ms: 20,
        reconnect_max_delay: 1,
        reconnect_max_elapsed: 2,
        ..PoolConfig::default()
    }
}

/// Test configuration builder
pub struct TestConfigBuilder {
    client_id: String,
    routing_mode: RoutingMode,
    mapping: HashMap<String, String>,
    tethers: Vec<TetherConfig>,
    listeners: Vec<ListenerConfig>,
}

impl TestConfigBuilder {
    /// Create a new test config builder
    pub fn new(client_id: &str) -> Self {
        TestConfigBuilder {
            client_id: client_id.to_string(),
            routing_mode: RoutingMode::Identity,
            mapping: HashMap::new(),
            tethers: Vec::new(),
            listeners: Vec::new(),
        }
    }

    /// Add a routing table entry
    pub fn route(mut self, key: &str, destination: &str) -> Self {
        self.mapping.insert(key.to_string(), destination.to_string());
        self
    }

    /// Route by requested target instead of identity
    pub fn destination_routing(mut self) -> Self {
        self.routing_mode = RoutingMode::Destination;
        self
    }

    /// Add a plain TCP tether
    pub fn tether(mut self, name: &str, addr: SocketAddr, secret: &str) -> Self {
        self.tethers.push(plain_tether(name, addr, secret));
        self
    }

    /// Add a listener
    pub fn listener(mut self, listener: ListenerConfig) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        Config {
            agent: AgentConfig {
                client_id: self.client_id,
                pool_size: 2,
                routing_mode: self.routing_mode,
                mapping: self.mapping,
                proxy: None,
            },
            mux: fast_mux(),
            pool: fast_pool(),
            tethers: self.tethers,
            listeners: self.listeners,
        }
    }
}

/// Plain TCP tether to `addr`
pub fn plain_tether(name: &str, addr: SocketAddr, secret: &str) -> TetherConfig {
    TetherConfig {
        name: name.to_string(),
        host: addr.ip().to_string(),
        port: addr.port(),
        connection_type: ConnectionType::Plain,
        secret: secret.to_string(),
        pool_size: None,
        proxy: None,
        tls: TlsConfig::default(),
        tcp: TcpConfig::default(),
        connect_timeout: 2,
    }
}

/// Listener on an ephemeral local port
pub fn listener(listener_type: ListenerType, clients: &[(&str, &str)]) -> ListenerConfig {
    ListenerConfig {
        name: None,
        port: 0,
        listener_type,
        local_only: true,
        use_authentication: listener_type != ListenerType::Tether && !clients.is_empty(),
        authorized_clients: clients
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        tether: None,
        target: None,
        identity: None,
        tls: None,
    }
}

/// Mock SOCKS5 client messages
pub mod socks5_mock {
    use tetherd::listener::socks::consts::*;

    /// Method selection offering no authentication
    pub fn create_auth_request_no_auth() -> Vec<u8> {
        vec![SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_NONE]
    }

    /// Method selection offering username/password
    pub fn create_auth_request_password() -> Vec<u8> {
        vec![SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_PASSWORD]
    }

    /// RFC 1929 credentials
    pub fn create_credentials(username: &str, password: &str) -> Vec<u8> {
        let mut request = vec![SOCKS5_AUTH_VERSION, username.len() as u8];
        request.extend_from_slice(username.as_bytes());
        request.push(password.len() as u8);
        request.extend_from_slice(password.as_bytes());
        request
    }

    /// CONNECT to a domain target
    pub fn create_connect_domain(domain: &str, port: u16) -> Vec<u8> {
        let mut cmd = vec![
            SOCKS5_VERSION,
            SOCKS5_CMD_TCP_CONNECT,
            SOCKS5_RESERVED,
            SOCKS5_ADDR_TYPE_DOMAIN,
            domain.len() as u8,
        ];
        cmd.extend_from_slice(domain.as_bytes());
        cmd.extend_from_slice(&port.to_be_bytes());
        cmd
    }
}

/// Outcome of a SOCKS5 client handshake
#[derive(Debug, PartialEq, Eq)]
pub enum SocksOutcome {
    /// Credentials rejected with this sub-negotiation status
    AuthRejected(u8),
    /// CONNECT answered with this reply code
    Reply(u8),
}

/// Run a SOCKS5 client handshake against `proxy`
///
/// Returns the connection (ready for data after `Reply(0)`) and the outcome.
pub async fn socks5_connect(
    proxy: SocketAddr,
    credentials: Option<(&str, &str)>,
    host: &str,
    port: u16,
) -> (TcpStream, SocksOutcome) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();

    let greeting = match credentials {
        Some(_) => socks5_mock::create_auth_request_password(),
        None => socks5_mock::create_auth_request_no_auth(),
    };
    stream.write_all(&greeting).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method[1], greeting[2]);

    if let Some((username, password)) = credentials {
        stream
            .write_all(&socks5_mock::create_credentials(username, password))
            .await
            .unwrap();
        let mut status = [0u8; 2];
        stream.read_exact(&mut status).await.unwrap();
        if status[1] != 0 {
            return (stream, SocksOutcome::AuthRejected(status[1]));
        }
    }

    stream
        .write_all(&socks5_mock::create_connect_domain(host, port))
        .await
        .unwrap();
    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    (stream, SocksOutcome::Reply(reply[1]))
}

/// Write `payload` and expect it echoed back
pub async fn assert_echo<S>(stream: &mut S, payload: &[u8])
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, payload);
}
