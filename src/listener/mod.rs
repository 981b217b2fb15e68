//! Listener module for Tetherd
//!
//! Accept loops for the three listener types. Every accepted connection is
//! handled on its own task; failures are logged with the listener label and
//! the client address and never stop the listener.

mod relay;
pub mod socks;
mod tether;

pub use relay::handle_relay;
pub use socks::handle_socks5;
pub use tether::handle_tether_link;

use crate::config::{ListenerConfig, ListenerType};
use crate::router::Router;
use crate::transport::{LinkAcceptor, SocketOpts};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pause after a failed accept (e.g. out of file descriptors)
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Accept connections on `listener` until `shutdown` fires
pub(crate) async fn run(
    router: Arc<Router>,
    listener: TcpListener,
    config: Arc<ListenerConfig>,
    acceptor: LinkAcceptor,
    port: u16,
    shutdown: CancellationToken,
) {
    let label = config.label();
    loop {
        let (stream, peer_addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Listener '{}' failed to accept: {}", label, e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            },
            _ = shutdown.cancelled() => break,
        };
        debug!("Listener '{}' accepted {}", label, peer_addr);

        let router = router.clone();
        let config = config.clone();
        let acceptor = acceptor.clone();
        let label = label.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(&router, stream, &config, &acceptor, port).await {
                warn!("Listener '{}' connection from {}: {:#}", label, peer_addr, e);
            }
        });
    }
    info!("Listener '{}' stopped", label);
}

async fn handle_connection(
    router: &Arc<Router>,
    stream: TcpStream,
    config: &ListenerConfig,
    acceptor: &LinkAcceptor,
    port: u16,
) -> anyhow::Result<()> {
    // Snapshot so a reload does not affect connections mid-handshake
    let credentials = router.credentials(port);
    match config.listener_type {
        ListenerType::Tether => {
            handle_tether_link(router, acceptor, stream, &credentials).await?;
        }
        ListenerType::Socks5 => {
            apply_relay_opts(&stream);
            handle_socks5(router, stream, config, &credentials).await?;
        }
        ListenerType::RelayTcp => {
            apply_relay_opts(&stream);
            handle_relay(router, stream, config, &credentials).await?;
        }
    }
    Ok(())
}

fn apply_relay_opts(stream: &TcpStream) {
    if let Err(e) = SocketOpts::for_relay().apply(stream) {
        debug!("Failed to apply socket options: {}", e);
    }
}
