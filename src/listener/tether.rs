//! Tether listener
//!
//! Accepts transport links from remote agents. Each link runs the acceptor
//! side of the handshake and becomes a server-role session in the passive
//! pool named after the peer's client id.

use crate::error::TetherError;
use crate::mux::{Role, Session};
use crate::protocol::handshake;
use crate::router::{Credentials, Router};
use crate::transport::LinkAcceptor;
use anyhow::Result;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::info;

/// Authenticate one inbound link and hand its session to the router
pub async fn handle_tether_link(
    router: &Arc<Router>,
    acceptor: &LinkAcceptor,
    stream: TcpStream,
    credentials: &Credentials,
) -> Result<String> {
    let mut link = acceptor.accept(stream).await?;
    let mux = router.mux_config();

    let peer = tokio::time::timeout(
        mux.handshake_timeout(),
        handshake::accept(&mut link, credentials),
    )
    .await
    .map_err(|_| TetherError::Timeout("tether handshake".to_string()))??;

    info!("Accepted tether link from '{}'", peer);
    let session = Session::authenticated(link, Role::Server, mux, peer.clone());
    router.attach_peer_session(&peer, session)?;
    Ok(peer)
}
