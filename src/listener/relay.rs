//! Raw TCP relay listener
//!
//! No protocol handshake: each connection is spliced to a stream carrying
//! the listener's configured target. With `use_authentication` the client
//! first passes the RFC 1929 username/password gate.

use super::socks::authenticate_password;
use crate::config::ListenerConfig;
use crate::router::{splice, Credentials, Router};
use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

/// Serve one relay client
pub async fn handle_relay<S>(
    router: &Router,
    mut stream: S,
    config: &ListenerConfig,
    credentials: &Credentials,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let target = config
        .target
        .as_deref()
        .ok_or_else(|| anyhow!("relay listener '{}' has no target", config.label()))?;

    let identity = if config.use_authentication {
        authenticate_password(&mut stream, credentials)
            .await
            .with_context(|| "Relay authentication failed")?
    } else {
        config.routing_identity()
    };

    let remote = match config.tether.as_deref() {
        Some(tether) => router.open_via_tether(tether, &identity, target).await?,
        None => router.open_route(&identity, target).await?,
    };
    info!(identity = %identity, target, "Relay connected");

    let stats = splice(stream, remote).await?;
    debug!(
        target,
        "Relay done: sent={}, received={}", stats.sent, stats.received
    );
    Ok(())
}
