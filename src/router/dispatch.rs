//! Inbound stream dispatch
//!
//! Streams opened by a remote agent carry a [`StreamRequest`] header. The
//! request is routed like a local connection, answered with a one-byte
//! status and then spliced to its destination.

use super::{splice, Router};
use crate::error::{reply_code_for, Socks5Error, Socks5ReplyCode, TetherError};
use crate::mux::LogicalStream;
use crate::pool::TetherPool;
use crate::protocol::{read_request, write_status, StreamRequest};
use crate::routing::Destination;
use crate::transport::StreamDyn;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Serve streams the remote side of `pool` opens until the pool shuts down
pub(super) async fn run_inbound(router: Arc<Router>, pool: Arc<TetherPool>) {
    let tether = pool.name().to_string();
    debug!("Dispatching inbound streams of tether '{}'", tether);
    loop {
        let stream = match pool.accept_stream().await {
            Ok(stream) => stream,
            Err(_) => break,
        };
        let router = router.clone();
        let tether = tether.clone();
        tokio::spawn(async move {
            let id = stream.id();
            if let Err(e) = handle_inbound_stream(router, stream, &tether).await {
                warn!("Inbound stream {} on tether '{}' failed: {:#}", id, tether, e);
            }
        });
    }
    debug!("Inbound dispatch of tether '{}' stopped", tether);
}

/// Answer one stream that arrived on `arrived_on`
pub(crate) async fn handle_inbound_stream(
    router: Arc<Router>,
    mut stream: LogicalStream,
    arrived_on: &str,
) -> Result<()> {
    let request = tokio::time::timeout(
        router.mux_config().handshake_timeout(),
        read_request(&mut stream),
    )
    .await
    .map_err(|_| TetherError::Timeout("stream request".to_string()))?
    .with_context(|| "Failed to read stream request")?;

    let remote = match connect_for(&router, &request, arrived_on).await {
        Ok(remote) => remote,
        Err(e) => {
            let code = reply_code_for(&e);
            // Best effort; the opener may already be gone
            let _ = write_status(&mut stream, code).await;
            stream.close();
            // Dropping before the opener closes would reset the stream and
            // discard the status byte in flight
            let _ = tokio::time::timeout(
                router.mux_config().handshake_timeout(),
                tokio::io::copy(&mut stream, &mut tokio::io::sink()),
            )
            .await;
            return Err(e);
        }
    };

    write_status(&mut stream, Socks5ReplyCode::Succeeded).await?;
    info!(
        identity = %request.identity,
        target = request.target.as_deref().unwrap_or("-"),
        "Relaying stream from tether '{}'",
        arrived_on
    );
    let stats = splice(stream, remote).await?;
    debug!(
        "Stream from tether '{}' done: sent={}, received={}",
        arrived_on, stats.sent, stats.received
    );
    Ok(())
}

async fn connect_for(
    router: &Router,
    request: &StreamRequest,
    arrived_on: &str,
) -> Result<Box<dyn StreamDyn>> {
    let target = request.target.as_deref();
    let destination = router.routes().route(&request.identity, target)?;

    match (&destination, target) {
        (Destination::ViaTether(tether), _) if tether == arrived_on => {
            warn!(
                identity = %request.identity,
                "Refusing to route back over arrival tether '{}'",
                arrived_on
            );
            Err(TetherError::Socks5(Socks5Error::Refused(
                Socks5ReplyCode::ConnectionNotAllowed,
            ))
            .into())
        }
        (_, None) => Err(TetherError::Socks5(Socks5Error::Refused(
            Socks5ReplyCode::ConnectionNotAllowed,
        )))
        .with_context(|| format!("stream from '{}' names no target", request.identity)),
        (destination, Some(target)) => {
            router
                .connect_destination(destination, &request.identity, target)
                .await
        }
    }
}
