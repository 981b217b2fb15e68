//! SOCKS5 connection handler
//!
//! Authentication happens before anything is resolved; only CONNECT is
//! served. Failures to reach the destination are reported to the client
//! with the matching reply code.

use super::auth::negotiate;
use super::request::{parse_command, send_reply, SocksCommand};
use crate::config::ListenerConfig;
use crate::error::{reply_code_for, Socks5ReplyCode};
use crate::router::{splice, Credentials, Router};
use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

/// Serve one SOCKS5 client
pub async fn handle_socks5<S>(
    router: &Router,
    mut stream: S,
    config: &ListenerConfig,
    credentials: &Credentials,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let user = negotiate(&mut stream, config.use_authentication, credentials)
        .await
        .with_context(|| "Authentication negotiation failed")?;
    let identity = user.unwrap_or_else(|| config.routing_identity());

    let (command, target) = match parse_command(&mut stream).await {
        Ok(parsed) => parsed,
        Err(e) => {
            let code = reply_code_for(&e);
            if code != Socks5ReplyCode::GeneralFailure {
                let _ = send_reply(&mut stream, code).await;
            }
            return Err(e.context("Failed to parse SOCKS5 command"));
        }
    };

    if command != SocksCommand::Connect {
        warn!(identity = %identity, "SOCKS5 {} not supported", command);
        send_reply(&mut stream, Socks5ReplyCode::CommandNotSupported).await?;
        return Ok(());
    }

    let target = target.to_string();
    info!(identity = %identity, target = %target, "SOCKS5 CONNECT");

    let remote = match router.open_route(&identity, &target).await {
        Ok(remote) => remote,
        Err(e) => {
            send_reply(&mut stream, reply_code_for(&e)).await?;
            return Err(e.context(format!("{} for '{}'", target, identity)));
        }
    };
    send_reply(&mut stream, Socks5ReplyCode::Succeeded).await?;

    let stats = splice(stream, remote).await?;
    debug!(
        target = %target,
        "SOCKS5 relay done: sent={}, received={}",
        stats.sent,
        stats.received
    );
    Ok(())
}
