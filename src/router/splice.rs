//! Bidirectional splice
//!
//! Copies bytes between a client connection and its routed stream until
//! both directions finished. EOF in one direction half-closes the other
//! endpoint's write side; an error in either direction stops both.

use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Bytes moved by a finished splice
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpliceStats {
    /// Client to remote
    pub sent: u64,
    /// Remote to client
    pub received: u64,
}

/// Relay `client` and `remote` until both directions are done
///
/// Both endpoints are dropped on return.
pub async fn splice<A, B>(client: A, remote: B) -> io::Result<SpliceStats>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);
    let stop = CancellationToken::new();

    let (sent, received) = tokio::join!(
        copy_half(&mut client_read, &mut remote_write, &stop),
        copy_half(&mut remote_read, &mut client_write, &stop),
    );

    match (sent, received) {
        (Ok(sent), Ok(received)) => {
            debug!("Splice finished: sent={}, received={}", sent, received);
            Ok(SpliceStats { sent, received })
        }
        (Err(e), _) | (_, Err(e)) => {
            debug!("Splice aborted: {}", e);
            Err(e)
        }
    }
}

async fn copy_half<R, W>(reader: &mut R, writer: &mut W, stop: &CancellationToken) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let result = tokio::select! {
        r = tokio::io::copy(reader, writer) => r,
        _ = stop.cancelled() => Err(io::Error::new(
            io::ErrorKind::Interrupted,
            "opposite direction failed",
        )),
    };
    match result {
        Ok(n) => {
            let _ = writer.shutdown().await;
            Ok(n)
        }
        Err(e) => {
            stop.cancel();
            Err(e)
        }
    }
}
