//! Link handshake
//!
//! Runs once on every new transport link before the multiplex session
//! starts: hello, challenge, auth, ack.

use super::codec::{
    read_ack, read_auth, read_challenge, read_hello, write_ack, write_auth, write_challenge,
    write_hello,
};
use super::types::{Ack, Auth, Challenge, Hello, CURRENT_PROTO_VERSION};
use crate::error::TetherError;
use anyhow::Result;
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

/// Dialer side: prove `client_id` with `secret`
pub async fn connect<T>(conn: &mut T, client_id: &str, secret: &str) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    write_hello(conn, &Hello::new(client_id)).await?;
    let challenge = read_challenge(conn).await?;
    write_auth(conn, &Auth::new(secret, &challenge.0)).await?;

    match read_ack(conn).await? {
        Ack::Ok => {
            debug!(client_id, "Handshake accepted");
            Ok(())
        }
        ack => Err(TetherError::AuthFailure(ack.to_string()).into()),
    }
}

/// Acceptor side: verify the dialer against `authorized`
///
/// Returns the authenticated client id.
pub async fn accept<T>(conn: &mut T, authorized: &HashMap<String, String>) -> Result<String>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let hello = read_hello(conn).await?;
    if hello.version != CURRENT_PROTO_VERSION {
        write_ack(conn, &Ack::VersionMismatch).await?;
        return Err(TetherError::AuthFailure(format!(
            "client '{}' speaks protocol version {}",
            hello.client_id, hello.version
        ))
        .into());
    }

    let challenge = Challenge::random();
    write_challenge(conn, &challenge).await?;
    let auth = read_auth(conn).await?;

    let verified = authorized
        .get(&hello.client_id)
        .map(|secret| Auth::new(secret, &challenge.0) == auth)
        .unwrap_or(false);

    if verified {
        write_ack(conn, &Ack::Ok).await?;
        debug!(client_id = %hello.client_id, "Handshake verified");
        Ok(hello.client_id)
    } else {
        warn!(client_id = %hello.client_id, "Handshake rejected");
        write_ack(conn, &Ack::AuthFailed).await?;
        Err(TetherError::AuthFailure(format!(
            "client '{}' failed authentication",
            hello.client_id
        ))
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn authorized() -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("laptop".to_string(), "s3cret".to_string());
        map
    }

    #[tokio::test]
    async fn test_handshake_success() {
        let (mut a, mut b) = duplex(1024);
        let server = tokio::spawn(async move { accept(&mut b, &authorized()).await });

        connect(&mut a, "laptop", "s3cret").await.unwrap();
        assert_eq!(server.await.unwrap().unwrap(), "laptop");
    }

    #[tokio::test]
    async fn test_handshake_wrong_secret() {
        let (mut a, mut b) = duplex(1024);
        let server = tokio::spawn(async move { accept(&mut b, &authorized()).await });

        let err = connect(&mut a, "laptop", "wrong").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TetherError>(),
            Some(TetherError::AuthFailure(_))
        ));
        assert!(server.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_handshake_version_mismatch() {
        let (mut a, mut b) = duplex(1024);
        let server = tokio::spawn(async move { accept(&mut b, &authorized()).await });

        let hello = Hello {
            version: CURRENT_PROTO_VERSION + 1,
            client_id: "laptop".to_string(),
        };
        write_hello(&mut a, &hello).await.unwrap();
        assert_eq!(read_ack(&mut a).await.unwrap(), Ack::VersionMismatch);
        let err = server.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[tokio::test]
    async fn test_handshake_unknown_client() {
        let (mut a, mut b) = duplex(1024);
        let server = tokio::spawn(async move { accept(&mut b, &authorized()).await });

        assert!(connect(&mut a, "stranger", "s3cret").await.is_err());
        let err = server.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("stranger"));
    }
}
