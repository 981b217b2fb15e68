//! SOCKS5 method negotiation and username/password authentication
//!
//! The RFC 1929 exchange doubles as the credential gate of raw relay
//! listeners.

use super::consts::*;
use crate::error::{Socks5Error, TetherError};
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Authentication method types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// No authentication required
    None,
    /// Username/password authentication
    Password,
}

impl AuthMethod {
    /// Convert to SOCKS5 method byte
    pub fn to_byte(self) -> u8 {
        match self {
            AuthMethod::None => SOCKS5_AUTH_METHOD_NONE,
            AuthMethod::Password => SOCKS5_AUTH_METHOD_PASSWORD,
        }
    }
}

/// Greeting and method selection
///
/// Returns the authenticated user name when password authentication ran.
pub async fn negotiate<S>(
    stream: &mut S,
    use_authentication: bool,
    credentials: &HashMap<String, String>,
) -> Result<Option<String>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 2];
    stream
        .read_exact(&mut buf)
        .await
        .with_context(|| "Failed to read greeting")?;

    let version = buf[0];
    let num_methods = buf[1];
    if version != SOCKS5_VERSION {
        return Err(Socks5Error::UnsupportedVersion(version).into());
    }
    if num_methods == 0 {
        bail!("No authentication methods provided");
    }

    let mut methods = vec![0u8; num_methods as usize];
    stream.read_exact(&mut methods).await?;

    let selected = select_auth_method(&methods, use_authentication, credentials);
    stream
        .write_all(&[
            SOCKS5_VERSION,
            selected
                .map(AuthMethod::to_byte)
                .unwrap_or(SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE),
        ])
        .await?;
    stream.flush().await?;

    match selected {
        None => Err(Socks5Error::NoAcceptableMethod.into()),
        Some(AuthMethod::None) => Ok(None),
        Some(AuthMethod::Password) => authenticate_password(stream, credentials).await.map(Some),
    }
}

/// Pick a method the client offered
fn select_auth_method(
    methods: &[u8],
    use_authentication: bool,
    credentials: &HashMap<String, String>,
) -> Option<AuthMethod> {
    if use_authentication {
        return methods
            .contains(&SOCKS5_AUTH_METHOD_PASSWORD)
            .then_some(AuthMethod::Password);
    }
    if methods.contains(&SOCKS5_AUTH_METHOD_NONE) {
        return Some(AuthMethod::None);
    }
    if methods.contains(&SOCKS5_AUTH_METHOD_PASSWORD) && !credentials.is_empty() {
        return Some(AuthMethod::Password);
    }
    None
}

/// RFC 1929 exchange against `credentials`
///
/// ```text
/// +----+------+----------+------+----------+
/// |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
/// +----+------+----------+------+----------+
/// | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
/// +----+------+----------+------+----------+
/// ```
///
/// Returns the user name on success. A rejected client receives status
/// 0x01 and the call fails with `AuthFailure`.
pub async fn authenticate_password<S>(
    stream: &mut S,
    credentials: &HashMap<String, String>,
) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;
    let version = buf[0];
    let username_len = buf[1] as usize;

    if version != SOCKS5_AUTH_VERSION {
        send_auth_result(stream, SOCKS5_AUTH_FAILURE).await?;
        bail!("Invalid auth version: {}", version);
    }
    if username_len == 0 {
        send_auth_result(stream, SOCKS5_AUTH_FAILURE).await?;
        bail!("Invalid username length: {}", username_len);
    }

    let mut username = vec![0u8; username_len];
    stream.read_exact(&mut username).await?;

    let password_len = stream.read_u8().await? as usize;
    if password_len == 0 {
        send_auth_result(stream, SOCKS5_AUTH_FAILURE).await?;
        bail!("Invalid password length: {}", password_len);
    }
    let mut password = vec![0u8; password_len];
    stream.read_exact(&mut password).await?;

    let username = match String::from_utf8(username) {
        Ok(username) => username,
        Err(_) => {
            send_auth_result(stream, SOCKS5_AUTH_FAILURE).await?;
            return Err(TetherError::AuthFailure("user name is not valid UTF-8".to_string()).into());
        }
    };
    let accepted = credentials
        .get(&username)
        .map(|secret| secret.as_bytes() == password.as_slice())
        .unwrap_or(false);

    if accepted {
        send_auth_result(stream, SOCKS5_AUTH_SUCCESS).await?;
        debug!("Authentication successful for user: {}", username);
        Ok(username)
    } else {
        send_auth_result(stream, SOCKS5_AUTH_FAILURE).await?;
        Err(TetherError::AuthFailure(format!("user '{}'", username)).into())
    }
}

async fn send_auth_result<S: AsyncWrite + Unpin>(stream: &mut S, status: u8) -> Result<()> {
    stream.write_all(&[SOCKS5_AUTH_VERSION, status]).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    fn credentials() -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("u".to_string(), "s".to_string());
        map
    }

    fn auth_request(username: &str, password: &str) -> Vec<u8> {
        let mut request = vec![SOCKS5_AUTH_VERSION, username.len() as u8];
        request.extend_from_slice(username.as_bytes());
        request.push(password.len() as u8);
        request.extend_from_slice(password.as_bytes());
        request
    }

    #[test]
    fn test_select_auth_method() {
        let none = HashMap::new();
        let offered = [SOCKS5_AUTH_METHOD_NONE, SOCKS5_AUTH_METHOD_PASSWORD];

        assert_eq!(
            select_auth_method(&offered, true, &credentials()),
            Some(AuthMethod::Password)
        );
        assert_eq!(
            select_auth_method(&[SOCKS5_AUTH_METHOD_NONE], true, &credentials()),
            None
        );
        assert_eq!(
            select_auth_method(&offered, false, &none),
            Some(AuthMethod::None)
        );
        assert_eq!(
            select_auth_method(&[SOCKS5_AUTH_METHOD_PASSWORD], false, &none),
            None
        );
        assert_eq!(
            select_auth_method(&[SOCKS5_AUTH_METHOD_PASSWORD], false, &credentials()),
            Some(AuthMethod::Password)
        );
    }

    #[tokio::test]
    async fn test_negotiate_without_auth() {
        let mut stream = Builder::new()
            .read(&[SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_NONE])
            .write(&[SOCKS5_VERSION, SOCKS5_AUTH_METHOD_NONE])
            .build();
        let user = negotiate(&mut stream, false, &HashMap::new()).await.unwrap();
        assert_eq!(user, None);
    }

    #[tokio::test]
    async fn test_negotiate_password_success() {
        let mut stream = Builder::new()
            .read(&[SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_PASSWORD])
            .write(&[SOCKS5_VERSION, SOCKS5_AUTH_METHOD_PASSWORD])
            .read(&auth_request("u", "s"))
            .write(&[SOCKS5_AUTH_VERSION, SOCKS5_AUTH_SUCCESS])
            .build();
        let user = negotiate(&mut stream, true, &credentials()).await.unwrap();
        assert_eq!(user.as_deref(), Some("u"));
    }

    #[tokio::test]
    async fn test_negotiate_wrong_password() {
        let mut stream = Builder::new()
            .read(&[SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_PASSWORD])
            .write(&[SOCKS5_VERSION, SOCKS5_AUTH_METHOD_PASSWORD])
            .read(&auth_request("u", "wrong"))
            .write(&[SOCKS5_AUTH_VERSION, SOCKS5_AUTH_FAILURE])
            .build();
        let err = negotiate(&mut stream, true, &credentials()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TetherError>(),
            Some(TetherError::AuthFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_negotiate_no_acceptable_method() {
        let mut stream = Builder::new()
            .read(&[SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_NONE])
            .write(&[SOCKS5_VERSION, SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE])
            .build();
        let err = negotiate(&mut stream, true, &credentials()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Socks5Error>(),
            Some(Socks5Error::NoAcceptableMethod)
        ));
    }

    #[tokio::test]
    async fn test_negotiate_rejects_socks4() {
        let mut stream = Builder::new().read(&[0x04, 1]).build();
        let err = negotiate(&mut stream, false, &HashMap::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[tokio::test]
    async fn test_non_utf8_user_rejected() {
        // Lossy decoding of these bytes would match the configured user
        let mut accounts = credentials();
        accounts.insert("u\u{FFFD}".to_string(), "s".to_string());
        let mut stream = Builder::new()
            .read(&[SOCKS5_AUTH_VERSION, 2, b'u', 0xff, 1, b's'])
            .write(&[SOCKS5_AUTH_VERSION, SOCKS5_AUTH_FAILURE])
            .build();
        let err = authenticate_password(&mut stream, &accounts)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TetherError>(),
            Some(TetherError::AuthFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_user_rejected() {
        let mut stream = Builder::new()
            .read(&auth_request("mallory", "s"))
            .write(&[SOCKS5_AUTH_VERSION, SOCKS5_AUTH_FAILURE])
            .build();
        assert!(authenticate_password(&mut stream, &credentials())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_invalid_auth_version() {
        let mut stream = Builder::new()
            .read(&[0xFF, 1])
            .write(&[SOCKS5_AUTH_VERSION, SOCKS5_AUTH_FAILURE])
            .build();
        let err = authenticate_password(&mut stream, &credentials())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid auth version"));
    }
}
