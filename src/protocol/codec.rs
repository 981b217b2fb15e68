//! Protocol codec for serialization and deserialization
//!
//! Fixed-size messages are bincode-encoded and read with their known length.
//! Variable-size messages carry a big-endian u16 length prefix.

use super::types::{
    Ack, Auth, Challenge, Hello, StreamRequest, HASH_WIDTH_IN_BYTES,
};
use crate::error::Socks5ReplyCode;
use anyhow::{bail, Context, Result};
use lazy_static::lazy_static;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for length-prefixed messages
pub const MAX_MESSAGE_LEN: usize = 4096;

/// Packet lengths for fixed-size protocol messages
struct PacketLength {
    challenge: usize,
    auth: usize,
    ack: usize,
}

fn fixed_len<T: Serialize>(value: &T) -> usize {
    bincode::serialized_size(value).map_or(0, |n| n as usize)
}

impl PacketLength {
    fn new() -> PacketLength {
        let d = [0u8; HASH_WIDTH_IN_BYTES];
        PacketLength {
            challenge: fixed_len(&Challenge(d)),
            auth: fixed_len(&Auth(d)),
            ack: fixed_len(&Ack::Ok),
        }
    }
}

lazy_static! {
    static ref PACKET_LEN: PacketLength = PacketLength::new();
}

async fn read_fixed<T, R>(conn: &mut R, len: usize, what: &str) -> Result<T>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; len];
    conn.read_exact(&mut buf)
        .await
        .with_context(|| format!("Failed to read {}", what))?;
    bincode::deserialize(&buf).with_context(|| format!("Failed to deserialize {}", what))
}

async fn write_message<T, W>(conn: &mut W, value: &T, what: &str) -> Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let buf = bincode::serialize(value).with_context(|| format!("Failed to serialize {}", what))?;
    conn.write_all(&buf)
        .await
        .with_context(|| format!("Failed to write {}", what))?;
    conn.flush()
        .await
        .with_context(|| format!("Failed to flush {}", what))?;
    Ok(())
}

async fn read_prefixed<T, R>(conn: &mut R, what: &str) -> Result<T>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let len = conn
        .read_u16()
        .await
        .with_context(|| format!("Failed to read {} length", what))? as usize;
    if len == 0 || len > MAX_MESSAGE_LEN {
        bail!("Invalid {} length: {}", what, len);
    }
    read_fixed(conn, len, what).await
}

async fn write_prefixed<T, W>(conn: &mut W, value: &T, what: &str) -> Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let body = bincode::serialize(value).with_context(|| format!("Failed to serialize {}", what))?;
    if body.len() > MAX_MESSAGE_LEN {
        bail!("{} too large: {} bytes", what, body.len());
    }
    let mut buf = Vec::with_capacity(2 + body.len());
    buf.extend_from_slice(&(body.len() as u16).to_be_bytes());
    buf.extend_from_slice(&body);
    conn.write_all(&buf)
        .await
        .with_context(|| format!("Failed to write {}", what))?;
    conn.flush()
        .await
        .with_context(|| format!("Failed to flush {}", what))?;
    Ok(())
}

/// Read a Hello message; the caller checks the version
pub async fn read_hello<T: AsyncRead + Unpin>(conn: &mut T) -> Result<Hello> {
    read_prefixed(conn, "hello").await
}

/// Write a Hello message
pub async fn write_hello<T: AsyncWrite + Unpin>(conn: &mut T, hello: &Hello) -> Result<()> {
    write_prefixed(conn, hello, "hello").await
}

/// Read a Challenge message
pub async fn read_challenge<T: AsyncRead + Unpin>(conn: &mut T) -> Result<Challenge> {
    read_fixed(conn, PACKET_LEN.challenge, "challenge").await
}

/// Write a Challenge message
pub async fn write_challenge<T: AsyncWrite + Unpin>(
    conn: &mut T,
    challenge: &Challenge,
) -> Result<()> {
    write_message(conn, challenge, "challenge").await
}

/// Read an Auth message
pub async fn read_auth<T: AsyncRead + Unpin>(conn: &mut T) -> Result<Auth> {
    read_fixed(conn, PACKET_LEN.auth, "auth").await
}

/// Write an Auth message
pub async fn write_auth<T: AsyncWrite + Unpin>(conn: &mut T, auth: &Auth) -> Result<()> {
    write_message(conn, auth, "auth").await
}

/// Read an Ack message
pub async fn read_ack<T: AsyncRead + Unpin>(conn: &mut T) -> Result<Ack> {
    read_fixed(conn, PACKET_LEN.ack, "ack").await
}

/// Write an Ack message
pub async fn write_ack<T: AsyncWrite + Unpin>(conn: &mut T, ack: &Ack) -> Result<()> {
    write_message(conn, ack, "ack").await
}

/// Read the header of a logical stream
pub async fn read_request<T: AsyncRead + Unpin>(conn: &mut T) -> Result<StreamRequest> {
    read_prefixed(conn, "stream request").await
}

/// Write the header of a logical stream
pub async fn write_request<T: AsyncWrite + Unpin>(
    conn: &mut T,
    request: &StreamRequest,
) -> Result<()> {
    write_prefixed(conn, request, "stream request").await
}

/// Read the one-byte status answering a stream request
pub async fn read_status<T: AsyncRead + Unpin>(conn: &mut T) -> Result<Socks5ReplyCode> {
    let code = conn
        .read_u8()
        .await
        .with_context(|| "Failed to read stream status")?;
    Socks5ReplyCode::try_from(code).with_context(|| format!("Invalid stream status {}", code))
}

/// Write the one-byte status answering a stream request
pub async fn write_status<T: AsyncWrite + Unpin>(
    conn: &mut T,
    status: Socks5ReplyCode,
) -> Result<()> {
    conn.write_u8(status.into())
        .await
        .with_context(|| "Failed to write stream status")?;
    conn.flush()
        .await
        .with_context(|| "Failed to flush stream status")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn test_fixed_lengths() {
        assert_eq!(PACKET_LEN.challenge, HASH_WIDTH_IN_BYTES);
        assert_eq!(PACKET_LEN.auth, HASH_WIDTH_IN_BYTES);
        assert!(PACKET_LEN.ack > 0);
    }

    #[tokio::test]
    async fn test_hello_over_duplex() {
        let (mut a, mut b) = duplex(1024);
        write_hello(&mut a, &Hello::new("laptop")).await.unwrap();
        let hello = read_hello(&mut b).await.unwrap();
        assert_eq!(hello.client_id, "laptop");
    }

    #[tokio::test]
    async fn test_prefixed_length_limits() {
        let mut input: &[u8] = &[0x00, 0x00];
        assert!(read_request(&mut input).await.is_err());

        let mut input: &[u8] = &[0xFF, 0xFF];
        assert!(read_request(&mut input).await.is_err());
    }

    #[tokio::test]
    async fn test_request_and_status_sequence() {
        let (mut a, mut b) = duplex(1024);
        let request = StreamRequest::new("alice", Some("example.com:80".to_string()));
        write_request(&mut a, &request).await.unwrap();
        write_status(&mut a, Socks5ReplyCode::HostUnreachable)
            .await
            .unwrap();

        assert_eq!(read_request(&mut b).await.unwrap(), request);
        assert_eq!(
            read_status(&mut b).await.unwrap(),
            Socks5ReplyCode::HostUnreachable
        );
    }

    #[tokio::test]
    async fn test_read_ack_truncated() {
        let mut input: &[u8] = &[0x00];
        assert!(read_ack(&mut input).await.is_err());
    }
}
