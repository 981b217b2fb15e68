//! SOCKS5 request parsing and replies

use super::consts::*;
use crate::error::{Socks5Error, Socks5ReplyCode};
use anyhow::{bail, Context, Result};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// SOCKS5 command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksCommand {
    /// TCP CONNECT
    Connect,
    /// TCP BIND
    Bind,
    /// UDP ASSOCIATE
    UdpAssociate,
}

impl SocksCommand {
    /// Parse a command byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            SOCKS5_CMD_TCP_CONNECT => Some(SocksCommand::Connect),
            SOCKS5_CMD_TCP_BIND => Some(SocksCommand::Bind),
            SOCKS5_CMD_UDP_ASSOCIATE => Some(SocksCommand::UdpAssociate),
            _ => None,
        }
    }
}

impl fmt::Display for SocksCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocksCommand::Connect => write!(f, "CONNECT"),
            SocksCommand::Bind => write!(f, "BIND"),
            SocksCommand::UdpAssociate => write!(f, "UDP ASSOCIATE"),
        }
    }
}

/// Destination requested by a SOCKS5 client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    /// IP address with port
    Ip(SocketAddr),
    /// Domain name with port
    Domain(String, u16),
}

impl TargetAddr {
    /// Port number
    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }
}

/// `host:port`, with IPv6 literals bracketed
impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

/// Read a request
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
pub async fn parse_command<S>(stream: &mut S) -> Result<(SocksCommand, TargetAddr)>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    stream
        .read_exact(&mut header)
        .await
        .with_context(|| "Failed to read command header")?;

    let version = header[0];
    let cmd_byte = header[1];
    let addr_type = header[3];

    if version != SOCKS5_VERSION {
        return Err(Socks5Error::UnsupportedVersion(version).into());
    }
    let command =
        SocksCommand::from_byte(cmd_byte).ok_or(Socks5Error::CommandNotSupported(cmd_byte))?;
    let target = parse_address(stream, addr_type).await?;

    tracing::debug!("Parsed SOCKS5 command: {} to {}", command, target);
    Ok((command, target))
}

async fn parse_address<S>(stream: &mut S, addr_type: u8) -> Result<TargetAddr>
where
    S: AsyncRead + Unpin,
{
    match addr_type {
        SOCKS5_ADDR_TYPE_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            let port = stream.read_u16().await?;
            Ok(TargetAddr::Ip(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::from(addr)),
                port,
            )))
        }
        SOCKS5_ADDR_TYPE_DOMAIN => {
            let domain_len = stream.read_u8().await? as usize;
            if domain_len == 0 || domain_len > MAX_DOMAIN_LEN {
                bail!("Invalid domain length: {}", domain_len);
            }
            let mut domain = vec![0u8; domain_len];
            stream.read_exact(&mut domain).await?;
            let domain = String::from_utf8(domain)
                .map_err(|e| Socks5Error::InvalidDomain(e.to_string()))?;
            let port = stream.read_u16().await?;
            Ok(TargetAddr::Domain(domain, port))
        }
        SOCKS5_ADDR_TYPE_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            let port = stream.read_u16().await?;
            Ok(TargetAddr::Ip(SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(addr)),
                port,
            )))
        }
        _ => Err(Socks5Error::AddressTypeNotSupported(addr_type).into()),
    }
}

/// Send a reply with an unspecified bound address
pub async fn send_reply<S>(stream: &mut S, code: Socks5ReplyCode) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&build_reply(code, None)).await?;
    stream.flush().await?;
    Ok(())
}

/// Encode a reply (`0.0.0.0:0` when no bound address is given)
pub fn build_reply(code: Socks5ReplyCode, bind_addr: Option<SocketAddr>) -> Vec<u8> {
    let bind_addr =
        bind_addr.unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));

    let mut reply = vec![SOCKS5_VERSION, code.into(), SOCKS5_RESERVED];
    match bind_addr {
        SocketAddr::V4(addr) => {
            reply.push(SOCKS5_ADDR_TYPE_IPV4);
            reply.extend_from_slice(&addr.ip().octets());
            reply.extend_from_slice(&addr.port().to_be_bytes());
        }
        SocketAddr::V6(addr) => {
            reply.push(SOCKS5_ADDR_TYPE_IPV6);
            reply.extend_from_slice(&addr.ip().octets());
            reply.extend_from_slice(&addr.port().to_be_bytes());
        }
    }
    reply
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn request(command: u8, addr: &[u8]) -> Vec<u8> {
        let mut data = vec![SOCKS5_VERSION, command, SOCKS5_RESERVED];
        data.extend_from_slice(addr);
        data
    }

    #[tokio::test]
    async fn test_parse_ipv4() {
        let data = request(SOCKS5_CMD_TCP_CONNECT, &[SOCKS5_ADDR_TYPE_IPV4, 10, 0, 0, 1, 0, 22]);
        let (cmd, target) = parse_command(&mut Cursor::new(data)).await.unwrap();
        assert_eq!(cmd, SocksCommand::Connect);
        assert_eq!(target.to_string(), "10.0.0.1:22");
    }

    #[tokio::test]
    async fn test_parse_domain() {
        let mut addr = vec![SOCKS5_ADDR_TYPE_DOMAIN, 11];
        addr.extend_from_slice(b"example.com");
        addr.extend_from_slice(&80u16.to_be_bytes());
        let data = request(SOCKS5_CMD_TCP_CONNECT, &addr);

        let (_, target) = parse_command(&mut Cursor::new(data)).await.unwrap();
        assert_eq!(target, TargetAddr::Domain("example.com".to_string(), 80));
        assert_eq!(target.to_string(), "example.com:80");
    }

    #[tokio::test]
    async fn test_parse_ipv6_display_is_bracketed() {
        let mut addr = vec![SOCKS5_ADDR_TYPE_IPV6];
        addr.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        addr.extend_from_slice(&443u16.to_be_bytes());
        let data = request(SOCKS5_CMD_TCP_CONNECT, &addr);

        let (_, target) = parse_command(&mut Cursor::new(data)).await.unwrap();
        assert_eq!(target.to_string(), "[::1]:443");
        assert_eq!(target.port(), 443);
    }

    #[tokio::test]
    async fn test_parse_bind_and_udp() {
        let data = request(SOCKS5_CMD_TCP_BIND, &[SOCKS5_ADDR_TYPE_IPV4, 0, 0, 0, 0, 0, 0]);
        let (cmd, _) = parse_command(&mut Cursor::new(data)).await.unwrap();
        assert_eq!(cmd, SocksCommand::Bind);

        let data = request(
            SOCKS5_CMD_UDP_ASSOCIATE,
            &[SOCKS5_ADDR_TYPE_IPV4, 0, 0, 0, 0, 0, 0],
        );
        let (cmd, _) = parse_command(&mut Cursor::new(data)).await.unwrap();
        assert_eq!(cmd, SocksCommand::UdpAssociate);
    }

    #[tokio::test]
    async fn test_parse_unknown_address_type() {
        let data = request(SOCKS5_CMD_TCP_CONNECT, &[0x09, 0, 0]);
        let err = parse_command(&mut Cursor::new(data)).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Socks5Error>(),
            Some(Socks5Error::AddressTypeNotSupported(0x09))
        ));
    }

    #[tokio::test]
    async fn test_parse_unknown_command() {
        let data = request(0x99, &[SOCKS5_ADDR_TYPE_IPV4, 0, 0, 0, 0, 0, 0]);
        let err = parse_command(&mut Cursor::new(data)).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Socks5Error>(),
            Some(Socks5Error::CommandNotSupported(0x99))
        ));
    }

    #[test]
    fn test_build_reply() {
        let reply = build_reply(Socks5ReplyCode::Succeeded, None);
        assert_eq!(
            reply,
            vec![SOCKS5_VERSION, 0x00, SOCKS5_RESERVED, SOCKS5_ADDR_TYPE_IPV4, 0, 0, 0, 0, 0, 0]
        );

        let bound: SocketAddr = "[::1]:8080".parse().unwrap();
        let reply = build_reply(Socks5ReplyCode::HostUnreachable, Some(bound));
        assert_eq!(reply[1], 0x04);
        assert_eq!(reply[3], SOCKS5_ADDR_TYPE_IPV6);
        assert_eq!(reply.len(), 4 + 16 + 2);
    }
}
