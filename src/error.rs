//! Error types for Tetherd
//!
//! This module defines the error taxonomy shared by the multiplexing core,
//! the tether pools, the router and the listeners.

use std::io;
use thiserror::Error;

/// Main error type for Tetherd operations
#[derive(Error, Debug)]
pub enum TetherError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A transport link could not be established
    #[error("Dial failure: {0}")]
    DialFailure(String),

    /// Handshake or listener credential mismatch
    #[error("Authentication failure: {0}")]
    AuthFailure(String),

    /// The transport link under a session stopped working
    #[error("Link dead")]
    LinkDead,

    /// The session is gone and will accept no more streams
    #[error("Session closed")]
    SessionClosed,

    /// Routing table has no entry for the key and no wildcard
    #[error("No route for key: {0}")]
    NoRoute(String),

    /// No healthy session is available to open a stream
    #[error("Pool exhausted: {0}")]
    PoolExhausted(String),

    /// Malformed frame or protocol message
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The peer (or we) aborted the stream
    #[error("Stream reset")]
    StreamReset,

    /// Write attempted after the local side was closed
    #[error("Stream closed")]
    StreamClosed,

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// SOCKS5 protocol error
    #[error("SOCKS5 error: {0}")]
    Socks5(#[from] Socks5Error),
}

impl TetherError {
    /// Wrap into an `io::Error` so it can travel through `AsyncRead`/`AsyncWrite`.
    pub fn into_io(self) -> io::Error {
        let kind = match &self {
            TetherError::Io(e) => e.kind(),
            TetherError::LinkDead => io::ErrorKind::ConnectionAborted,
            TetherError::StreamReset => io::ErrorKind::ConnectionReset,
            TetherError::StreamClosed => io::ErrorKind::BrokenPipe,
            TetherError::Timeout(_) => io::ErrorKind::TimedOut,
            TetherError::ProtocolViolation(_) => io::ErrorKind::InvalidData,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, self)
    }

    /// Recover a `TetherError` that was wrapped by [`TetherError::into_io`].
    pub fn from_io(err: &io::Error) -> Option<&TetherError> {
        err.get_ref()
            .and_then(|inner| inner.downcast_ref::<TetherError>())
    }

    /// True if the io error carries `LinkDead`.
    pub fn is_link_dead(err: &io::Error) -> bool {
        matches!(TetherError::from_io(err), Some(TetherError::LinkDead))
    }
}

/// SOCKS5 specific errors
#[derive(Error, Debug)]
pub enum Socks5Error {
    /// Unsupported SOCKS version
    #[error("Unsupported SOCKS version: {0}")]
    UnsupportedVersion(u8),

    /// No acceptable authentication method
    #[error("No acceptable authentication method")]
    NoAcceptableMethod,

    /// Authentication failed
    #[error("Authentication failed")]
    AuthFailed,

    /// Command not supported
    #[error("Command not supported: {0}")]
    CommandNotSupported(u8),

    /// Address type not supported
    #[error("Address type not supported: {0}")]
    AddressTypeNotSupported(u8),

    /// General SOCKS server failure
    #[error("General SOCKS server failure")]
    GeneralFailure,

    /// Invalid domain name
    #[error("Invalid domain name: {0}")]
    InvalidDomain(String),

    /// The far end of a tether answered a stream request with a failure
    #[error("Remote agent refused the request: {0:?}")]
    Refused(Socks5ReplyCode),
}

/// Reply codes for SOCKS5 protocol
///
/// The same codes are used as the one-byte status a stream responder
/// sends back to the opener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Socks5ReplyCode {
    /// Command succeeded
    Succeeded = 0x00,
    /// General SOCKS server failure
    GeneralFailure = 0x01,
    /// Connection not allowed by ruleset
    ConnectionNotAllowed = 0x02,
    /// Network unreachable
    NetworkUnreachable = 0x03,
    /// Host unreachable
    HostUnreachable = 0x04,
    /// Connection refused
    ConnectionRefused = 0x05,
    /// TTL expired
    TtlExpired = 0x06,
    /// Command not supported
    CommandNotSupported = 0x07,
    /// Address type not supported
    AddressTypeNotSupported = 0x08,
}

impl From<Socks5ReplyCode> for u8 {
    fn from(code: Socks5ReplyCode) -> Self {
        code as u8
    }
}

impl TryFrom<u8> for Socks5ReplyCode {
    type Error = Socks5Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Socks5ReplyCode::Succeeded),
            0x01 => Ok(Socks5ReplyCode::GeneralFailure),
            0x02 => Ok(Socks5ReplyCode::ConnectionNotAllowed),
            0x03 => Ok(Socks5ReplyCode::NetworkUnreachable),
            0x04 => Ok(Socks5ReplyCode::HostUnreachable),
            0x05 => Ok(Socks5ReplyCode::ConnectionRefused),
            0x06 => Ok(Socks5ReplyCode::TtlExpired),
            0x07 => Ok(Socks5ReplyCode::CommandNotSupported),
            0x08 => Ok(Socks5ReplyCode::AddressTypeNotSupported),
            _ => Err(Socks5Error::GeneralFailure),
        }
    }
}

impl From<&io::Error> for Socks5ReplyCode {
    fn from(err: &io::Error) -> Self {
        if let Some(inner) = TetherError::from_io(err) {
            return Socks5ReplyCode::from(inner);
        }
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Socks5ReplyCode::ConnectionRefused,
            io::ErrorKind::TimedOut => Socks5ReplyCode::HostUnreachable,
            io::ErrorKind::AddrNotAvailable => Socks5ReplyCode::HostUnreachable,
            io::ErrorKind::NotFound => Socks5ReplyCode::HostUnreachable,
            _ => Socks5ReplyCode::GeneralFailure,
        }
    }
}

impl From<&TetherError> for Socks5ReplyCode {
    fn from(err: &TetherError) -> Self {
        match err {
            TetherError::Io(e) => Socks5ReplyCode::from(e),
            TetherError::NoRoute(_) | TetherError::AuthFailure(_) => {
                Socks5ReplyCode::ConnectionNotAllowed
            }
            TetherError::PoolExhausted(_)
            | TetherError::LinkDead
            | TetherError::SessionClosed
            | TetherError::DialFailure(_) => Socks5ReplyCode::NetworkUnreachable,
            TetherError::Timeout(_) => Socks5ReplyCode::TtlExpired,
            TetherError::Socks5(Socks5Error::CommandNotSupported(_)) => {
                Socks5ReplyCode::CommandNotSupported
            }
            TetherError::Socks5(Socks5Error::AddressTypeNotSupported(_)) => {
                Socks5ReplyCode::AddressTypeNotSupported
            }
            TetherError::Socks5(Socks5Error::Refused(code)) => *code,
            _ => Socks5ReplyCode::GeneralFailure,
        }
    }
}

/// Best-effort reply code for a contextual error chain.
pub fn reply_code_for(err: &anyhow::Error) -> Socks5ReplyCode {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<TetherError>() {
            return Socks5ReplyCode::from(e);
        }
        if let Some(e) = cause.downcast_ref::<io::Error>() {
            return Socks5ReplyCode::from(e);
        }
    }
    Socks5ReplyCode::GeneralFailure
}
