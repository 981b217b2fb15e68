//! Protocol type definitions
//!
//! Messages exchanged on a fresh transport link before the multiplex session
//! starts, and the header that opens every logical stream.

use serde::{Deserialize, Serialize};

/// Hash width in bytes (SHA-256 produces 32 bytes)
pub const HASH_WIDTH_IN_BYTES: usize = 32;

/// Protocol version type
type ProtocolVersion = u8;

/// Current protocol version
pub const CURRENT_PROTO_VERSION: ProtocolVersion = 1;

/// Digest type (32-byte SHA-256 hash)
pub type Digest = [u8; HASH_WIDTH_IN_BYTES];

/// First message of a link, sent by the dialing agent
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Hello {
    /// Protocol version spoken by the dialer
    pub version: ProtocolVersion,
    /// Identity the dialer claims
    pub client_id: String,
}

impl Hello {
    /// Hello for the current protocol version
    pub fn new(client_id: &str) -> Self {
        Hello {
            version: CURRENT_PROTO_VERSION,
            client_id: client_id.to_string(),
        }
    }
}

/// Random nonce the accepting agent challenges the dialer with
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Challenge(pub Digest);

impl Challenge {
    /// Fresh random challenge
    pub fn random() -> Self {
        Challenge(rand::random())
    }
}

/// Authentication message
///
/// `sha256(secret || nonce)`, sent by the dialer after the challenge.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Auth(pub Digest);

impl Auth {
    /// Create a new auth message from secret and nonce
    pub fn new(secret: &str, nonce: &Digest) -> Self {
        let mut concat = Vec::from(secret.as_bytes());
        concat.extend_from_slice(nonce);
        Auth(super::digest::digest(&concat))
    }
}

/// Acknowledgment message closing the handshake
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub enum Ack {
    /// Authentication successful
    Ok,
    /// Unknown client or wrong secret
    AuthFailed,
    /// Peer speaks another protocol version
    VersionMismatch,
}

impl std::fmt::Display for Ack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Ack::Ok => "Ok",
                Ack::AuthFailed => "Incorrect client id or secret",
                Ack::VersionMismatch => "Protocol version mismatch",
            }
        )
    }
}

/// Header written by the opener of every logical stream
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct StreamRequest {
    /// Routing key the far end resolves with
    pub identity: String,
    /// `host:port` to reach when the far end terminates locally
    pub target: Option<String>,
}

impl StreamRequest {
    /// New request
    pub fn new(identity: impl Into<String>, target: Option<String>) -> Self {
        StreamRequest {
            identity: identity.into(),
            target,
        }
    }
}
