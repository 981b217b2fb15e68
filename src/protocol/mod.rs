//! Protocol module for Tetherd
//!
//! Link handshake and the per-stream request header exchanged between
//! agents. Frames themselves live in [`crate::mux::frame`].

mod codec;
mod digest;
pub mod handshake;
mod types;

pub use codec::{
    read_ack, read_auth, read_challenge, read_hello, read_request, read_status, write_ack,
    write_auth, write_challenge, write_hello, write_request, write_status, MAX_MESSAGE_LEN,
};
pub use digest::digest;
pub use types::{
    Ack, Auth, Challenge, Digest, Hello, StreamRequest, CURRENT_PROTO_VERSION,
    HASH_WIDTH_IN_BYTES,
};
