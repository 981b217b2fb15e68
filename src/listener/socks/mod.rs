//! SOCKS5 listener
//!
//! RFC 1928 CONNECT with optional RFC 1929 username/password
//! authentication. The authenticated user name (or the listener identity)
//! is the routing key.

mod auth;
pub mod consts;
mod handler;
mod request;

pub use auth::{authenticate_password, negotiate, AuthMethod};
pub use handler::handle_socks5;
pub use request::{build_reply, parse_command, SocksCommand, TargetAddr};
