//! Stream multiplexing over transport links
//!
//! - [`frame`]: on-wire frame format and codec
//! - [`session`]: one session per transport link, opening and accepting streams
//! - [`stream`]: the logical stream handle (`AsyncRead + AsyncWrite`)

pub mod frame;
pub mod session;
pub mod stream;

pub use frame::{Frame, FrameCodec, FrameType, FRAME_HEADER_SIZE};
pub use session::{Role, Session};
pub use stream::LogicalStream;

use std::sync::{Mutex, MutexGuard};

/// Initial per-stream send credit and receive buffer bound
pub const STREAM_WINDOW: u32 = 256 * 1024;

/// Lock ignoring poisoning; the guarded state stays consistent per operation.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
