//! Logical streams multiplexed over one session
//!
//! A [`LogicalStream`] is a byte pipe identified by its stream id. Inbound
//! DATA is buffered per stream by the session reader (bounded by the receive
//! window) and drained by `poll_read`. Writes consume send credit granted by
//! the peer and suspend only this stream when the credit runs out.

use super::frame::Frame;
use super::session::SessionInner;
use super::{lock, STREAM_WINDOW};
use crate::error::TetherError;
use bytes::{Buf, Bytes};
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

#[derive(Debug)]
struct StreamState {
    recv_buf: VecDeque<Bytes>,
    /// Bytes the peer may still send before a window update
    recv_window: u32,
    /// Bytes drained since the last window update
    consumed: u32,
    send_credit: u32,
    local_closed: bool,
    remote_closed: bool,
    reset: bool,
    link_dead: bool,
    death_reported: bool,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

impl StreamState {
    fn wake_all(&mut self) {
        if let Some(w) = self.read_waker.take() {
            w.wake();
        }
        if let Some(w) = self.write_waker.take() {
            w.wake();
        }
    }

    /// `LinkDead` for the first caller after death, `None` afterwards.
    fn take_death(&mut self) -> Option<io::Error> {
        if self.death_reported {
            None
        } else {
            self.death_reported = true;
            Some(TetherError::LinkDead.into_io())
        }
    }
}

/// State shared between a stream handle and the session reader
#[derive(Debug)]
pub(crate) struct StreamShared {
    id: u32,
    state: Mutex<StreamState>,
}

/// Outcome of delivering inbound data
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Delivery {
    Accepted,
    Ignored,
    WindowExceeded,
}

impl StreamShared {
    pub(crate) fn new(id: u32) -> Self {
        StreamShared {
            id,
            state: Mutex::new(StreamState {
                recv_buf: VecDeque::new(),
                recv_window: STREAM_WINDOW,
                consumed: 0,
                send_credit: STREAM_WINDOW,
                local_closed: false,
                remote_closed: false,
                reset: false,
                link_dead: false,
                death_reported: false,
                read_waker: None,
                write_waker: None,
            }),
        }
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn push_data(&self, payload: Bytes) -> Delivery {
        let mut st = lock(&self.state);
        if st.reset || st.remote_closed {
            return Delivery::Ignored;
        }
        let len = payload.len() as u32;
        if len > st.recv_window {
            return Delivery::WindowExceeded;
        }
        st.recv_window -= len;
        if !payload.is_empty() {
            st.recv_buf.push_back(payload);
        }
        if let Some(w) = st.read_waker.take() {
            w.wake();
        }
        Delivery::Accepted
    }

    /// Returns true once both directions are closed.
    pub(crate) fn on_remote_close(&self) -> bool {
        let mut st = lock(&self.state);
        st.remote_closed = true;
        if let Some(w) = st.read_waker.take() {
            w.wake();
        }
        st.local_closed
    }

    pub(crate) fn on_reset(&self) {
        let mut st = lock(&self.state);
        st.reset = true;
        st.recv_buf.clear();
        st.wake_all();
    }

    pub(crate) fn on_window(&self, increment: u32) {
        let mut st = lock(&self.state);
        st.send_credit = st.send_credit.saturating_add(increment);
        if let Some(w) = st.write_waker.take() {
            w.wake();
        }
    }

    pub(crate) fn on_link_dead(&self) {
        let mut st = lock(&self.state);
        if st.link_dead {
            return;
        }
        st.link_dead = true;
        st.wake_all();
    }
}

/// A virtual bidirectional byte channel over a multiplex session
pub struct LogicalStream {
    shared: Arc<StreamShared>,
    session: Arc<SessionInner>,
}

impl std::fmt::Debug for LogicalStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalStream")
            .field("id", &self.shared.id)
            .finish()
    }
}

impl LogicalStream {
    pub(crate) fn new(shared: Arc<StreamShared>, session: Arc<SessionInner>) -> Self {
        LogicalStream { shared, session }
    }

    /// Stream id within its session
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    /// Identity of the peer agent, when the link was authenticated
    pub fn peer_identity(&self) -> Option<&str> {
        self.session.peer_identity()
    }

    /// Half-close: send CLOSE once. Later writes fail, reads keep draining.
    pub fn close(&self) {
        let fully_closed = {
            let mut st = lock(&self.shared.state);
            if st.local_closed || st.reset || st.link_dead {
                return;
            }
            st.local_closed = true;
            if let Some(w) = st.write_waker.take() {
                w.wake();
            }
            st.remote_closed
        };
        self.session.send_frame(Frame::close(self.shared.id));
        if fully_closed {
            self.session.remove_stream(self.shared.id);
        }
    }

    /// Abort the stream in both directions and discard buffered data.
    pub fn reset(&self) {
        {
            let mut st = lock(&self.shared.state);
            if st.reset || st.link_dead || (st.local_closed && st.remote_closed) {
                return;
            }
            st.reset = true;
            st.recv_buf.clear();
            st.wake_all();
        }
        self.session.send_frame(Frame::reset(self.shared.id));
        self.session.remove_stream(self.shared.id);
    }
}

impl AsyncRead for LogicalStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut grant = None;
        let result = {
            let mut st = lock(&self.shared.state);
            if st.reset {
                return Poll::Ready(Err(TetherError::StreamReset.into_io()));
            }

            if let Some(chunk) = st.recv_buf.front_mut() {
                let n = chunk.len().min(buf.remaining());
                buf.put_slice(&chunk[..n]);
                chunk.advance(n);
                if chunk.is_empty() {
                    st.recv_buf.pop_front();
                }
                st.consumed += n as u32;
                if st.consumed >= STREAM_WINDOW / 2 && !st.remote_closed && !st.link_dead {
                    let increment = st.consumed;
                    st.consumed = 0;
                    st.recv_window += increment;
                    grant = Some(increment);
                }
                Poll::Ready(Ok(()))
            } else if st.remote_closed {
                Poll::Ready(Ok(()))
            } else if st.link_dead {
                match st.take_death() {
                    Some(err) => Poll::Ready(Err(err)),
                    None => Poll::Ready(Ok(())),
                }
            } else {
                st.read_waker = Some(cx.waker().clone());
                Poll::Pending
            }
        };

        if let Some(increment) = grant {
            self.session
                .send_frame(Frame::window(self.shared.id, increment));
        }
        result
    }
}

impl AsyncWrite for LogicalStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let n = {
            let mut st = lock(&self.shared.state);
            if st.reset {
                return Poll::Ready(Err(TetherError::StreamReset.into_io()));
            }
            if st.link_dead {
                let err = st
                    .take_death()
                    .unwrap_or_else(|| TetherError::StreamClosed.into_io());
                return Poll::Ready(Err(err));
            }
            if st.local_closed {
                return Poll::Ready(Err(TetherError::StreamClosed.into_io()));
            }
            if buf.is_empty() {
                return Poll::Ready(Ok(0));
            }
            if st.send_credit == 0 {
                st.write_waker = Some(cx.waker().clone());
                return Poll::Pending;
            }
            let n = buf
                .len()
                .min(st.send_credit as usize)
                .min(self.session.max_payload());
            st.send_credit -= n as u32;
            n
        };

        let frame = Frame::data(self.shared.id, Bytes::copy_from_slice(&buf[..n]));
        if self.session.send_frame(frame) {
            Poll::Ready(Ok(n))
        } else {
            self.shared.on_link_dead();
            let mut st = lock(&self.shared.state);
            let err = st
                .take_death()
                .unwrap_or_else(|| TetherError::StreamClosed.into_io());
            Poll::Ready(Err(err))
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.close();
        Poll::Ready(Ok(()))
    }
}

impl Drop for LogicalStream {
    fn drop(&mut self) {
        let frame = {
            let st = lock(&self.shared.state);
            if st.reset || st.link_dead {
                None
            } else if !st.remote_closed {
                Some(Frame::reset(self.shared.id))
            } else if !st.local_closed {
                Some(Frame::close(self.shared.id))
            } else {
                None
            }
        };
        if let Some(frame) = frame {
            self.session.send_frame(frame);
        }
        self.session.remove_stream(self.shared.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_data_respects_window() {
        let shared = StreamShared::new(1);
        assert_eq!(
            shared.push_data(Bytes::from(vec![0u8; STREAM_WINDOW as usize])),
            Delivery::Accepted
        );
        assert_eq!(
            shared.push_data(Bytes::from_static(b"x")),
            Delivery::WindowExceeded
        );
    }

    #[test]
    fn test_data_after_close_or_reset_ignored() {
        let shared = StreamShared::new(3);
        assert!(!shared.on_remote_close());
        assert_eq!(shared.push_data(Bytes::from_static(b"late")), Delivery::Ignored);

        let shared = StreamShared::new(5);
        shared.on_reset();
        assert_eq!(shared.push_data(Bytes::from_static(b"late")), Delivery::Ignored);
    }

    #[test]
    fn test_death_reported_once() {
        let shared = StreamShared::new(7);
        shared.on_link_dead();
        let mut st = lock(&shared.state);
        assert!(st.take_death().is_some());
        assert!(st.take_death().is_none());
    }

    #[test]
    fn test_window_credit_saturates() {
        let shared = StreamShared::new(9);
        shared.on_window(u32::MAX);
        assert_eq!(lock(&shared.state).send_credit, u32::MAX);
    }
}
