//! Multiplex session over one transport link
//!
//! A session owns exactly one transport link and runs three tasks:
//! a reader demultiplexing inbound frames into per-stream buffers, a writer
//! serializing every outbound frame through one FIFO queue (so frames are
//! never torn and per-stream order is kept), and a keep-alive timer.
//!
//! Stream ids are partitioned by role: the dialing side allocates odd ids
//! starting at 1, the accepting side even ids starting at 2. Both sides
//! number independently without coordination, and a fresh link after a
//! reconnect starts a fresh session, so ids never need to survive a link.

use super::frame::{Frame, FrameCodec, FrameType};
use super::lock;
use super::stream::{Delivery, LogicalStream, StreamShared};
use crate::config::MuxConfig;
use crate::error::TetherError;
use bytes::BytesMut;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::{Encoder, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Largest batch of frames coalesced into one write
const WRITE_BATCH_BYTES: usize = 64 * 1024;

/// Which end of the link this session is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dialed the link; allocates odd stream ids
    Client,
    /// Accepted the link; allocates even stream ids
    Server,
}

impl Role {
    fn first_id(self) -> u32 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    /// True if `id` belongs to this role's id space
    pub fn owns(self, id: u32) -> bool {
        match self {
            Role::Client => id % 2 == 1,
            Role::Server => id != 0 && id % 2 == 0,
        }
    }
}

pub(crate) struct SessionInner {
    role: Role,
    peer: Option<String>,
    max_payload: u32,
    streams: Mutex<HashMap<u32, Arc<StreamShared>>>,
    next_id: AtomicU32,
    frames: mpsc::UnboundedSender<Frame>,
    cancel: CancellationToken,
    dead: AtomicBool,
    started: Instant,
    last_recv_ms: AtomicU64,
}

impl SessionInner {
    pub(crate) fn send_frame(&self, frame: Frame) -> bool {
        self.frames.send(frame).is_ok()
    }

    pub(crate) fn remove_stream(&self, id: u32) {
        lock(&self.streams).remove(&id);
    }

    pub(crate) fn max_payload(&self) -> usize {
        self.max_payload as usize
    }

    pub(crate) fn peer_identity(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        let ms = self.started.elapsed().as_millis() as u64;
        self.last_recv_ms.store(ms, Ordering::Relaxed);
    }

    fn idle(&self) -> Duration {
        let last = Duration::from_millis(self.last_recv_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }

    /// Tear the session down. Idempotent.
    fn die(&self, reason: &str) {
        if self.dead.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(role = ?self.role, peer = ?self.peer, "Session closed: {}", reason);
        self.cancel.cancel();

        let streams: Vec<Arc<StreamShared>> =
            lock(&self.streams).drain().map(|(_, s)| s).collect();
        for stream in streams {
            stream.on_link_dead();
        }
    }

    fn allocate_id(&self) -> Result<u32, TetherError> {
        self.next_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| id.checked_add(2))
            .map_err(|_| TetherError::ProtocolViolation("stream ids exhausted".to_string()))
    }

    fn handle_frame(
        self: &Arc<Self>,
        frame: Frame,
        accept_tx: &mpsc::Sender<LogicalStream>,
    ) -> Result<(), TetherError> {
        let id = frame.stream_id;
        match frame.frame_type {
            FrameType::Open => self.handle_open(id, accept_tx),
            FrameType::Data => {
                let stream = lock(&self.streams).get(&id).cloned();
                if let Some(stream) = stream {
                    if stream.push_data(frame.payload) == Delivery::WindowExceeded {
                        warn!(stream_id = id, "Peer exceeded stream window, resetting stream");
                        lock(&self.streams).remove(&id);
                        stream.on_reset();
                        self.send_frame(Frame::reset(id));
                    }
                } else {
                    trace!(stream_id = id, "DATA for unknown stream ignored");
                }
                Ok(())
            }
            FrameType::Close => {
                let stream = lock(&self.streams).get(&id).cloned();
                if let Some(stream) = stream {
                    if stream.on_remote_close() {
                        self.remove_stream(id);
                    }
                }
                Ok(())
            }
            FrameType::Reset => {
                let stream = lock(&self.streams).remove(&id);
                if let Some(stream) = stream {
                    stream.on_reset();
                }
                Ok(())
            }
            FrameType::Window => {
                let increment = frame.window_increment()?;
                let stream = lock(&self.streams).get(&id).cloned();
                if let Some(stream) = stream {
                    stream.on_window(increment);
                }
                Ok(())
            }
            FrameType::Ping => {
                self.send_frame(Frame::pong(frame.payload));
                Ok(())
            }
            FrameType::Pong => Ok(()),
        }
    }

    fn handle_open(
        self: &Arc<Self>,
        id: u32,
        accept_tx: &mpsc::Sender<LogicalStream>,
    ) -> Result<(), TetherError> {
        if id == 0 || self.role.owns(id) {
            return Err(TetherError::ProtocolViolation(format!(
                "peer opened stream {} outside its id space",
                id
            )));
        }

        let shared = Arc::new(StreamShared::new(id));
        {
            let mut streams = lock(&self.streams);
            if streams.contains_key(&id) {
                return Err(TetherError::ProtocolViolation(format!(
                    "peer reopened live stream {}",
                    id
                )));
            }
            if self.is_dead() {
                return Ok(());
            }
            streams.insert(id, shared.clone());
        }

        let stream = LogicalStream::new(shared, self.clone());
        match accept_tx.try_send(stream) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(stream)) => {
                warn!(stream_id = id, "Accept backlog full, resetting inbound stream");
                stream.reset();
            }
            Err(mpsc::error::TrySendError::Closed(stream)) => stream.reset(),
        }
        Ok(())
    }
}

/// A multiplex session
///
/// Cheap to clone; all clones refer to the same link.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
    accept_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<LogicalStream>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.inner.role)
            .field("peer", &self.inner.peer)
            .field("dead", &self.is_dead())
            .finish()
    }
}

impl Session {
    /// Start a session on `link`. Must be called within a tokio runtime.
    pub fn new<L>(link: L, role: Role, config: &MuxConfig) -> Session
    where
        L: AsyncRead + AsyncWrite + Send + 'static,
    {
        Session::start(link, role, config, None)
    }

    /// Start a session whose peer proved `peer` as its identity
    pub fn authenticated<L>(link: L, role: Role, config: &MuxConfig, peer: String) -> Session
    where
        L: AsyncRead + AsyncWrite + Send + 'static,
    {
        Session::start(link, role, config, Some(peer))
    }

    fn start<L>(link: L, role: Role, config: &MuxConfig, peer: Option<String>) -> Session
    where
        L: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog.max(1));

        let inner = Arc::new(SessionInner {
            role,
            peer,
            max_payload: config.max_frame_payload,
            streams: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(role.first_id()),
            frames: frames_tx,
            cancel: CancellationToken::new(),
            dead: AtomicBool::new(false),
            started: Instant::now(),
            last_recv_ms: AtomicU64::new(0),
        });

        let (reader, writer) = tokio::io::split(link);

        let reader_inner = inner.clone();
        let max_payload = config.max_frame_payload;
        tokio::spawn(async move {
            let cancel = reader_inner.cancel.clone();
            let result = tokio::select! {
                r = read_loop(&reader_inner, reader, max_payload, accept_tx) => r,
                _ = cancel.cancelled() => Ok(()),
            };
            match result {
                Ok(()) => reader_inner.die("reader stopped"),
                Err(e) => reader_inner.die(&e.to_string()),
            }
        });

        let writer_inner = inner.clone();
        tokio::spawn(async move {
            let cancel = writer_inner.cancel.clone();
            let result = tokio::select! {
                r = write_loop(writer, frames_rx, max_payload) => r,
                _ = cancel.cancelled() => Ok(()),
            };
            if let Err(e) = result {
                writer_inner.die(&format!("write failed: {}", e));
            }
        });

        let keepalive_inner = inner.clone();
        let interval = config.keepalive_interval();
        let timeout = config.keepalive_timeout();
        tokio::spawn(async move {
            let cancel = keepalive_inner.cancel.clone();
            tokio::select! {
                _ = keepalive_loop(&keepalive_inner, interval, timeout) => {}
                _ = cancel.cancelled() => {}
            }
        });

        Session {
            inner,
            accept_rx: Arc::new(tokio::sync::Mutex::new(accept_rx)),
        }
    }

    /// Open a new logical stream
    ///
    /// OPEN is queued immediately; data may be written right away.
    pub fn open(&self) -> Result<LogicalStream, TetherError> {
        if self.inner.is_dead() {
            return Err(TetherError::LinkDead);
        }
        let id = self.inner.allocate_id()?;
        let shared = Arc::new(StreamShared::new(id));
        {
            let mut streams = lock(&self.inner.streams);
            if self.inner.is_dead() {
                return Err(TetherError::LinkDead);
            }
            streams.insert(id, shared.clone());
        }
        if !self.inner.send_frame(Frame::open(id)) {
            self.inner.remove_stream(id);
            return Err(TetherError::LinkDead);
        }
        trace!(stream_id = id, "Opened stream");
        Ok(LogicalStream::new(shared, self.inner.clone()))
    }

    /// Wait for the next stream opened by the peer
    ///
    /// Fails with `SessionClosed` once the link is dead.
    pub async fn accept_next(&self) -> Result<LogicalStream, TetherError> {
        if self.inner.is_dead() {
            return Err(TetherError::SessionClosed);
        }
        let mut rx = self.accept_rx.lock().await;
        tokio::select! {
            stream = rx.recv() => stream.ok_or(TetherError::SessionClosed),
            _ = self.inner.cancel.cancelled() => Err(TetherError::SessionClosed),
        }
    }

    /// Close the link; every open stream observes `LinkDead`
    pub fn close(&self) {
        self.inner.die("closed locally");
    }

    /// True once the link is known broken or closed
    pub fn is_dead(&self) -> bool {
        self.inner.is_dead()
    }

    /// Resolves when the session dies
    pub async fn closed(&self) {
        self.inner.cancel.cancelled().await
    }

    /// Number of streams currently tracked
    pub fn stream_count(&self) -> usize {
        lock(&self.inner.streams).len()
    }

    /// This end's role
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Identity the peer authenticated with, if any
    pub fn peer_identity(&self) -> Option<&str> {
        self.inner.peer_identity()
    }

    /// True if both handles refer to the same session
    pub fn same_as(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    #[cfg(test)]
    pub(crate) fn exhaust_ids(&self) {
        self.inner.next_id.store(u32::MAX, Ordering::SeqCst);
    }
}

async fn read_loop<R>(
    inner: &Arc<SessionInner>,
    reader: R,
    max_payload: u32,
    accept_tx: mpsc::Sender<LogicalStream>,
) -> Result<(), TetherError>
where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(reader, FrameCodec::new(max_payload));
    while let Some(frame) = frames.next().await {
        let frame = frame?;
        inner.touch();
        inner.handle_frame(frame, &accept_tx)?;
    }
    Err(TetherError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "peer closed the link",
    )))
}

async fn write_loop<W>(
    mut writer: W,
    mut frames: mpsc::UnboundedReceiver<Frame>,
    max_payload: u32,
) -> Result<(), TetherError>
where
    W: AsyncWrite + Unpin,
{
    let mut codec = FrameCodec::new(max_payload);
    let mut buf = BytesMut::with_capacity(WRITE_BATCH_BYTES);
    while let Some(frame) = frames.recv().await {
        codec.encode(frame, &mut buf)?;
        while buf.len() < WRITE_BATCH_BYTES {
            match frames.try_recv() {
                Ok(frame) => codec.encode(frame, &mut buf)?,
                Err(_) => break,
            }
        }
        writer.write_all(&buf).await?;
        writer.flush().await?;
        buf.clear();
    }
    let _ = writer.shutdown().await;
    Ok(())
}

async fn keepalive_loop(inner: &Arc<SessionInner>, interval: Duration, timeout: Duration) {
    let tick = (interval.min(timeout) / 4).max(Duration::from_millis(50));
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut pinged = false;
    let mut nonce: u64 = 0;

    loop {
        ticker.tick().await;
        let idle = inner.idle();
        if idle < interval {
            pinged = false;
            continue;
        }
        if idle >= interval + timeout {
            inner.die("keep-alive timeout");
            return;
        }
        if !pinged {
            nonce = nonce.wrapping_add(1);
            trace!(role = ?inner.role, "Link idle, sending PING");
            if !inner.send_frame(Frame::ping(nonce)) {
                return;
            }
            pinged = true;
        }
    }
}
