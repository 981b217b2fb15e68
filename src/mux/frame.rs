//! Frame codec for multiplexed transport links
//!
//! Frame format (big-endian):
//! ```text
//! +--------+--------+--------+--------+--------+
//! |            Stream ID (4B)         |  Type  |
//! +--------+--------+--------+--------+--------+
//! |            Length (4B)            |
//! +--------+--------+--------+--------+
//! |         Payload (Length bytes)    |
//! +-----------------------------------+
//! ```

use crate::error::TetherError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 9;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Declares a new stream id
    Open = 0x00,
    /// Payload chunk for an open stream
    Data = 0x01,
    /// Sender will write no more on this stream
    Close = 0x02,
    /// Abort the stream, discard buffered data
    Reset = 0x03,
    /// Keep-alive ping
    Ping = 0x04,
    /// Keep-alive answer
    Pong = 0x05,
    /// Grant more send credit for a stream
    Window = 0x06,
}

impl TryFrom<u8> for FrameType {
    type Error = TetherError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(FrameType::Open),
            0x01 => Ok(FrameType::Data),
            0x02 => Ok(FrameType::Close),
            0x03 => Ok(FrameType::Reset),
            0x04 => Ok(FrameType::Ping),
            0x05 => Ok(FrameType::Pong),
            0x06 => Ok(FrameType::Window),
            _ => Err(TetherError::ProtocolViolation(format!(
                "unknown frame type: {}",
                value
            ))),
        }
    }
}

/// A protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Stream ID (0 for link-level frames)
    pub stream_id: u32,
    /// Frame type
    pub frame_type: FrameType,
    /// Payload data
    pub payload: Bytes,
}

impl Frame {
    fn control(frame_type: FrameType, stream_id: u32) -> Self {
        Frame {
            stream_id,
            frame_type,
            payload: Bytes::new(),
        }
    }

    /// Open frame
    pub fn open(stream_id: u32) -> Self {
        Frame::control(FrameType::Open, stream_id)
    }

    /// Data frame
    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Frame {
            stream_id,
            frame_type: FrameType::Data,
            payload,
        }
    }

    /// Close frame
    pub fn close(stream_id: u32) -> Self {
        Frame::control(FrameType::Close, stream_id)
    }

    /// Reset frame
    pub fn reset(stream_id: u32) -> Self {
        Frame::control(FrameType::Reset, stream_id)
    }

    /// Ping frame carrying an opaque nonce
    pub fn ping(nonce: u64) -> Self {
        Frame {
            stream_id: 0,
            frame_type: FrameType::Ping,
            payload: Bytes::copy_from_slice(&nonce.to_be_bytes()),
        }
    }

    /// Pong frame echoing a ping payload
    pub fn pong(payload: Bytes) -> Self {
        Frame {
            stream_id: 0,
            frame_type: FrameType::Pong,
            payload,
        }
    }

    /// Window update granting `increment` bytes
    pub fn window(stream_id: u32, increment: u32) -> Self {
        Frame {
            stream_id,
            frame_type: FrameType::Window,
            payload: Bytes::copy_from_slice(&increment.to_be_bytes()),
        }
    }

    /// Increment carried by a window frame
    pub fn window_increment(&self) -> Result<u32, TetherError> {
        if self.payload.len() != 4 {
            return Err(TetherError::ProtocolViolation(format!(
                "window frame with {} byte payload",
                self.payload.len()
            )));
        }
        let mut buf = &self.payload[..];
        Ok(buf.get_u32())
    }

    /// Encoded size including the header
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    /// Append the encoded frame to `dst`
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u32(self.stream_id);
        dst.put_u8(self.frame_type as u8);
        dst.put_u32(self.payload.len() as u32);
        dst.extend_from_slice(&self.payload);
    }

    /// Decode one frame from `src`
    ///
    /// Returns `Ok(None)` until a whole frame is buffered. A declared length
    /// above `max_payload` or an unknown type is a protocol violation.
    pub fn decode(src: &mut BytesMut, max_payload: u32) -> Result<Option<Frame>, TetherError> {
        if src.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let mut header = &src[..FRAME_HEADER_SIZE];
        let stream_id = header.get_u32();
        let frame_type = FrameType::try_from(header.get_u8())?;
        let length = header.get_u32();

        if length > max_payload {
            return Err(TetherError::ProtocolViolation(format!(
                "frame length {} exceeds maximum {}",
                length, max_payload
            )));
        }

        let total = FRAME_HEADER_SIZE + length as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_SIZE);
        let payload = src.split_to(length as usize).freeze();

        Ok(Some(Frame {
            stream_id,
            frame_type,
            payload,
        }))
    }
}

/// `tokio_util` codec for [`Frame`]
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_payload: u32,
}

impl FrameCodec {
    /// Codec rejecting payloads above `max_payload`
    pub fn new(max_payload: u32) -> Self {
        FrameCodec { max_payload }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = TetherError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, TetherError> {
        Frame::decode(src, self.max_payload)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = TetherError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), TetherError> {
        if item.payload.len() > self.max_payload as usize {
            return Err(TetherError::ProtocolViolation(format!(
                "outgoing frame length {} exceeds maximum {}",
                item.payload.len(),
                self.max_payload
            )));
        }
        item.encode(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_conversion() {
        for code in 0u8..=6 {
            let ty = FrameType::try_from(code).unwrap();
            assert_eq!(ty as u8, code);
        }
        assert!(FrameType::try_from(7).is_err());
        assert!(FrameType::try_from(0xFF).is_err());
    }

    #[test]
    fn test_header_layout() {
        let mut buf = BytesMut::new();
        Frame::data(0x01020304, Bytes::from_static(b"hi")).encode(&mut buf);
        assert_eq!(
            &buf[..],
            &[0x01, 0x02, 0x03, 0x04, 0x01, 0x00, 0x00, 0x00, 0x02, b'h', b'i']
        );
    }

    #[test]
    fn test_decode_partial_then_complete() {
        let mut full = BytesMut::new();
        Frame::data(7, Bytes::from_static(b"hello")).encode(&mut full);

        let mut buf = BytesMut::from(&full[..4]);
        assert!(Frame::decode(&mut buf, 1024).unwrap().is_none());
        buf.extend_from_slice(&full[4..12]);
        assert!(Frame::decode(&mut buf, 1024).unwrap().is_none());
        buf.extend_from_slice(&full[12..]);

        let frame = Frame::decode(&mut buf, 1024).unwrap().unwrap();
        assert_eq!(frame.stream_id, 7);
        assert_eq!(frame.frame_type, FrameType::Data);
        assert_eq!(&frame.payload[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_back_to_back_frames() {
        let mut buf = BytesMut::new();
        Frame::open(1).encode(&mut buf);
        Frame::data(1, Bytes::from_static(b"abc")).encode(&mut buf);
        Frame::close(1).encode(&mut buf);

        let types: Vec<FrameType> = std::iter::from_fn(|| Frame::decode(&mut buf, 1024).unwrap())
            .map(|f| f.frame_type)
            .collect();
        assert_eq!(types, vec![FrameType::Open, FrameType::Data, FrameType::Close]);
    }

    #[test]
    fn test_decode_rejects_oversize_length() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(FrameType::Data as u8);
        buf.put_u32(2048);
        let err = Frame::decode(&mut buf, 1024).unwrap_err();
        assert!(matches!(err, TetherError::ProtocolViolation(_)));
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(0x42);
        buf.put_u32(0);
        assert!(Frame::decode(&mut buf, 1024).is_err());
    }

    #[test]
    fn test_ping_and_window_payloads() {
        let ping = Frame::ping(0xDEADBEEF);
        assert_eq!(ping.stream_id, 0);
        assert_eq!(ping.payload.len(), 8);

        let pong = Frame::pong(ping.payload.clone());
        assert_eq!(pong.frame_type, FrameType::Pong);
        assert_eq!(pong.payload, ping.payload);

        let window = Frame::window(3, 65536);
        assert_eq!(window.window_increment().unwrap(), 65536);
        assert!(Frame::data(3, Bytes::from_static(b"x"))
            .window_increment()
            .is_err());
    }

    #[test]
    fn test_codec_encoder_limit() {
        let mut codec = FrameCodec::new(4);
        let mut dst = BytesMut::new();
        assert!(codec
            .encode(Frame::data(1, Bytes::from_static(b"1234")), &mut dst)
            .is_ok());
        assert!(codec
            .encode(Frame::data(1, Bytes::from_static(b"12345")), &mut dst)
            .is_err());

        let frame = codec.decode(&mut dst).unwrap().unwrap();
        assert_eq!(&frame.payload[..], b"1234");
    }
}
