//! Sub-stream frame encoding/decoding
//!
//! Frame format (big-endian):
//! ```text
//! +--------+--------+--------+--------+--------+
//! |  Type  |          Stream ID (4B)           |
//! +--------+--------+--------+--------+--------+
//! |              Length (4B)          | Payload
//! +--------+--------+--------+--------+--------+
//! ```
//!
//! The stream id is the session `sid` assigned by the front-peer, which is
//! how a sub-stream is correlated with its DISPATCH. This framing is part
//! of wire compatibility for the mux transports.

use super::MuxError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Sub-stream frame header size in bytes
pub const MUX_HEADER_SIZE: usize = 9;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MuxFrameType {
    /// Session payload bytes
    Data = 0x00,
    /// Sub-stream open (front → behind)
    Syn = 0x01,
    /// Sub-stream half-close
    Fin = 0x02,
    /// Carrier keepalive
    Ping = 0x03,
    /// Carrier keepalive response
    Pong = 0x04,
}

impl TryFrom<u8> for MuxFrameType {
    type Error = MuxError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(MuxFrameType::Data),
            0x01 => Ok(MuxFrameType::Syn),
            0x02 => Ok(MuxFrameType::Fin),
            0x03 => Ok(MuxFrameType::Ping),
            0x04 => Ok(MuxFrameType::Pong),
            other => Err(MuxError::InvalidFrame(format!("unknown frame type: {}", other))),
        }
    }
}

/// A carrier frame
#[derive(Debug, Clone)]
pub struct MuxFrame {
    pub frame_type: MuxFrameType,
    /// Session sid (0 for carrier-level frames)
    pub stream_id: u32,
    pub payload: Bytes,
}

impl MuxFrame {
    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self { frame_type: MuxFrameType::Data, stream_id, payload }
    }

    pub fn syn(stream_id: u32) -> Self {
        Self { frame_type: MuxFrameType::Syn, stream_id, payload: Bytes::new() }
    }

    pub fn fin(stream_id: u32) -> Self {
        Self { frame_type: MuxFrameType::Fin, stream_id, payload: Bytes::new() }
    }

    pub fn ping() -> Self {
        Self { frame_type: MuxFrameType::Ping, stream_id: 0, payload: Bytes::new() }
    }

    pub fn pong() -> Self {
        Self { frame_type: MuxFrameType::Pong, stream_id: 0, payload: Bytes::new() }
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(MUX_HEADER_SIZE + self.payload.len());
        buf.put_u8(self.frame_type as u8);
        buf.put_u32(self.stream_id);
        buf.put_u32(self.payload.len() as u32);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode one frame from `buf`, or `None` if incomplete.
    ///
    /// `max_frame_size` bounds the payload; a larger length indicates a
    /// desynchronized carrier and is fatal for the connection.
    pub fn decode(buf: &mut BytesMut, max_frame_size: usize) -> Result<Option<Self>, MuxError> {
        if buf.len() < MUX_HEADER_SIZE {
            return Ok(None);
        }

        let frame_type = MuxFrameType::try_from(buf[0])?;
        let stream_id = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        let payload_len = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;

        if payload_len > max_frame_size {
            return Err(MuxError::FrameTooLarge(payload_len, max_frame_size));
        }
        if buf.len() < MUX_HEADER_SIZE + payload_len {
            return Ok(None);
        }

        buf.advance(MUX_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        Ok(Some(Self { frame_type, stream_id, payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_encode_decode() {
        let original = MuxFrame::data(42, Bytes::from_static(b"Hello, World!"));
        let mut encoded = original.encode();

        let decoded = MuxFrame::decode(&mut encoded, 32 * 1024).unwrap().unwrap();

        assert_eq!(decoded.frame_type, MuxFrameType::Data);
        assert_eq!(decoded.stream_id, 42);
        assert_eq!(decoded.payload, original.payload);
        assert!(encoded.is_empty());
    }

    #[test]
    fn test_partial_frame() {
        let encoded = MuxFrame::data(1, Bytes::from_static(b"partial")).encode();
        let mut short = BytesMut::from(&encoded[..MUX_HEADER_SIZE + 3]);
        assert!(MuxFrame::decode(&mut short, 32 * 1024).unwrap().is_none());
        // Nothing consumed until a full frame is available
        assert_eq!(short.len(), MUX_HEADER_SIZE + 3);
    }

    #[test]
    fn test_oversize_rejected() {
        let mut encoded = MuxFrame::data(1, Bytes::from(vec![0u8; 2048])).encode();
        assert!(matches!(
            MuxFrame::decode(&mut encoded, 1024),
            Err(MuxError::FrameTooLarge(2048, 1024))
        ));
    }

    #[test]
    fn test_two_frames_in_buffer() {
        let mut buf = MuxFrame::syn(7).encode();
        buf.extend_from_slice(&MuxFrame::data(7, Bytes::from_static(b"x")).encode());

        let first = MuxFrame::decode(&mut buf, 1024).unwrap().unwrap();
        assert_eq!(first.frame_type, MuxFrameType::Syn);
        let second = MuxFrame::decode(&mut buf, 1024).unwrap().unwrap();
        assert_eq!(second.frame_type, MuxFrameType::Data);
        assert_eq!(&second.payload[..], b"x");
    }
}
