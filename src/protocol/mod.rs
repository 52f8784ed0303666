//! Control-channel protocol
//!
//! The control channel exchanges length-prefixed frames:
//!
//! ```text
//! +--------+--------+--------+--------+
//! |        Payload Length (4B)        |
//! +--------+--------+--------+--------+
//! |  Type  |          Payload         |
//! +--------+--------+--------+--------+
//! ```
//!
//! Length is big-endian and counts the payload only. The tiny tagged
//! message set carries the handshake, keepalive, and session dispatch.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("malformed {0} payload")]
    MalformedPayload(&'static str),

    #[error("unexpected frame: {0}")]
    UnexpectedFrame(String),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Control frame header size (length + type)
pub const FRAME_HEADER_SIZE: usize = 5;

/// Upper bound on a control frame payload. Control traffic is tiny; anything
/// larger indicates a desynchronized or hostile peer.
pub const MAX_CONTROL_PAYLOAD: usize = 4096;

/// Handshake budget for HELLO / HELLO_OK exchange
pub const HANDSHAKE_TIMEOUT: u64 = 10;

/// Frame tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Authenticate (behind → front), payload = bearer token
    Hello = 0x01,
    /// Accept (front → behind), payload = heartbeat interval
    HelloOk = 0x02,
    /// Liveness probe
    Ping = 0x03,
    /// Liveness response
    Pong = 0x04,
    /// Schedule a session (front → behind)
    Dispatch = 0x05,
    /// Data resource announcement / session correlation (behind → front)
    Ready = 0x06,
    /// Orderly shutdown
    Close = 0x07,
    /// Live keepalive advertisement (either direction)
    Keepalive = 0x08,
}

impl TryFrom<u8> for FrameType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameType::Hello),
            0x02 => Ok(FrameType::HelloOk),
            0x03 => Ok(FrameType::Ping),
            0x04 => Ok(FrameType::Pong),
            0x05 => Ok(FrameType::Dispatch),
            0x06 => Ok(FrameType::Ready),
            0x07 => Ok(FrameType::Close),
            0x08 => Ok(FrameType::Keepalive),
            other => Err(ProtocolError::InvalidFrameType(other)),
        }
    }
}

/// A decoded control frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    /// Authenticate with the shared bearer token
    Hello { token: String },
    /// Accept; carries the server's heartbeat interval in seconds so the
    /// behind-peer can arm its liveness deadline
    HelloOk { heartbeat: u16 },
    Ping,
    Pong,
    /// Open a data stream to local `dest_port`; the next data resource
    /// consumed carries session `sid`
    Dispatch { sid: u32, dest_port: u16 },
    /// Announcement that the connection carrying this frame is a data
    /// resource (`sid` 0), or sid correlation where a transport needs it
    Ready { sid: u32 },
    Close,
    /// The sender's tuned keepalive period in seconds; the receiver adopts
    /// it so both peers' live parameter records stay synchronized
    Keepalive { period: u16 },
}

impl ControlFrame {
    /// Frame tag for this variant
    pub fn frame_type(&self) -> FrameType {
        match self {
            ControlFrame::Hello { .. } => FrameType::Hello,
            ControlFrame::HelloOk { .. } => FrameType::HelloOk,
            ControlFrame::Ping => FrameType::Ping,
            ControlFrame::Pong => FrameType::Pong,
            ControlFrame::Dispatch { .. } => FrameType::Dispatch,
            ControlFrame::Ready { .. } => FrameType::Ready,
            ControlFrame::Close => FrameType::Close,
            ControlFrame::Keepalive { .. } => FrameType::Keepalive,
        }
    }

    /// Encode to wire format
    pub fn encode(&self) -> BytesMut {
        let payload = self.encode_payload();
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.put_u8(self.frame_type() as u8);
        buf.extend_from_slice(&payload);
        buf
    }

    fn encode_payload(&self) -> Bytes {
        match self {
            ControlFrame::Hello { token } => Bytes::copy_from_slice(token.as_bytes()),
            ControlFrame::HelloOk { heartbeat } => {
                let mut p = BytesMut::with_capacity(2);
                p.put_u16(*heartbeat);
                p.freeze()
            }
            ControlFrame::Ping | ControlFrame::Pong | ControlFrame::Close => Bytes::new(),
            ControlFrame::Dispatch { sid, dest_port } => {
                let mut p = BytesMut::with_capacity(6);
                p.put_u32(*sid);
                p.put_u16(*dest_port);
                p.freeze()
            }
            ControlFrame::Ready { sid } => {
                let mut p = BytesMut::with_capacity(4);
                p.put_u32(*sid);
                p.freeze()
            }
            ControlFrame::Keepalive { period } => {
                let mut p = BytesMut::with_capacity(2);
                p.put_u16(*period);
                p.freeze()
            }
        }
    }

    /// Decode one frame from `buf`, or `None` if incomplete
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let payload_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if payload_len > MAX_CONTROL_PAYLOAD {
            return Err(ProtocolError::FrameTooLarge(payload_len));
        }
        if buf.len() < FRAME_HEADER_SIZE + payload_len {
            return Ok(None);
        }

        let frame_type = FrameType::try_from(buf[4])?;
        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        Self::from_parts(frame_type, payload).map(Some)
    }

    fn from_parts(frame_type: FrameType, payload: Bytes) -> Result<Self, ProtocolError> {
        match frame_type {
            FrameType::Hello => {
                let token = String::from_utf8(payload.to_vec())
                    .map_err(|_| ProtocolError::MalformedPayload("HELLO"))?;
                Ok(ControlFrame::Hello { token })
            }
            FrameType::HelloOk => {
                if payload.len() != 2 {
                    return Err(ProtocolError::MalformedPayload("HELLO_OK"));
                }
                let heartbeat = u16::from_be_bytes([payload[0], payload[1]]);
                Ok(ControlFrame::HelloOk { heartbeat })
            }
            FrameType::Ping => Ok(ControlFrame::Ping),
            FrameType::Pong => Ok(ControlFrame::Pong),
            FrameType::Dispatch => {
                if payload.len() != 6 {
                    return Err(ProtocolError::MalformedPayload("DISPATCH"));
                }
                let sid = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                let dest_port = u16::from_be_bytes([payload[4], payload[5]]);
                Ok(ControlFrame::Dispatch { sid, dest_port })
            }
            FrameType::Ready => {
                if payload.len() != 4 {
                    return Err(ProtocolError::MalformedPayload("READY"));
                }
                let sid = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                Ok(ControlFrame::Ready { sid })
            }
            FrameType::Close => Ok(ControlFrame::Close),
            FrameType::Keepalive => {
                if payload.len() != 2 {
                    return Err(ProtocolError::MalformedPayload("KEEPALIVE"));
                }
                let period = u16::from_be_bytes([payload[0], payload[1]]);
                Ok(ControlFrame::Keepalive { period })
            }
        }
    }
}

/// Read one control frame from an async stream
pub async fn read_frame<R>(reader: &mut R) -> Result<ControlFrame, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut header).await?;

    let payload_len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if payload_len > MAX_CONTROL_PAYLOAD {
        return Err(ProtocolError::FrameTooLarge(payload_len));
    }
    let frame_type = FrameType::try_from(header[4])?;

    let mut payload = vec![0u8; payload_len];
    reader.read_exact(&mut payload).await?;

    ControlFrame::from_parts(frame_type, Bytes::from(payload))
}

/// Write one control frame to an async stream
pub async fn write_frame<W>(writer: &mut W, frame: &ControlFrame) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    // One write per frame; control frames are small and Nagle may be off.
    let buf = frame.encode();
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: ControlFrame) -> ControlFrame {
        let mut encoded = frame.encode();
        ControlFrame::decode(&mut encoded).unwrap().unwrap()
    }

    #[test]
    fn test_hello_roundtrip() {
        let frame = roundtrip(ControlFrame::Hello { token: "secret".to_string() });
        assert_eq!(frame, ControlFrame::Hello { token: "secret".to_string() });
    }

    #[test]
    fn test_dispatch_roundtrip() {
        let frame = roundtrip(ControlFrame::Dispatch { sid: 42, dest_port: 8080 });
        assert_eq!(frame, ControlFrame::Dispatch { sid: 42, dest_port: 8080 });
    }

    #[test]
    fn test_keepalive_roundtrip() {
        let frame = roundtrip(ControlFrame::Keepalive { period: 10 });
        assert_eq!(frame, ControlFrame::Keepalive { period: 10 });
    }

    #[test]
    fn test_dispatch_wire_layout() {
        let encoded = ControlFrame::Dispatch { sid: 7, dest_port: 8080 }.encode();
        // length(4) | type(1) | sid(4) | port(2)
        assert_eq!(&encoded[..], &[0, 0, 0, 6, 0x05, 0, 0, 0, 7, 0x1F, 0x90]);
    }

    #[test]
    fn test_incomplete_frame() {
        let mut encoded = ControlFrame::Hello { token: "secret".to_string() }.encode();
        let mut partial = encoded.split_to(encoded.len() - 2);
        assert!(ControlFrame::decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(0);
        buf.put_u8(0x7F);
        assert!(matches!(
            ControlFrame::decode(&mut buf),
            Err(ProtocolError::InvalidFrameType(0x7F))
        ));
    }

    #[test]
    fn test_oversize_frame_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_CONTROL_PAYLOAD + 1) as u32);
        buf.put_u8(FrameType::Hello as u8);
        assert!(matches!(
            ControlFrame::decode(&mut buf),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_async_read_write() {
        let (mut a, mut b) = tokio::io::duplex(256);

        write_frame(&mut a, &ControlFrame::Dispatch { sid: 3, dest_port: 7000 })
            .await
            .unwrap();
        write_frame(&mut a, &ControlFrame::Ping).await.unwrap();

        let first = read_frame(&mut b).await.unwrap();
        assert_eq!(first, ControlFrame::Dispatch { sid: 3, dest_port: 7000 });
        let second = read_frame(&mut b).await.unwrap();
        assert_eq!(second, ControlFrame::Ping);
    }
}
