//! UDP-ingress framing
//!
//! UDP datagrams are relayed over a pooled TCP data stream. Each datagram
//! travels as `u16 length` (big-endian) + payload; the receiving side
//! unframes and forwards to its UDP socket. Flow state (source address →
//! stream) lives in the router; this module is only the wire format.

use super::TransportError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest datagram the framing can carry
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// Write one framed datagram
pub async fn write_datagram<W>(writer: &mut W, payload: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_DATAGRAM_SIZE {
        return Err(TransportError::ConnectionFailed(format!(
            "datagram of {} bytes exceeds framing limit",
            payload.len()
        )));
    }

    let mut buf = Vec::with_capacity(2 + payload.len());
    buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    buf.extend_from_slice(payload);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed datagram; `None` on clean EOF at a frame boundary
pub async fn read_datagram<R>(reader: &mut R) -> Result<Option<Vec<u8>>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 2];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u16::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_datagram_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        write_datagram(&mut a, b"dns query").await.unwrap();
        write_datagram(&mut a, b"").await.unwrap();
        write_datagram(&mut a, b"second").await.unwrap();

        assert_eq!(read_datagram(&mut b).await.unwrap().unwrap(), b"dns query");
        assert_eq!(read_datagram(&mut b).await.unwrap().unwrap(), b"");
        assert_eq!(read_datagram(&mut b).await.unwrap().unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_eof_at_boundary() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(read_datagram(&mut b).await.unwrap().is_none());
    }
}
