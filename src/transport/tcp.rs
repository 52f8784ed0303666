//! Raw TCP transport
//!
//! The control channel and all data connections share the server's
//! `bind_addr`; the first control frame on each inbound connection decides
//! which one it is.

use super::{shared, BoxedStream, DataAcceptor, DataDialer, SocketOptions, TransportError};
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

/// Behind-peer dialer for control and pooled data connections
pub struct TcpDialer {
    pub remote_addr: String,
    pub timeout: Duration,
    pub opts: SocketOptions,
    pub retries: u32,
}

impl TcpDialer {
    pub async fn dial_tcp(&self) -> Result<TcpStream, TransportError> {
        shared::tcp_dial(&self.remote_addr, self.timeout, &self.opts, self.retries).await
    }
}

#[async_trait]
impl DataDialer for TcpDialer {
    async fn dial(&self) -> Result<BoxedStream, TransportError> {
        Ok(Box::new(self.dial_tcp().await?))
    }
}

/// Front-peer acceptor wrapping the shared listener
pub struct TcpAcceptor {
    listener: TcpListener,
    opts: SocketOptions,
}

impl TcpAcceptor {
    pub async fn bind(bind_addr: &str, opts: SocketOptions) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(bind_addr).await?;
        shared::enable_fastopen(&listener);
        Ok(Self { listener, opts })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }
}

#[async_trait]
impl DataAcceptor for TcpAcceptor {
    async fn accept(&self) -> Result<BoxedStream, TransportError> {
        let (stream, _peer) = self.listener.accept().await?;
        self.opts.apply(&stream);
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn opts() -> SocketOptions {
        SocketOptions {
            nodelay: true,
            keepalive: Duration::from_secs(75),
            recv_buffer: 0,
            send_buffer: 0,
        }
    }

    #[tokio::test]
    async fn test_dial_accept_roundtrip() {
        let acceptor = TcpAcceptor::bind("127.0.0.1:0", opts()).await.unwrap();
        let addr = acceptor.local_addr().unwrap();

        let dialer = TcpDialer {
            remote_addr: addr.to_string(),
            timeout: Duration::from_secs(2),
            opts: opts(),
            retries: 1,
        };

        let (accepted, dialed) = tokio::join!(acceptor.accept(), dialer.dial());
        let mut accepted = accepted.unwrap();
        let mut dialed = dialed.unwrap();

        dialed.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }
}
