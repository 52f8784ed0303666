//! Transport adapters
//!
//! Every variant exposes the same internal contract: open (behind-peer) or
//! accept (front-peer) a byte stream toward the other peer. The session
//! router and the pool are generic over [`BoxedStream`], so the relay code
//! never knows which transport carries it.
//!
//! Variants:
//! - TCP: one connection per session, pooled
//! - TCP-mux / WS-mux: carriers multiplexing sub-streams (see [`crate::mux`])
//! - WebSocket / TLS-WebSocket: byte streams over binary WS messages
//! - QUIC: native streams over one connection
//! - UDP ingress: length-prefixed datagrams over a pooled TCP stream

mod quic;
mod shared;
mod tcp;
mod udp;
mod ws;

pub use quic::{join_bi, make_client_endpoint, make_server_endpoint, QuicStream};
pub use shared::{
    enable_fastopen, obfuscated_client_request, tcp_dial, SocketOptions, DIAL_BACKOFF_CAP,
    DIAL_BACKOFF_START,
};
pub use tcp::{TcpAcceptor, TcpDialer};
pub use udp::{read_datagram, write_datagram, MAX_DATAGRAM_SIZE};
pub use ws::{load_tls_acceptor, WsAcceptor, WsByteStream, WsDialer};

use async_trait::async_trait;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("QUIC error: {0}")]
    Quic(String),

    #[error("timeout")]
    Timeout,
}

/// Object-safe alias for anything that can carry session bytes
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// A type-erased transport stream
pub type BoxedStream = Box<dyn ByteStream>;

/// Behind-peer seam: dial one data-carrying connection toward the front.
#[async_trait]
pub trait DataDialer: Send + Sync {
    async fn dial(&self) -> Result<BoxedStream, TransportError>;
}

/// Front-peer seam: accept one data-carrying connection from the behind-peer.
#[async_trait]
pub trait DataAcceptor: Send + Sync {
    async fn accept(&self) -> Result<BoxedStream, TransportError>;
}
