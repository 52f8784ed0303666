//! QUIC transport
//!
//! A single QUIC connection from the behind-peer to the front-peer carries
//! everything: the first bidirectional stream (opened by the behind-peer)
//! is the control channel, and every session rides its own bidirectional
//! stream opened by the front-peer, prefixed with the session sid.
//! Streams never use 0-RTT data.

use super::{ws, TransportError};
use std::sync::Arc;
use std::time::Duration;

/// ALPN identifier both endpoints must agree on
const ALPN: &[u8] = b"overpass";

/// Session stream joined into one duplex byte stream
pub type QuicStream = tokio::io::Join<quinn::RecvStream, quinn::SendStream>;

/// Join the two halves of a bidirectional stream
pub fn join_bi(send: quinn::SendStream, recv: quinn::RecvStream) -> QuicStream {
    tokio::io::join(recv, send)
}

/// Build the front-peer QUIC endpoint from the configured cert/key.
pub fn make_server_endpoint(
    bind_addr: std::net::SocketAddr,
    cert_path: &str,
    key_path: &str,
    mux_con: usize,
    keepalive: Duration,
) -> Result<quinn::Endpoint, TransportError> {
    let certs = ws::load_certs(cert_path)?;
    let key = ws::load_private_key(key_path)?;

    let mut crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
        .map_err(|e| TransportError::Quic(e.to_string()))?;
    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));

    let mut transport = quinn::TransportConfig::default();
    transport.max_concurrent_bidi_streams(quinn::VarInt::from_u64(mux_con as u64 + 1).unwrap_or(quinn::VarInt::MAX));
    if !keepalive.is_zero() {
        transport.keep_alive_interval(Some(keepalive));
    }
    server_config.transport_config(Arc::new(transport));

    quinn::Endpoint::server(server_config, bind_addr)
        .map_err(|e| TransportError::Quic(e.to_string()))
}

/// Build the behind-peer QUIC endpoint.
///
/// Certificate verification is skipped; the bearer token authenticates the
/// channel, QUIC's TLS provides wire privacy only.
pub fn make_client_endpoint(
    mux_con: usize,
    keepalive: Duration,
) -> Result<quinn::Endpoint, TransportError> {
    let mut crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(ws::SkipServerVerification::new())
        .with_no_client_auth();
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
        .map_err(|e| TransportError::Quic(e.to_string()))?;
    let mut client_config = quinn::ClientConfig::new(Arc::new(crypto));

    let mut transport = quinn::TransportConfig::default();
    transport.max_concurrent_bidi_streams(quinn::VarInt::from_u64(mux_con as u64 + 1).unwrap_or(quinn::VarInt::MAX));
    if !keepalive.is_zero() {
        transport.keep_alive_interval(Some(keepalive));
    }
    client_config.transport_config(Arc::new(transport));

    let bind: std::net::SocketAddr = "0.0.0.0:0".parse().expect("static addr");
    let mut endpoint =
        quinn::Endpoint::client(bind).map_err(|e| TransportError::Quic(e.to_string()))?;
    endpoint.set_default_client_config(client_config);
    Ok(endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_client_endpoint_builds_without_certs() {
        let endpoint = make_client_endpoint(8, Duration::from_secs(75));
        assert!(endpoint.is_ok());
    }
}
