//! WebSocket transport (`ws` / `wss`)
//!
//! Control and data connections are WebSocket upgrades against the server's
//! `bind_addr`; the server accepts any request path. Session bytes travel
//! as binary messages, surfaced to the router through [`WsByteStream`].
//!
//! The client handshake is obfuscated (random User-Agent, realistic
//! headers, randomized path) and supports CDN fronting via `edge_ip`: the
//! TCP dial targets the edge while the `Host` header and TLS SNI stay at
//! the configured remote address.

use super::{
    obfuscated_client_request, shared, BoxedStream, DataAcceptor, DataDialer, SocketOptions,
    TransportError,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Sink, Stream};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

/// Byte-stream adapter over a WebSocket connection.
///
/// Reads concatenate binary message payloads; writes emit one binary
/// message per call. Text and control messages are skipped (the library
/// answers pings internally).
pub struct WsByteStream<S> {
    inner: WebSocketStream<S>,
    pending: Bytes,
}

impl<S> WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self { inner, pending: Bytes::new() }
    }
}

impl<S> AsyncRead for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.pending.is_empty() {
                let n = buf.remaining().min(this.pending.len());
                buf.put_slice(&this.pending.split_to(n));
                return Poll::Ready(Ok(()));
            }
            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(Message::Binary(data)))) => {
                    this.pending = Bytes::from(data);
                }
                Poll::Ready(Some(Ok(Message::Close(_)))) | Poll::Ready(None) => {
                    return Poll::Ready(Ok(()))
                }
                // Text and ping/pong frames carry no tunnel bytes
                Poll::Ready(Some(Ok(_))) => continue,
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, e)))
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S> AsyncWrite for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_ready(cx) {
            Poll::Ready(Ok(())) => {
                let message = Message::Binary(buf.to_vec());
                match Pin::new(&mut this.inner).start_send(message) {
                    Ok(()) => Poll::Ready(Ok(buf.len())),
                    Err(e) => Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, e))),
                }
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, e))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner)
            .poll_flush(cx)
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner)
            .poll_close(cx)
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))
    }
}

/// Behind-peer dialer for WS / WSS control and data connections
pub struct WsDialer {
    pub remote_addr: String,
    pub edge_ip: Option<String>,
    pub token: String,
    pub tls: bool,
    pub timeout: Duration,
    pub opts: SocketOptions,
    pub retries: u32,
}

impl WsDialer {
    /// Address the TCP dial actually targets
    fn dial_target(&self) -> Result<String, TransportError> {
        match &self.edge_ip {
            Some(edge) => {
                let port = self
                    .remote_addr
                    .rsplit_once(':')
                    .map(|(_, port)| port)
                    .ok_or_else(|| {
                        TransportError::ConnectionFailed(format!(
                            "remote_addr {:?} has no port for edge dialing",
                            self.remote_addr
                        ))
                    })?;
                Ok(format!("{}:{}", edge, port))
            }
            None => Ok(self.remote_addr.clone()),
        }
    }

    async fn dial_ws(&self) -> Result<BoxedStream, TransportError> {
        let target = self.dial_target()?;
        let tcp = shared::tcp_dial(&target, self.timeout, &self.opts, self.retries).await?;
        let request = obfuscated_client_request(&self.remote_addr, &self.token, self.tls)?;

        if self.tls {
            let host = self
                .remote_addr
                .rsplit_once(':')
                .map(|(host, _)| host)
                .unwrap_or(self.remote_addr.as_str());
            let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
                .map_err(|e| TransportError::Tls(e.to_string()))?;

            let connector = tokio_rustls::TlsConnector::from(insecure_tls_client_config());
            let tls_stream = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| TransportError::Tls(e.to_string()))?;

            let (ws, _response) = tokio_tungstenite::client_async(request, tls_stream)
                .await
                .map_err(|e| TransportError::WebSocket(e.to_string()))?;
            Ok(Box::new(WsByteStream::new(ws)))
        } else {
            let (ws, _response) = tokio_tungstenite::client_async(request, tcp)
                .await
                .map_err(|e| TransportError::WebSocket(e.to_string()))?;
            Ok(Box::new(WsByteStream::new(ws)))
        }
    }
}

#[async_trait]
impl DataDialer for WsDialer {
    async fn dial(&self) -> Result<BoxedStream, TransportError> {
        self.dial_ws().await
    }
}

/// Front-peer acceptor for WS / WSS upgrades on the shared listener
pub struct WsAcceptor {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    opts: SocketOptions,
}

impl WsAcceptor {
    pub async fn bind(
        bind_addr: &str,
        tls: Option<TlsAcceptor>,
        opts: SocketOptions,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(bind_addr).await?;
        shared::enable_fastopen(&listener);
        Ok(Self { listener, tls, opts })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }
}

/// Bound on the TLS + WebSocket upgrade so a stalled peer cannot wedge the
/// accept loop
const UPGRADE_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
impl DataAcceptor for WsAcceptor {
    async fn accept(&self) -> Result<BoxedStream, TransportError> {
        let (stream, peer) = self.listener.accept().await?;
        self.opts.apply(&stream);

        let upgrade = async {
            match &self.tls {
                Some(acceptor) => {
                    let tls_stream = acceptor
                        .accept(stream)
                        .await
                        .map_err(|e| TransportError::Tls(e.to_string()))?;
                    let ws = tokio_tungstenite::accept_async(tls_stream).await.map_err(|e| {
                        debug!(%peer, error = %e, "WSS upgrade failed");
                        TransportError::WebSocket(e.to_string())
                    })?;
                    Ok(Box::new(WsByteStream::new(ws)) as BoxedStream)
                }
                None => {
                    let ws = tokio_tungstenite::accept_async(stream).await.map_err(|e| {
                        debug!(%peer, error = %e, "WS upgrade failed");
                        TransportError::WebSocket(e.to_string())
                    })?;
                    Ok(Box::new(WsByteStream::new(ws)) as BoxedStream)
                }
            }
        };

        tokio::time::timeout(UPGRADE_TIMEOUT, upgrade)
            .await
            .map_err(|_| TransportError::Timeout)?
    }
}

/// Build a TLS acceptor from PEM cert/key files
pub fn load_tls_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor, TransportError> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::Tls(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Load a TLS certificate chain from a PEM file
pub(crate) fn load_certs(
    path: &str,
) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, TransportError> {
    let file = std::fs::File::open(path)
        .map_err(|e| TransportError::Tls(format!("failed to open cert file {}: {}", path, e)))?;
    let mut reader = std::io::BufReader::new(file);
    let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Tls(format!("failed to parse certificates: {}", e)))?;
    if certs.is_empty() {
        return Err(TransportError::Tls(format!("no certificates found in {}", path)));
    }
    Ok(certs)
}

/// Load a TLS private key from a PEM file
pub(crate) fn load_private_key(
    path: &str,
) -> Result<rustls::pki_types::PrivateKeyDer<'static>, TransportError> {
    let file = std::fs::File::open(path)
        .map_err(|e| TransportError::Tls(format!("failed to open key file {}: {}", path, e)))?;
    let mut reader = std::io::BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::Tls(format!("failed to parse private key: {}", e)))?
        .ok_or_else(|| TransportError::Tls(format!("no private key found in {}", path)))
}

/// Client TLS config that skips certificate verification.
///
/// The behind-peer pins nothing; channel authentication is the bearer
/// token, and the TLS layer exists for wire privacy and DPI resistance.
pub(crate) fn insecure_tls_client_config() -> Arc<rustls::ClientConfig> {
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(SkipServerVerification::new())
        .with_no_client_auth();
    Arc::new(config)
}

#[derive(Debug)]
pub(crate) struct SkipServerVerification(rustls::crypto::CryptoProvider);

impl SkipServerVerification {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self(rustls::crypto::ring::default_provider()))
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn opts() -> SocketOptions {
        SocketOptions {
            nodelay: true,
            keepalive: Duration::ZERO,
            recv_buffer: 0,
            send_buffer: 0,
        }
    }

    #[tokio::test]
    async fn test_ws_byte_stream_roundtrip() {
        let acceptor = WsAcceptor::bind("127.0.0.1:0", None, opts()).await.unwrap();
        let addr = acceptor.local_addr().unwrap();

        let dialer = WsDialer {
            remote_addr: addr.to_string(),
            edge_ip: None,
            token: "secret".to_string(),
            tls: false,
            timeout: Duration::from_secs(2),
            opts: opts(),
            retries: 1,
        };

        let (accepted, dialed) = tokio::join!(acceptor.accept(), dialer.dial());
        let mut accepted = accepted.unwrap();
        let mut dialed = dialed.unwrap();

        dialed.write_all(b"through websocket").await.unwrap();
        dialed.flush().await.unwrap();

        let mut buf = [0u8; 17];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"through websocket");

        // And the other direction
        accepted.write_all(b"back").await.unwrap();
        accepted.flush().await.unwrap();
        let mut buf = [0u8; 4];
        dialed.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"back");
    }

    #[test]
    fn test_edge_dial_target_keeps_port() {
        let dialer = WsDialer {
            remote_addr: "tunnel.example.com:443".to_string(),
            edge_ip: Some("203.0.113.20".to_string()),
            token: String::new(),
            tls: true,
            timeout: Duration::from_secs(1),
            opts: opts(),
            retries: 1,
        };
        assert_eq!(dialer.dial_target().unwrap(), "203.0.113.20:443");
    }
}
