//! Shared dialing helpers and WebSocket obfuscation tables

use super::TransportError;
use rand::Rng;
use socket2::{SockRef, TcpKeepalive};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tracing::{debug, trace};

/// Initial backoff between dial attempts
pub const DIAL_BACKOFF_START: Duration = Duration::from_secs(1);

/// Backoff ceiling
pub const DIAL_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Socket options applied to tunnel-facing TCP connections.
///
/// Snapshotted from the live parameter record when a connection is created;
/// established connections keep their options until replaced.
#[derive(Debug, Clone, Copy)]
pub struct SocketOptions {
    pub nodelay: bool,
    /// TCP keepalive period; zero disables
    pub keepalive: Duration,
    /// SO_RCVBUF in bytes (0 = kernel default)
    pub recv_buffer: usize,
    /// SO_SNDBUF in bytes (0 = kernel default)
    pub send_buffer: usize,
}

impl SocketOptions {
    /// Apply to an established connection. Option failures are logged and
    /// tolerated; the stream stays usable with kernel defaults.
    pub fn apply(&self, stream: &TcpStream) {
        let sock = SockRef::from(stream);

        if let Err(e) = sock.set_nodelay(self.nodelay) {
            debug!(error = %e, "failed to set TCP_NODELAY");
        }
        if !self.keepalive.is_zero() {
            let keepalive = TcpKeepalive::new().with_time(self.keepalive);
            if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
                debug!(error = %e, "failed to set TCP keepalive");
            }
        }
        if self.recv_buffer > 0 {
            if let Err(e) = sock.set_recv_buffer_size(self.recv_buffer) {
                debug!(error = %e, "failed to set SO_RCVBUF");
            }
        }
        if self.send_buffer > 0 {
            if let Err(e) = sock.set_send_buffer_size(self.send_buffer) {
                debug!(error = %e, "failed to set SO_SNDBUF");
            }
        }
    }
}

/// Enable TCP Fast Open on a listener socket (Linux only).
#[cfg(target_os = "linux")]
pub fn enable_fastopen(listener: &tokio::net::TcpListener) {
    use std::os::fd::AsRawFd;

    let qlen: libc::c_int = 1;
    // SAFETY: the fd is owned by the listener for its whole lifetime and the
    // option value is a plain int.
    let rc = unsafe {
        libc::setsockopt(
            listener.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_FASTOPEN,
            &qlen as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        debug!("TCP Fast Open enabled");
    } else {
        debug!("TCP Fast Open not supported on this kernel");
    }
}

#[cfg(not(target_os = "linux"))]
pub fn enable_fastopen(_listener: &tokio::net::TcpListener) {}

/// Dial a TCP connection with exponential backoff between attempts.
///
/// Backoff runs 1 s → 2 s → 4 s … capped at [`DIAL_BACKOFF_CAP`]; the last
/// attempt's error is returned once `retries` is exhausted.
pub async fn tcp_dial(
    addr: &str,
    timeout: Duration,
    opts: &SocketOptions,
    retries: u32,
) -> Result<TcpStream, TransportError> {
    let mut backoff = DIAL_BACKOFF_START;
    let mut last_err = TransportError::ConnectionFailed(format!("no dial attempts for {}", addr));

    for attempt in 0..retries.max(1) {
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                opts.apply(&stream);
                return Ok(stream);
            }
            Ok(Err(e)) => last_err = TransportError::Io(e),
            Err(_) => last_err = TransportError::Timeout,
        }

        if attempt + 1 < retries {
            trace!(addr, ?backoff, "dial failed, backing off");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(DIAL_BACKOFF_CAP);
        }
    }

    Err(last_err)
}

/// User-Agent pool for obfuscated WebSocket handshakes
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (X11; Linux x86_64; rv:120.0) Gecko/20100101 Firefox/120.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.0.0",
];

/// Realistic request paths for the control endpoint; the server accepts any
/// path, so these exist purely to blend into CDN logs
const REALISTIC_PATHS: &[&str] = &[
    "/api/v1/stream",
    "/cdn/assets",
    "/ws/chat",
    "/api/notifications",
    "/live/stream",
    "/api/analytics",
    "/cdn/static",
    "/api/status",
    "/ws/updates",
    "/api/metrics",
];

/// Build an obfuscated WebSocket upgrade request.
///
/// The `Host` header and the URL stay at `remote_addr` even when the TCP
/// dial targets an edge IP, which is what makes CDN fronting work. Header
/// values are picked with a per-call RNG; no generator state is shared
/// across tasks.
pub fn obfuscated_client_request(
    remote_addr: &str,
    token: &str,
    tls: bool,
) -> Result<Request, TransportError> {
    let mut rng = rand::thread_rng();
    let user_id: u32 = rng.gen();
    let path = REALISTIC_PATHS[rng.gen_range(0..REALISTIC_PATHS.len())];
    let user_agent = USER_AGENTS[rng.gen_range(0..USER_AGENTS.len())];

    let scheme = if tls { "wss" } else { "ws" };
    let url = format!("{}://{}{}/{}", scheme, remote_addr, path, user_id);

    let mut request = url
        .into_client_request()
        .map_err(|e| TransportError::WebSocket(e.to_string()))?;

    let headers = request.headers_mut();
    let mut put = |name: &'static str, value: String| {
        if let Ok(v) = value.parse() {
            headers.insert(name, v);
        }
    };

    put("Authorization", format!("Bearer {}", token));
    put("X-User-Id", user_id.to_string());
    put("User-Agent", user_agent.to_string());
    put(
        "Accept",
        "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8".to_string(),
    );
    put("Accept-Language", "en-US,en;q=0.5".to_string());
    put("Cache-Control", "max-age=0".to_string());
    put("DNT", "1".to_string());
    put("Sec-Fetch-Dest", "websocket".to_string());
    put("Sec-Fetch-Mode", "websocket".to_string());
    put("Sec-Fetch-Site", "cross-site".to_string());

    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_obfuscated_request_shape() {
        let request = obfuscated_client_request("203.0.113.9:443", "secret", true).unwrap();

        assert_eq!(request.uri().scheme_str(), Some("wss"));
        let path = request.uri().path();
        assert!(REALISTIC_PATHS.iter().any(|p| path.starts_with(p)), "path {:?}", path);

        let headers = request.headers();
        assert_eq!(headers.get("Authorization").unwrap(), "Bearer secret");
        assert!(headers.contains_key("X-User-Id"));
        let ua = headers.get("User-Agent").unwrap().to_str().unwrap();
        assert!(USER_AGENTS.contains(&ua));
    }

    #[tokio::test]
    async fn test_dial_failure_returns_error() {
        // TEST-NET address, nothing listening; single attempt to stay fast
        let opts = SocketOptions {
            nodelay: true,
            keepalive: Duration::ZERO,
            recv_buffer: 0,
            send_buffer: 0,
        };
        let result = tcp_dial("192.0.2.1:1", Duration::from_millis(100), &opts, 1).await;
        assert!(result.is_err());
    }
}
