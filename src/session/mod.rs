//! Session lifecycle and byte relaying
//!
//! A session pairs one end-user connection with one tunnel stream. Each
//! direction runs as its own copy task with its own buffer; counters live
//! in a shared [`SessionCtx`] and every copy iteration is attributed to the
//! session's listener port via the usage sink. Resources never hold
//! references back to sessions: the pool hands a stream over and forgets it.

use crate::transport::BoxedStream;
use crate::usage::{Direction, UsageSink};
use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One in-flight copy buffer per direction
pub const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Grace period for the second direction after the first one finishes
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Monotonically increasing session id source, unique per control channel
#[derive(Debug, Default)]
pub struct SidAllocator(AtomicU32);

impl SidAllocator {
    pub fn new() -> Self {
        Self(AtomicU32::new(1))
    }

    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Shared per-session state
pub struct SessionCtx {
    pub sid: u32,
    /// Listener port the byte counters are keyed by
    pub port: u16,
    pub started_at: Instant,
    pub bytes_up: AtomicU64,
    pub bytes_down: AtomicU64,
    pub cancel: CancellationToken,
    usage: Arc<dyn UsageSink>,
}

impl SessionCtx {
    pub fn new(sid: u32, port: u16, usage: Arc<dyn UsageSink>, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            sid,
            port,
            started_at: Instant::now(),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            cancel,
            usage,
        })
    }

    fn record(&self, direction: Direction, n: u64) {
        match direction {
            Direction::Up => self.bytes_up.fetch_add(n, Ordering::Relaxed),
            Direction::Down => self.bytes_down.fetch_add(n, Ordering::Relaxed),
        };
        self.usage.record_bytes(self.port, direction, n);
    }

    /// Attribute bytes flowing toward the behind-peer
    pub fn record_up(&self, n: u64) {
        self.record(Direction::Up, n);
    }

    /// Attribute bytes flowing toward the end user
    pub fn record_down(&self, n: u64) {
        self.record(Direction::Down, n);
    }
}

/// Copy bytes in both directions until either side closes, the session is
/// cancelled, or a fatal read/write error occurs.
///
/// `user` is the front-facing end (or local service on the behind-peer),
/// `tunnel` the peer-facing stream.
pub async fn relay(ctx: Arc<SessionCtx>, user: BoxedStream, tunnel: BoxedStream) {
    let (user_rd, user_wr) = tokio::io::split(user);
    let (tunnel_rd, tunnel_wr) = tokio::io::split(tunnel);

    let mut up = tokio::spawn(copy_direction(user_rd, tunnel_wr, Arc::clone(&ctx), Direction::Up));
    let mut down =
        tokio::spawn(copy_direction(tunnel_rd, user_wr, Arc::clone(&ctx), Direction::Down));

    tokio::select! {
        _ = ctx.cancel.cancelled() => {
            up.abort();
            down.abort();
        }
        _ = &mut up => drain_remaining(&ctx, &mut down).await,
        _ = &mut down => drain_remaining(&ctx, &mut up).await,
    }

    debug!(
        sid = ctx.sid,
        port = ctx.port,
        bytes_up = ctx.bytes_up.load(Ordering::Relaxed),
        bytes_down = ctx.bytes_down.load(Ordering::Relaxed),
        elapsed_ms = ctx.started_at.elapsed().as_millis() as u64,
        "session terminated"
    );
}

/// Let the opposite direction flush in-flight bytes before teardown
async fn drain_remaining(
    ctx: &Arc<SessionCtx>,
    remaining: &mut tokio::task::JoinHandle<io::Result<u64>>,
) {
    tokio::select! {
        _ = ctx.cancel.cancelled() => remaining.abort(),
        _ = tokio::time::sleep(DRAIN_TIMEOUT) => remaining.abort(),
        _ = &mut *remaining => {}
    }
}

async fn copy_direction<R, W>(
    mut reader: R,
    mut writer: W,
    ctx: Arc<SessionCtx>,
    direction: Direction,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    let result = loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break Ok(total),
            Ok(n) => n,
            Err(e) => break Err(e),
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            break Err(e);
        }
        ctx.record(direction, n as u64);
        total += n as u64;
    };

    // Propagate EOF so the far side's read loop terminates too
    let _ = writer.shutdown().await;

    if let Err(e) = &result {
        debug!(sid = ctx.sid, ?direction, error = %e, "copy direction failed");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::UsageStore;
    use tokio::io::duplex;

    #[test]
    fn test_sid_allocation_is_monotonic() {
        let alloc = SidAllocator::new();
        let a = alloc.next();
        let b = alloc.next();
        let c = alloc.next();
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn test_relay_echo_accounting() {
        let usage = UsageStore::ephemeral();
        let cancel = CancellationToken::new();
        let ctx = SessionCtx::new(1, 7000, usage.clone(), cancel);

        // user end <-> relay <-> tunnel end that echoes
        let (user_near, mut user_far) = duplex(1024);
        let (tunnel_near, mut tunnel_far) = duplex(1024);

        let echo = tokio::spawn(async move {
            let mut buf = [0u8; 4];
            tunnel_far.read_exact(&mut buf).await.unwrap();
            tunnel_far.write_all(&buf).await.unwrap();
            buf
        });

        let relay_ctx = Arc::clone(&ctx);
        let relay_task =
            tokio::spawn(relay(relay_ctx, Box::new(user_near), Box::new(tunnel_near)));

        user_far.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        user_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        drop(user_far);

        echo.await.unwrap();
        relay_task.await.unwrap();

        assert_eq!(ctx.bytes_up.load(Ordering::Relaxed), 4);
        assert_eq!(ctx.bytes_down.load(Ordering::Relaxed), 4);

        let port = usage.port_usage(7000).unwrap();
        assert_eq!(port.bytes_up, 4);
        assert_eq!(port.bytes_down, 4);
    }

    #[tokio::test]
    async fn test_relay_stops_on_cancel() {
        let usage = UsageStore::ephemeral();
        let cancel = CancellationToken::new();
        let ctx = SessionCtx::new(2, 80, usage, cancel.clone());

        let (user_near, user_far) = duplex(64);
        let (tunnel_near, tunnel_far) = duplex(64);

        let relay_task = tokio::spawn(relay(ctx, Box::new(user_near), Box::new(tunnel_near)));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), relay_task)
            .await
            .expect("relay should stop promptly after cancel")
            .unwrap();

        drop(user_far);
        drop(tunnel_far);
    }
}
