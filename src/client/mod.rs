//! Behind-peer: NAT-ed side of the tunnel
//!
//! Dials the front-peer's control channel, keeps the configured number of
//! warm data resources (or mux carriers) ready, and glues dispatched
//! sessions to local services. The control channel reconnects with backoff
//! forever; data dials back off exponentially while the channel is Ready.

use crate::config::{ClientConfig, TransportType};
use crate::mux::{MuxSession, MuxStream};
use crate::pool::ResourcePool;
use crate::protocol::{self, ControlFrame, HANDSHAKE_TIMEOUT};
use crate::session::{relay, SessionCtx};
use crate::transport::{
    self, BoxedStream, DataDialer, TcpDialer, WsDialer, DIAL_BACKOFF_CAP, DIAL_BACKOFF_START,
};
use crate::tuning::{PeerRole, SharedParams};
use crate::usage::UsageStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

/// Graceful drain window after cancellation
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Idle budget for behind-side UDP flows
const UDP_FLOW_IDLE: Duration = Duration::from_secs(60);

struct PendingDispatch {
    dest_port: u16,
    at: Instant,
}

/// Shared behind-peer state
struct BehindState {
    config: ClientConfig,
    params: SharedParams,
    usage: Arc<UsageStore>,
    root: CancellationToken,
    sessions: TaskTracker,
    /// DISPATCH ↔ sub-stream rendezvous for sid-correlated transports
    pending: Mutex<HashMap<u32, PendingDispatch>>,
    pending_notify: Notify,
    /// Tuned keepalive values to advertise to the front-peer
    keepalive_rx: Option<watch::Receiver<u64>>,
}

impl BehindState {
    fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.config.dial_timeout)
    }

    fn socket_options(&self) -> transport::SocketOptions {
        self.params.read().unwrap().socket_options(PeerRole::Client)
    }

    fn data_dialer(&self) -> Arc<dyn DataDialer> {
        match self.config.transport {
            TransportType::Ws
            | TransportType::Wss
            | TransportType::WsMux
            | TransportType::WssMux => Arc::new(WsDialer {
                remote_addr: self.config.remote_addr.clone(),
                edge_ip: self.config.edge_ip.clone(),
                token: self.config.token.clone(),
                tls: self.config.transport.is_tls(),
                timeout: self.dial_timeout(),
                opts: self.socket_options(),
                retries: 1,
            }),
            _ => Arc::new(TcpDialer {
                remote_addr: self.config.remote_addr.clone(),
                timeout: self.dial_timeout(),
                opts: self.socket_options(),
                retries: 1,
            }),
        }
    }

    /// Record a dispatch for a sub-stream that may already be in flight.
    fn register_dispatch(&self, sid: u32, dest_port: u16) {
        let mut pending = self.pending.lock().unwrap();
        let stale = self.dial_timeout() * 2;
        pending.retain(|_, p| p.at.elapsed() < stale);
        pending.insert(sid, PendingDispatch { dest_port, at: Instant::now() });
        drop(pending);
        self.pending_notify.notify_waiters();
    }

    /// Wait until the DISPATCH matching `sid` arrives.
    async fn wait_for_dispatch(&self, sid: u32, timeout: Duration) -> Option<u16> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(p) = self.pending.lock().unwrap().remove(&sid) {
                return Some(p.dest_port);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let notified = self.pending_notify.notified();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(remaining) => {
                    return self.pending.lock().unwrap().remove(&sid).map(|p| p.dest_port);
                }
            }
        }
    }
}

/// The behind-peer
pub struct TunnelClient {
    state: Arc<BehindState>,
}

impl TunnelClient {
    pub fn new(
        config: ClientConfig,
        params: SharedParams,
        usage: Arc<UsageStore>,
        cancel: CancellationToken,
        keepalive_rx: Option<watch::Receiver<u64>>,
    ) -> crate::Result<Self> {
        config.validate()?;
        Ok(Self {
            state: Arc::new(BehindState {
                config,
                params,
                usage,
                root: cancel,
                sessions: TaskTracker::new(),
                pending: Mutex::new(HashMap::new()),
                pending_notify: Notify::new(),
                keepalive_rx,
            }),
        })
    }

    /// Run until the root token is cancelled, reconnecting the control
    /// channel with `retry_interval` between attempts. Returns `true` when
    /// all sessions drained inside the graceful window.
    pub async fn run(&self) -> crate::Result<bool> {
        let state = &self.state;
        info!(
            transport = %state.config.transport,
            remote_addr = %state.config.remote_addr,
            "behind-peer starting"
        );

        let retry = Duration::from_secs(state.config.retry_interval.max(1));
        while !state.root.is_cancelled() {
            let generation = state.root.child_token();
            let _guard = generation.clone().drop_guard();

            let outcome = match state.config.transport {
                TransportType::Quic => run_quic_channel(state, &generation).await,
                _ => run_stream_channel(state, &generation).await,
            };

            match outcome {
                Ok(()) => info!("control channel closed, reconnecting"),
                Err(e) => warn!(error = %e, "control channel failed, reconnecting"),
            }

            tokio::select! {
                _ = state.root.cancelled() => break,
                _ = tokio::time::sleep(retry) => {}
            }
        }

        state.sessions.close();
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, state.sessions.wait()).await.is_ok();
        if drained {
            info!("all sessions drained");
        } else {
            warn!("shutdown grace period expired with sessions still active");
        }
        Ok(drained)
    }
}

/// Authenticate and learn the server's heartbeat interval.
async fn control_handshake<S>(stream: &mut S, token: &str) -> crate::Result<u64>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    protocol::write_frame(stream, &ControlFrame::Hello { token: token.to_string() }).await?;

    let reply = tokio::time::timeout(
        Duration::from_secs(HANDSHAKE_TIMEOUT),
        protocol::read_frame(stream),
    )
    .await
    .map_err(|_| crate::Error::Timeout)??;

    match reply {
        ControlFrame::HelloOk { heartbeat } => Ok(heartbeat.max(1) as u64),
        ControlFrame::Close => Err(crate::Error::AuthenticationFailed),
        other => Err(protocol::ProtocolError::UnexpectedFrame(format!("{:?}", other)).into()),
    }
}

/// One control-channel generation over a stream transport (tcp, ws, udp
/// ingress, and both mux variants).
async fn run_stream_channel(
    state: &Arc<BehindState>,
    generation: &CancellationToken,
) -> crate::Result<()> {
    let dialer = state.data_dialer();

    let mut control = dialer.dial().await?;
    let heartbeat = control_handshake(&mut control, &state.config.token).await?;
    info!(heartbeat, "control channel ready");

    let (rd, wr) = tokio::io::split(control);
    let channel_size = state.params.read().unwrap().channel_size;
    let (tx, rx) = mpsc::channel(channel_size);
    tokio::spawn(control_writer(wr, rx, generation.clone()));
    if let Some(updates) = state.keepalive_rx.clone() {
        tokio::spawn(keepalive_notifier(updates, tx.clone(), generation.clone()));
    }

    // Data-resource supply for this generation
    if state.config.transport.is_mux() {
        for index in 0..state.config.mux_session.max(1) {
            tokio::spawn(carrier_keeper(
                Arc::clone(state),
                Arc::clone(&dialer),
                generation.clone(),
                index,
            ));
        }
    } else {
        let pool = Arc::new(ResourcePool::new(
            state.config.connection_pool,
            state.config.aggressive_pool,
        ));
        tokio::spawn(refill_worker(
            Arc::clone(state),
            Arc::clone(&pool),
            Arc::clone(&dialer),
            generation.clone(),
        ));
        return control_loop(state, rd, tx, heartbeat, generation, Some(pool)).await;
    }

    control_loop(state, rd, tx, heartbeat, generation, None).await
}

/// Control reader: dispatch handling plus the 3×Heartbeat liveness
/// deadline. Returning resets the channel.
async fn control_loop<R>(
    state: &Arc<BehindState>,
    mut rd: R,
    tx: mpsc::Sender<ControlFrame>,
    heartbeat: u64,
    generation: &CancellationToken,
    pool: Option<Arc<ResourcePool<BoxedStream>>>,
) -> crate::Result<()>
where
    R: AsyncRead + Send + Unpin,
{
    let deadline = Duration::from_secs(heartbeat * 3);
    loop {
        let frame = tokio::select! {
            _ = generation.cancelled() => {
                // Orderly shutdown: tell the front before the writer dies
                let _ = tokio::time::timeout(
                    Duration::from_millis(500),
                    tx.send(ControlFrame::Close),
                )
                .await;
                return Ok(());
            }
            frame = tokio::time::timeout(deadline, protocol::read_frame(&mut rd)) => frame,
        };

        let frame = match frame {
            Ok(frame) => frame?,
            Err(_) => {
                warn!(deadline_s = deadline.as_secs(), "heartbeat deadline missed, resetting channel");
                return Ok(());
            }
        };

        match frame {
            ControlFrame::Ping => {
                let _ = tx.send(ControlFrame::Pong).await;
            }
            ControlFrame::Pong => trace!("control pong"),
            ControlFrame::Keepalive { period } => {
                let period = period.max(1) as u64;
                if crate::tuning::adopt_keepalive(&state.params, period) {
                    info!(keepalive = period, "adopted peer keepalive");
                    // Confirm once so the peer's mirror converges too
                    let _ = tx.send(ControlFrame::Keepalive { period: period as u16 }).await;
                } else {
                    trace!(keepalive = period, "peer keepalive already in sync");
                }
            }
            ControlFrame::Dispatch { sid, dest_port } => match &pool {
                Some(pool) => {
                    let conn = pool.try_acquire();
                    handle_pool_dispatch(state, conn, sid, dest_port, generation);
                }
                None => state.register_dispatch(sid, dest_port),
            },
            ControlFrame::Close => {
                info!("front-peer requested close");
                return Ok(());
            }
            other => debug!(?other, "unexpected frame on control channel"),
        }
    }
}

async fn control_writer<W>(
    mut wr: W,
    mut rx: mpsc::Receiver<ControlFrame>,
    generation: CancellationToken,
) where
    W: AsyncWrite + Send + Unpin,
{
    loop {
        // Biased toward the queue so frames enqueued right before a
        // cancellation (CLOSE) still go out
        let frame = tokio::select! {
            biased;
            maybe = rx.recv() => match maybe {
                Some(frame) => frame,
                None => break,
            },
            _ = generation.cancelled() => break,
        };
        if let Err(e) = protocol::write_frame(&mut wr, &frame).await {
            debug!(error = %e, "control write failed");
            break;
        }
    }
    let _ = wr.shutdown().await;
}

/// Forward tuned keepalive values to the peer as KEEPALIVE frames. The
/// current value is advertised on channel establishment so a reconnecting
/// peer catches up immediately.
async fn keepalive_notifier(
    mut rx: watch::Receiver<u64>,
    tx: mpsc::Sender<ControlFrame>,
    generation: CancellationToken,
) {
    loop {
        let period = (*rx.borrow_and_update()).min(u16::MAX as u64) as u16;
        if tx.send(ControlFrame::Keepalive { period }).await.is_err() {
            return;
        }
        info!(keepalive = period, "advertised keepalive to peer");

        tokio::select! {
            _ = generation.cancelled() => return,
            changed = rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

/// Keep the pool at its live target; every dispatch consumption triggers an
/// immediate replacement. Dial failures back off exponentially and never
/// give up while the generation lives.
async fn refill_worker(
    state: Arc<BehindState>,
    pool: Arc<ResourcePool<BoxedStream>>,
    dialer: Arc<dyn DataDialer>,
    generation: CancellationToken,
) {
    let mut backoff = DIAL_BACKOFF_START;
    // Announcement sequence; the front orders its pool by it so both FIFOs
    // consume the same connection for the same dispatch.
    let mut seq: u32 = 1;
    loop {
        if generation.is_cancelled() {
            return;
        }
        pool.set_target(state.params.read().unwrap().connection_pool);

        if pool.deficit() == 0 {
            tokio::select! {
                _ = generation.cancelled() => return,
                _ = pool.consumption() => {}
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
            continue;
        }

        match dialer.dial().await {
            Ok(mut conn) => match protocol::write_frame(&mut conn, &ControlFrame::Ready { sid: seq })
                .await
            {
                Ok(()) => {
                    seq = seq.wrapping_add(1);
                    pool.push(conn);
                    backoff = DIAL_BACKOFF_START;
                    trace!(ready = pool.len(), target = pool.current_target(), "pool refilled");
                    continue;
                }
                Err(e) => debug!(error = %e, "failed to announce data connection"),
            },
            Err(e) => debug!(error = %e, "data dial failed"),
        }

        tokio::select! {
            _ = generation.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(DIAL_BACKOFF_CAP);
    }
}

/// Glue one dispatched session to its local service (pooled transports).
fn handle_pool_dispatch(
    state: &Arc<BehindState>,
    conn: Option<BoxedStream>,
    sid: u32,
    dest_port: u16,
    generation: &CancellationToken,
) {
    let Some(conn) = conn else {
        warn!(sid, dest_port, "dispatch arrived with no ready resource");
        return;
    };

    let state = Arc::clone(state);
    let session_cancel = generation.child_token();
    let is_udp = state.config.transport == TransportType::Udp;
    state.sessions.clone().spawn(async move {
        let ctx = SessionCtx::new(sid, dest_port, state.usage.clone(), session_cancel);
        if is_udp {
            udp_behind_flow(ctx, conn, dest_port).await;
            return;
        }

        let local = tokio::time::timeout(
            state.dial_timeout(),
            TcpStream::connect(("127.0.0.1", dest_port)),
        )
        .await;
        match local {
            Ok(Ok(local)) => {
                state.socket_options().apply(&local);
                debug!(sid, dest_port, "session glued to local service");
                relay(ctx, conn, Box::new(local)).await;
            }
            _ => {
                // Closing the assigned resource tells the front the session died
                debug!(sid, dest_port, "local dial failed, closing assigned resource");
            }
        }
    });
}

/// Keep one mux carrier alive for the generation, redialing with backoff.
async fn carrier_keeper(
    state: Arc<BehindState>,
    dialer: Arc<dyn DataDialer>,
    generation: CancellationToken,
    index: usize,
) {
    let mut backoff = DIAL_BACKOFF_START;
    loop {
        if generation.is_cancelled() {
            return;
        }

        match dialer.dial().await {
            Ok(mut conn) => {
                if let Err(e) =
                    protocol::write_frame(&mut conn, &ControlFrame::Ready { sid: 0 }).await
                {
                    debug!(error = %e, "failed to announce mux carrier");
                } else {
                    let params = state.params.read().unwrap().mux_params();
                    let (session, mut incoming) = MuxSession::spawn(conn, params);
                    info!(
                        carrier = index,
                        mux_con = params.mux_con,
                        mux_version = state.config.mux_version,
                        "mux carrier established"
                    );
                    backoff = DIAL_BACKOFF_START;

                    let keepalive = state.params.read().unwrap().client_keepalive.max(1);
                    loop {
                        tokio::select! {
                            _ = generation.cancelled() => return,
                            _ = session.closed() => break,
                            maybe = incoming.recv() => match maybe {
                                Some((sid, stream)) => {
                                    let state = Arc::clone(&state);
                                    let session_cancel = generation.child_token();
                                    tokio::spawn(handle_mux_incoming(state, sid, stream, session_cancel));
                                }
                                None => break,
                            },
                            _ = tokio::time::sleep(Duration::from_secs(keepalive)) => {
                                if session.send_ping().await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    warn!(carrier = index, "mux carrier lost, redialing");
                }
            }
            Err(e) => debug!(carrier = index, error = %e, "carrier dial failed"),
        }

        tokio::select! {
            _ = generation.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(DIAL_BACKOFF_CAP);
    }
}

/// Pair an inbound sub-stream with its DISPATCH and glue it locally.
async fn handle_mux_incoming(
    state: Arc<BehindState>,
    sid: u32,
    stream: MuxStream,
    session_cancel: CancellationToken,
) {
    let Some(dest_port) = state.wait_for_dispatch(sid, state.dial_timeout()).await else {
        debug!(sid, "sub-stream arrived without a matching dispatch");
        return;
    };

    let local = tokio::time::timeout(
        state.dial_timeout(),
        TcpStream::connect(("127.0.0.1", dest_port)),
    )
    .await;
    match local {
        Ok(Ok(local)) => {
            state.socket_options().apply(&local);
            debug!(sid, dest_port, "mux session glued to local service");
            let ctx = SessionCtx::new(sid, dest_port, state.usage.clone(), session_cancel);
            state.sessions.clone().spawn(relay(ctx, Box::new(stream), Box::new(local)));
        }
        _ => {
            debug!(sid, dest_port, "local dial failed, closing sub-stream");
        }
    }
}

/// One control-channel generation over QUIC.
async fn run_quic_channel(
    state: &Arc<BehindState>,
    generation: &CancellationToken,
) -> crate::Result<()> {
    let endpoint = {
        let params = state.params.read().unwrap();
        transport::make_client_endpoint(
            params.mux_con,
            Duration::from_secs(params.client_keepalive),
        )
    }?;

    let host = state
        .config
        .remote_addr
        .rsplit_once(':')
        .map(|(host, _)| host.to_string())
        .unwrap_or_else(|| state.config.remote_addr.clone());
    let addr = tokio::net::lookup_host(&state.config.remote_addr)
        .await?
        .next()
        .ok_or_else(|| {
            crate::Error::Config(format!("could not resolve {}", state.config.remote_addr))
        })?;

    let conn = endpoint
        .connect(addr, &host)
        .map_err(|e| crate::Error::Transport(transport::TransportError::Quic(e.to_string())))?
        .await
        .map_err(|e| crate::Error::Transport(transport::TransportError::Quic(e.to_string())))?;

    let (send, recv) = conn
        .open_bi()
        .await
        .map_err(|e| crate::Error::Transport(transport::TransportError::Quic(e.to_string())))?;

    // Joined only for the handshake; afterwards the halves run in separate
    // reader/writer tasks like every other transport.
    let mut control = transport::join_bi(send, recv);
    let heartbeat = control_handshake(&mut control, &state.config.token).await?;
    info!(heartbeat, "QUIC control channel ready");
    let (recv, send) = control.into_inner();

    let channel_size = state.params.read().unwrap().channel_size;
    let (tx, rx) = mpsc::channel(channel_size);
    tokio::spawn(control_writer(send, rx, generation.clone()));
    if let Some(updates) = state.keepalive_rx.clone() {
        tokio::spawn(keepalive_notifier(updates, tx.clone(), generation.clone()));
    }

    // Session streams opened by the front-peer
    {
        let state = Arc::clone(state);
        let conn = conn.clone();
        let generation = generation.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = generation.cancelled() => break,
                    accepted = conn.accept_bi() => accepted,
                };
                match accepted {
                    Ok((send, recv)) => {
                        let state = Arc::clone(&state);
                        let session_cancel = generation.child_token();
                        tokio::spawn(handle_quic_stream(state, send, recv, session_cancel));
                    }
                    Err(e) => {
                        debug!(error = %e, "QUIC connection lost");
                        break;
                    }
                }
            }
        });
    }

    let result = control_loop(state, recv, tx, heartbeat, generation, None).await;
    conn.close(0u32.into(), b"channel reset");
    result
}

/// Read the sid tag, rendezvous with its DISPATCH, glue locally.
async fn handle_quic_stream(
    state: Arc<BehindState>,
    send: quinn::SendStream,
    mut recv: quinn::RecvStream,
    session_cancel: CancellationToken,
) {
    let mut sid_buf = [0u8; 4];
    if let Err(e) = recv.read_exact(&mut sid_buf).await {
        debug!(error = %e, "failed to read QUIC stream tag");
        return;
    }
    let sid = u32::from_be_bytes(sid_buf);

    let Some(dest_port) = state.wait_for_dispatch(sid, state.dial_timeout()).await else {
        debug!(sid, "QUIC stream arrived without a matching dispatch");
        return;
    };

    let local = tokio::time::timeout(
        state.dial_timeout(),
        TcpStream::connect(("127.0.0.1", dest_port)),
    )
    .await;
    match local {
        Ok(Ok(local)) => {
            state.socket_options().apply(&local);
            debug!(sid, dest_port, "quic session glued to local service");
            let ctx = SessionCtx::new(sid, dest_port, state.usage.clone(), session_cancel);
            let stream = transport::join_bi(send, recv);
            state.sessions.clone().spawn(relay(ctx, Box::new(stream), Box::new(local)));
        }
        _ => {
            debug!(sid, dest_port, "local dial failed, closing QUIC stream");
        }
    }
}

/// Behind side of a UDP ingress flow: unframe datagrams toward the local
/// service and frame responses back.
async fn udp_behind_flow(ctx: Arc<SessionCtx>, conn: BoxedStream, dest_port: u16) {
    let socket = match UdpSocket::bind("127.0.0.1:0").await {
        Ok(socket) => socket,
        Err(e) => {
            debug!(sid = ctx.sid, error = %e, "failed to bind local UDP socket");
            return;
        }
    };
    if let Err(e) = socket.connect(("127.0.0.1", dest_port)).await {
        debug!(sid = ctx.sid, dest_port, error = %e, "failed to connect local UDP socket");
        return;
    }

    let socket = Arc::new(socket);
    let (mut rd, mut wr) = tokio::io::split(conn);
    let flow = ctx.cancel.child_token();
    let activity = Arc::new(Mutex::new(Instant::now()));

    // One task per direction: racing the framed read against the socket
    // would lose partially read frames on cancellation.
    let mut from_tunnel = {
        let flow = flow.clone();
        let activity = Arc::clone(&activity);
        let ctx = Arc::clone(&ctx);
        let socket = Arc::clone(&socket);
        tokio::spawn(async move {
            loop {
                let payload = tokio::select! {
                    _ = flow.cancelled() => break,
                    framed = transport::read_datagram(&mut rd) => match framed {
                        Ok(Some(payload)) => payload,
                        _ => break,
                    },
                };
                let len = payload.len() as u64;
                if socket.send(&payload).await.is_err() {
                    break;
                }
                ctx.record_up(len);
                *activity.lock().unwrap() = Instant::now();
            }
        })
    };

    let mut from_service = {
        let flow = flow.clone();
        let activity = Arc::clone(&activity);
        let ctx = Arc::clone(&ctx);
        let socket = Arc::clone(&socket);
        tokio::spawn(async move {
            let mut buf = vec![0u8; transport::MAX_DATAGRAM_SIZE];
            loop {
                let n = tokio::select! {
                    _ = flow.cancelled() => break,
                    received = socket.recv(&mut buf) => match received {
                        Ok(n) => n,
                        Err(_) => break,
                    },
                };
                if transport::write_datagram(&mut wr, &buf[..n]).await.is_err() {
                    break;
                }
                ctx.record_down(n as u64);
                *activity.lock().unwrap() = Instant::now();
            }
            let _ = wr.shutdown().await;
        })
    };

    let mut tunnel_done = false;
    let mut service_done = false;
    loop {
        tokio::select! {
            _ = flow.cancelled() => break,
            _ = &mut from_tunnel, if !tunnel_done => {
                tunnel_done = true;
                if service_done {
                    break;
                }
            }
            _ = &mut from_service, if !service_done => {
                service_done = true;
                if tunnel_done {
                    break;
                }
            }
            _ = tokio::time::sleep(UDP_FLOW_IDLE) => {
                if activity.lock().unwrap().elapsed() >= UDP_FLOW_IDLE {
                    debug!(sid = ctx.sid, "udp flow idle, closing");
                    break;
                }
            }
        }
    }

    flow.cancel();
    if !tunnel_done {
        let _ = from_tunnel.await;
    }
    if !service_done {
        let _ = from_service.await;
    }
}

impl crate::usage::ConfigProvider for TunnelClient {
    fn server_config(&self) -> Option<crate::config::ServerConfig> {
        None
    }

    /// Live snapshot with tuner-mutated fields folded in
    fn client_config(&self) -> Option<ClientConfig> {
        let mut cfg = self.state.config.clone();
        let p = self.state.params.read().unwrap();
        cfg.keepalive_period = p.client_keepalive;
        cfg.connection_pool = p.connection_pool;
        cfg.mux_framesize = p.mux_framesize;
        cfg.mux_receivebuffer = p.mux_receivebuffer;
        cfg.mux_streambuffer = p.mux_streambuffer;
        cfg.nodelay = p.nodelay;
        Some(cfg)
    }
}
