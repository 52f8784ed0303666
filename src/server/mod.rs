//! Front-peer: public side of the tunnel
//!
//! Binds the control channel and the published ports, accepts end-user
//! connections, and schedules each one onto a data resource supplied by
//! the behind-peer. Data connections and the control channel share
//! `bind_addr`; the first frame on every inbound connection decides which
//! one it is (HELLO with a valid token ⇒ control, READY ⇒ data).

use crate::config::{PortMapping, ServerConfig, TransportType};
use crate::mux::{MuxError, MuxSession};
use crate::pool::ResourcePool;
use crate::protocol::{self, ControlFrame, HANDSHAKE_TIMEOUT};
use crate::session::{relay, SessionCtx, SidAllocator};
use crate::transport::{
    self, BoxedStream, DataAcceptor, SocketOptions, TcpAcceptor, WsAcceptor,
};
use crate::tuning::{PeerRole, SharedParams};
use crate::usage::UsageStore;
use socket2::SockRef;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

/// Graceful drain window after cancellation
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Poll cadence while waiting for mux carrier capacity
const CARRIER_WAIT_TICK: Duration = Duration::from_millis(50);

/// Handle to the one Ready control channel
#[derive(Clone)]
struct ControlHandle {
    id: u64,
    tx: mpsc::Sender<ControlFrame>,
    generation: CancellationToken,
}

/// Shared front-peer state
struct FrontState {
    config: ServerConfig,
    params: SharedParams,
    usage: Arc<UsageStore>,
    root: CancellationToken,
    control: Mutex<Option<ControlHandle>>,
    control_ids: AtomicU64,
    /// Data connections ordered by the behind-peer's announcement sequence
    /// (pooled transports)
    pool: ResourcePool<(u32, BoxedStream)>,
    /// Mux carriers (mux transports)
    carriers: Mutex<Vec<Arc<MuxSession>>>,
    carrier_rr: AtomicUsize,
    /// Live QUIC connection (quic transport)
    quic: Mutex<Option<quinn::Connection>>,
    quic_permits: Arc<Semaphore>,
    sids: SidAllocator,
    /// Serializes resource acquisition + DISPATCH so FIFO correlation holds
    dispatch_lock: tokio::sync::Mutex<()>,
    starved_sessions: AtomicU64,
    sessions: TaskTracker,
    /// Tuned keepalive values to advertise to the behind-peer
    keepalive_rx: Option<watch::Receiver<u64>>,
}

impl FrontState {
    fn current_control(&self) -> Option<ControlHandle> {
        self.control.lock().unwrap().clone()
    }

    /// Replace the control channel; at most one is Ready at any instant.
    fn install_control(&self, handle: ControlHandle) {
        let old = self.control.lock().unwrap().replace(handle);
        if let Some(old) = old {
            warn!("replacing existing control channel");
            old.generation.cancel();
        }
        self.pool.drain();
        self.carriers.lock().unwrap().clear();
    }

    /// Tear down the channel identified by `id` (missed heartbeat, read
    /// error, CLOSE). Sessions die with the generation token; the pool is
    /// drained so stale resources are never handed to new sessions.
    fn reset_control(&self, id: u64) {
        let mut slot = self.control.lock().unwrap();
        match slot.as_ref() {
            Some(current) if current.id == id => {
                info!("control channel reset, tearing down sessions");
                let handle = slot.take().unwrap();
                drop(slot);
                handle.generation.cancel();
                self.pool.drain();
                self.carriers.lock().unwrap().clear();
                if let Some(conn) = self.quic.lock().unwrap().take() {
                    conn.close(0u32.into(), b"control reset");
                }
            }
            _ => {}
        }
    }

    fn heartbeat(&self) -> u64 {
        self.params.read().unwrap().heartbeat
    }

    fn socket_options(&self) -> SocketOptions {
        self.params.read().unwrap().socket_options(PeerRole::Server)
    }

    fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.config.dial_timeout)
    }

    fn note_starved(&self, sid: u32, port: u16) {
        self.starved_sessions.fetch_add(1, Ordering::Relaxed);
        warn!(sid, port, "session dropped waiting for a ready resource");
    }
}

/// The front-peer
pub struct TunnelServer {
    state: Arc<FrontState>,
    mappings: Vec<PortMapping>,
}

impl TunnelServer {
    pub fn new(
        config: ServerConfig,
        params: SharedParams,
        usage: Arc<UsageStore>,
        cancel: CancellationToken,
        keepalive_rx: Option<watch::Receiver<u64>>,
    ) -> crate::Result<Self> {
        let mappings = config.validate()?;
        let pool_target = crate::config::defaults::CONNECTION_POOL;
        let state = Arc::new(FrontState {
            quic_permits: Arc::new(Semaphore::new(config.mux_con.max(1))),
            config,
            params,
            usage,
            root: cancel,
            control: Mutex::new(None),
            control_ids: AtomicU64::new(1),
            pool: ResourcePool::new(pool_target, false),
            carriers: Mutex::new(Vec::new()),
            carrier_rr: AtomicUsize::new(0),
            quic: Mutex::new(None),
            sids: SidAllocator::new(),
            dispatch_lock: tokio::sync::Mutex::new(()),
            starved_sessions: AtomicU64::new(0),
            sessions: TaskTracker::new(),
            keepalive_rx,
        });
        Ok(Self { state, mappings })
    }

    /// Sessions dropped due to pool starvation
    pub fn starved_sessions(&self) -> u64 {
        self.state.starved_sessions.load(Ordering::Relaxed)
    }

    /// Run until the root token is cancelled. Returns `true` when all
    /// sessions drained inside the graceful window.
    pub async fn run(&self) -> crate::Result<bool> {
        let transport = self.state.config.transport;
        info!(
            transport = %transport,
            bind_addr = %self.state.config.bind_addr,
            ports = self.mappings.len(),
            "front-peer starting"
        );

        self.spawn_port_listeners().await?;

        match transport {
            TransportType::Tcp | TransportType::Udp | TransportType::TcpMux => {
                let acceptor = TcpAcceptor::bind(
                    &self.state.config.bind_addr,
                    self.state.socket_options(),
                )
                .await?;
                self.spawn_accept_loop(Arc::new(acceptor));
            }
            TransportType::Ws | TransportType::Wss | TransportType::WsMux
            | TransportType::WssMux => {
                let tls = if transport.is_tls() {
                    let (cert, key) = self.require_tls_files()?;
                    Some(transport::load_tls_acceptor(&cert, &key)?)
                } else {
                    None
                };
                let acceptor = WsAcceptor::bind(
                    &self.state.config.bind_addr,
                    tls,
                    self.state.socket_options(),
                )
                .await?;
                self.spawn_accept_loop(Arc::new(acceptor));
            }
            TransportType::Quic => self.spawn_quic_endpoint()?,
        }

        self.state.root.cancelled().await;

        self.state.sessions.close();
        let drained =
            tokio::time::timeout(SHUTDOWN_GRACE, self.state.sessions.wait()).await.is_ok();
        if drained {
            info!("all sessions drained");
        } else {
            warn!("shutdown grace period expired with sessions still active");
        }
        Ok(drained)
    }

    fn require_tls_files(&self) -> crate::Result<(String, String)> {
        match (&self.state.config.tls_cert, &self.state.config.tls_key) {
            (Some(cert), Some(key)) => Ok((cert.clone(), key.clone())),
            _ => Err(crate::Error::Config(format!(
                "transport {} requires tls_cert and tls_key",
                self.state.config.transport
            ))),
        }
    }

    /// Accept shared-listener connections and classify each by its first
    /// control frame.
    fn spawn_accept_loop(&self, acceptor: Arc<dyn DataAcceptor>) {
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    _ = state.root.cancelled() => break,
                    accepted = acceptor.accept() => match accepted {
                        Ok(stream) => stream,
                        Err(e) => {
                            debug!(error = %e, "accept failed");
                            continue;
                        }
                    },
                };
                let state = Arc::clone(&state);
                tokio::spawn(classify_connection(state, stream));
            }
        });
    }

    async fn spawn_port_listeners(&self) -> crate::Result<()> {
        let host = listen_host(&self.state.config.bind_addr);
        let wants_tcp_ports = self.state.config.transport != TransportType::Udp;
        let wants_udp_ports = self.state.config.transport == TransportType::Udp
            || self.state.config.accept_udp;

        for mapping in &self.mappings {
            if wants_tcp_ports {
                let addr = format!("{}:{}", host, mapping.listen_port);
                let listener = TcpListener::bind(&addr).await.map_err(|e| {
                    error!(addr, error = %e, "failed to bind published port");
                    crate::Error::Io(e)
                })?;
                info!(port = mapping.listen_port, remote = mapping.remote_port, "published port bound");
                let state = Arc::clone(&self.state);
                let mapping = *mapping;
                tokio::spawn(port_accept_loop(state, listener, mapping));
            }
            if wants_udp_ports {
                let addr = format!("{}:{}", host, mapping.listen_port);
                let socket = UdpSocket::bind(&addr).await.map_err(|e| {
                    error!(addr, error = %e, "failed to bind published UDP port");
                    crate::Error::Io(e)
                })?;
                info!(port = mapping.listen_port, remote = mapping.remote_port, "published UDP port bound");
                let state = Arc::clone(&self.state);
                let mapping = *mapping;
                tokio::spawn(udp_port_loop(state, Arc::new(socket), mapping));
            }
        }
        Ok(())
    }

    fn spawn_quic_endpoint(&self) -> crate::Result<()> {
        let (cert, key) = self.require_tls_files()?;
        let bind_addr: SocketAddr = self
            .state
            .config
            .bind_addr
            .parse()
            .map_err(|e| crate::Error::Config(format!("invalid bind_addr: {}", e)))?;
        let keepalive = self.state.params.read().unwrap().server_keepalive;
        let endpoint = transport::make_server_endpoint(
            bind_addr,
            &cert,
            &key,
            self.state.config.mux_con,
            Duration::from_secs(keepalive),
        )?;

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            loop {
                let incoming = tokio::select! {
                    _ = state.root.cancelled() => break,
                    incoming = endpoint.accept() => match incoming {
                        Some(incoming) => incoming,
                        None => break,
                    },
                };
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    match incoming.await {
                        Ok(conn) => handle_quic_connection(state, conn).await,
                        Err(e) => debug!(error = %e, "QUIC handshake failed"),
                    }
                });
            }
            endpoint.close(0u32.into(), b"shutdown");
        });
        Ok(())
    }
}

/// Host portion of `bind_addr`, reused for published-port binds
fn listen_host(bind_addr: &str) -> String {
    bind_addr.rsplit_once(':').map(|(host, _)| host.to_string()).unwrap_or_else(|| "0.0.0.0".to_string())
}

/// Force an RST instead of a clean FIN when dropping a user connection
fn rst_and_drop(stream: TcpStream) {
    let sock = SockRef::from(&stream);
    let _ = sock.set_linger(Some(Duration::ZERO));
    drop(stream);
}

/// Read the first frame of a shared-listener connection and route it.
async fn classify_connection(state: Arc<FrontState>, mut stream: BoxedStream) {
    let first = tokio::time::timeout(
        Duration::from_secs(HANDSHAKE_TIMEOUT),
        protocol::read_frame(&mut stream),
    )
    .await;

    match first {
        Ok(Ok(ControlFrame::Hello { token })) => {
            if token == state.config.token {
                accept_control(state, stream).await;
            } else {
                warn!("rejected control channel: bad token");
            }
        }
        Ok(Ok(ControlFrame::Ready { sid })) => {
            if state.current_control().is_none() {
                debug!("dropping data connection, no control channel");
                return;
            }
            if state.config.transport.is_mux() {
                accept_carrier(state, stream);
            } else {
                state.pool.push_sorted(sid, stream);
                trace!(seq = sid, pool = state.pool.len(), "data connection pooled");
            }
        }
        Ok(Ok(frame)) => debug!(?frame, "unexpected first frame, dropping connection"),
        Ok(Err(e)) => debug!(error = %e, "bad first frame, dropping connection"),
        Err(_) => debug!("handshake timeout, dropping connection"),
    }
}

/// Complete the HELLO/HELLO_OK handshake and start channel tasks.
///
/// The handle is installed before HELLO_OK goes out so that data
/// connections dialed immediately after the accept are never dropped for
/// lack of a control channel.
async fn accept_control(state: Arc<FrontState>, stream: BoxedStream) {
    let heartbeat = state.heartbeat() as u16;
    let (rd, wr) = tokio::io::split(stream);
    let handle = start_control(&state, rd, wr);
    let tx = handle.tx.clone();
    state.install_control(handle);

    if tx.send(ControlFrame::HelloOk { heartbeat }).await.is_err() {
        warn!("failed to complete control handshake");
        return;
    }
    info!("control channel ready");
}

/// Spawn reader/writer/heartbeat tasks for a fresh control channel.
fn start_control<R, W>(state: &Arc<FrontState>, rd: R, wr: W) -> ControlHandle
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let id = state.control_ids.fetch_add(1, Ordering::Relaxed);
    let generation = state.root.child_token();
    let channel_size = state.params.read().unwrap().channel_size;
    let (tx, rx) = mpsc::channel(channel_size);
    let last_seen = Arc::new(Mutex::new(Instant::now()));

    tokio::spawn(control_writer(wr, rx, generation.clone()));
    tokio::spawn(control_reader(
        rd,
        Arc::clone(state),
        id,
        tx.clone(),
        Arc::clone(&last_seen),
        generation.clone(),
    ));
    tokio::spawn(control_heartbeat(
        Arc::clone(state),
        id,
        tx.clone(),
        last_seen,
        generation.clone(),
    ));
    if let Some(rx) = state.keepalive_rx.clone() {
        tokio::spawn(keepalive_notifier(rx, tx.clone(), generation.clone()));
    }

    ControlHandle { id, tx, generation }
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

async fn control_writer<W>(
    mut wr: W,
    mut rx: mpsc::Receiver<ControlFrame>,
    generation: CancellationToken,
) where
    W: AsyncWrite + Send + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = generation.cancelled() => break,
            maybe = rx.recv() => match maybe {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Err(e) = protocol::write_frame(&mut wr, &frame).await {
            debug!(error = %e, "control write failed");
            break;
        }
    }
    let _ = wr.shutdown().await;
}

async fn control_reader<R>(
    mut rd: R,
    state: Arc<FrontState>,
    id: u64,
    tx: mpsc::Sender<ControlFrame>,
    last_seen: Arc<Mutex<Instant>>,
    generation: CancellationToken,
) where
    R: AsyncRead + Send + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = generation.cancelled() => return,
            frame = protocol::read_frame(&mut rd) => frame,
        };
        match frame {
            Ok(frame) => {
                *last_seen.lock().unwrap() = Instant::now();
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
                    ControlFrame::Close => {
                        info!("behind-peer requested close");
                        state.reset_control(id);
                        return;
                    }
                    other => debug!(?other, "unexpected frame on control channel"),
                }
            }
            Err(e) => {
                debug!(error = %e, "control read failed");
                state.reset_control(id);
                return;
            }
        }
    }
}

/// Front-initiated PING every heartbeat interval; a silent channel for
/// three intervals is reset.
async fn control_heartbeat(
    state: Arc<FrontState>,
    id: u64,
    tx: mpsc::Sender<ControlFrame>,
    last_seen: Arc<Mutex<Instant>>,
    generation: CancellationToken,
) {
    loop {
        let heartbeat = Duration::from_secs(state.heartbeat().max(1));
        tokio::select! {
            _ = generation.cancelled() => return,
            _ = tokio::time::sleep(heartbeat) => {}
        }

        let silent_for = last_seen.lock().unwrap().elapsed();
        if silent_for > heartbeat * 3 {
            warn!(silent_ms = silent_for.as_millis() as u64, "heartbeat deadline missed");
            state.reset_control(id);
            return;
        }
        if tx.send(ControlFrame::Ping).await.is_err() {
            state.reset_control(id);
            return;
        }
    }
}

/// Register an inbound mux carrier and watch for its death.
fn accept_carrier(state: Arc<FrontState>, stream: BoxedStream) {
    let params = state.params.read().unwrap().mux_params();
    let (session, _incoming) = MuxSession::spawn(stream, params);
    let session = Arc::new(session);
    info!(
        mux_con = params.mux_con,
        mux_version = state.config.mux_version,
        "mux carrier registered"
    );

    state.carriers.lock().unwrap().push(Arc::clone(&session));

    let state = Arc::clone(&state);
    tokio::spawn(async move {
        session.closed().await;
        let mut carriers = state.carriers.lock().unwrap();
        carriers.retain(|c| !Arc::ptr_eq(c, &session));
        debug!(remaining = carriers.len(), "mux carrier removed");
    });
}

/// Accept end users on one published port.
async fn port_accept_loop(state: Arc<FrontState>, listener: TcpListener, mapping: PortMapping) {
    loop {
        let (user, peer) = tokio::select! {
            _ = state.root.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(port = mapping.listen_port, error = %e, "user accept failed");
                    continue;
                }
            },
        };
        trace!(port = mapping.listen_port, %peer, "user connection accepted");
        state.socket_options().apply(&user);

        let state = Arc::clone(&state);
        tokio::spawn(async move {
            match state.config.transport {
                TransportType::TcpMux | TransportType::WsMux | TransportType::WssMux => {
                    handle_mux_session(state, user, mapping).await
                }
                TransportType::Quic => handle_quic_session(state, user, mapping).await,
                _ => handle_pooled_session(state, user, mapping).await,
            }
        });
    }
}

/// Pooled transports: consume the oldest ready data connection, FIFO.
async fn handle_pooled_session(state: Arc<FrontState>, user: TcpStream, mapping: PortMapping) {
    let Some(ctrl) = state.current_control() else {
        debug!(port = mapping.listen_port, "no control channel, dropping user");
        return rst_and_drop(user);
    };
    let sid = state.sids.next();

    // Acquisition and DISPATCH are one critical section: resources are
    // correlated by arrival order on both peers.
    let resource = {
        let _guard = state.dispatch_lock.lock().await;
        let Some((_seq, resource)) = state.pool.acquire(state.dial_timeout()).await else {
            state.note_starved(sid, mapping.listen_port);
            return rst_and_drop(user);
        };
        let dispatch = ControlFrame::Dispatch { sid, dest_port: mapping.remote_port };
        if ctrl.tx.send(dispatch).await.is_err() {
            debug!(sid, "control channel went away before dispatch");
            return rst_and_drop(user);
        }
        resource
    };

    debug!(sid, port = mapping.listen_port, dest = mapping.remote_port, "session dispatched");
    let ctx = SessionCtx::new(
        sid,
        mapping.listen_port,
        state.usage.clone(),
        ctrl.generation.child_token(),
    );
    state.sessions.spawn(relay(ctx, Box::new(user), resource));
}

/// Mux transports: open a sub-stream on a carrier with free capacity,
/// round-robin on ties.
async fn handle_mux_session(state: Arc<FrontState>, user: TcpStream, mapping: PortMapping) {
    let Some(ctrl) = state.current_control() else {
        debug!(port = mapping.listen_port, "no control channel, dropping user");
        return rst_and_drop(user);
    };
    let sid = state.sids.next();

    let dispatch = ControlFrame::Dispatch { sid, dest_port: mapping.remote_port };
    if ctrl.tx.send(dispatch).await.is_err() {
        debug!(sid, "control channel went away before dispatch");
        return rst_and_drop(user);
    }

    let deadline = Instant::now() + state.dial_timeout();
    let stream = loop {
        match open_on_any_carrier(&state, sid).await {
            Some(stream) => break stream,
            None => {
                if Instant::now() >= deadline {
                    state.note_starved(sid, mapping.listen_port);
                    return rst_and_drop(user);
                }
                tokio::time::sleep(CARRIER_WAIT_TICK).await;
            }
        }
    };

    debug!(sid, port = mapping.listen_port, dest = mapping.remote_port, "mux session dispatched");
    let ctx = SessionCtx::new(
        sid,
        mapping.listen_port,
        state.usage.clone(),
        ctrl.generation.child_token(),
    );
    state.sessions.spawn(relay(ctx, Box::new(user), Box::new(stream)));
}

async fn open_on_any_carrier(state: &Arc<FrontState>, sid: u32) -> Option<crate::mux::MuxStream> {
    let candidates: Vec<Arc<MuxSession>> = {
        let mut carriers = state.carriers.lock().unwrap();
        carriers.retain(|c| !c.is_closed());
        if carriers.is_empty() {
            return None;
        }
        let start = state.carrier_rr.fetch_add(1, Ordering::Relaxed) % carriers.len();
        carriers.iter().cycle().skip(start).take(carriers.len()).cloned().collect()
    };

    for carrier in candidates {
        if carrier.free_slots() == 0 {
            continue;
        }
        match carrier.open_stream(sid).await {
            Ok(stream) => return Some(stream),
            Err(MuxError::CarrierFull(_)) => continue,
            Err(e) => {
                debug!(error = %e, "carrier rejected sub-stream");
                continue;
            }
        }
    }
    None
}

/// QUIC: sessions ride fresh bidirectional streams, bounded by `mux_con`.
async fn handle_quic_session(state: Arc<FrontState>, user: TcpStream, mapping: PortMapping) {
    let Some(ctrl) = state.current_control() else {
        debug!(port = mapping.listen_port, "no control channel, dropping user");
        return rst_and_drop(user);
    };
    let Some(conn) = state.quic.lock().unwrap().clone() else {
        return rst_and_drop(user);
    };
    let sid = state.sids.next();

    let permit = match tokio::time::timeout(
        state.dial_timeout(),
        Arc::clone(&state.quic_permits).acquire_owned(),
    )
    .await
    {
        Ok(Ok(permit)) => permit,
        _ => {
            state.note_starved(sid, mapping.listen_port);
            return rst_and_drop(user);
        }
    };

    let dispatch = ControlFrame::Dispatch { sid, dest_port: mapping.remote_port };
    if ctrl.tx.send(dispatch).await.is_err() {
        return rst_and_drop(user);
    }

    let stream = match conn.open_bi().await {
        Ok((mut send, recv)) => {
            if let Err(e) = tokio::io::AsyncWriteExt::write_all(&mut send, &sid.to_be_bytes()).await
            {
                debug!(sid, error = %e, "failed to tag QUIC stream");
                return rst_and_drop(user);
            }
            transport::join_bi(send, recv)
        }
        Err(e) => {
            debug!(sid, error = %e, "failed to open QUIC stream");
            return rst_and_drop(user);
        }
    };

    debug!(sid, port = mapping.listen_port, dest = mapping.remote_port, "quic session dispatched");
    let ctx = SessionCtx::new(
        sid,
        mapping.listen_port,
        state.usage.clone(),
        ctrl.generation.child_token(),
    );
    state.sessions.spawn(async move {
        let _permit = permit;
        relay(ctx, Box::new(user), Box::new(stream)).await;
    });
}

/// First bidirectional stream is the control channel; authenticate it and
/// adopt the connection.
async fn handle_quic_connection(state: Arc<FrontState>, conn: quinn::Connection) {
    let (send, mut recv) = match conn.accept_bi().await {
        Ok(pair) => pair,
        Err(e) => {
            debug!(error = %e, "QUIC connection closed before control stream");
            return;
        }
    };

    let first = tokio::time::timeout(
        Duration::from_secs(HANDSHAKE_TIMEOUT),
        protocol::read_frame(&mut recv),
    )
    .await;

    match first {
        Ok(Ok(ControlFrame::Hello { token })) if token == state.config.token => {
            let heartbeat = state.heartbeat() as u16;
            let handle = start_control(&state, recv, send);
            let generation = handle.generation.clone();
            let tx = handle.tx.clone();
            state.install_control(handle);
            {
                let mut slot = state.quic.lock().unwrap();
                if let Some(old) = slot.replace(conn.clone()) {
                    old.close(0u32.into(), b"superseded");
                }
            }
            if tx.send(ControlFrame::HelloOk { heartbeat }).await.is_err() {
                debug!("failed to complete QUIC control handshake");
                return;
            }
            info!("QUIC control channel ready");

            // The connection dies with its control generation
            tokio::spawn(async move {
                generation.cancelled().await;
                conn.close(0u32.into(), b"control reset");
            });
        }
        Ok(Ok(_)) | Ok(Err(_)) => warn!("rejected QUIC control channel: bad handshake"),
        Err(_) => debug!("QUIC control handshake timeout"),
    }
}

/// UDP ingress: datagram flows keyed by source address, each riding one
/// pooled TCP data stream.
async fn udp_port_loop(state: Arc<FrontState>, socket: Arc<UdpSocket>, mapping: PortMapping) {
    let mut flows: HashMap<SocketAddr, mpsc::Sender<Vec<u8>>> = HashMap::new();
    let mut buf = vec![0u8; transport::MAX_DATAGRAM_SIZE];
    let mut sweep = tokio::time::interval(Duration::from_secs(5));
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = state.root.cancelled() => break,
            _ = sweep.tick() => {
                flows.retain(|_, tx| !tx.is_closed());
            }
            received = socket.recv_from(&mut buf) => {
                let (n, src) = match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        debug!(port = mapping.listen_port, error = %e, "UDP receive failed");
                        continue;
                    }
                };
                let datagram = buf[..n].to_vec();

                let tx = match flows.get(&src) {
                    Some(tx) if !tx.is_closed() => tx.clone(),
                    _ => {
                        flows.remove(&src);
                        let Some(tx) = open_udp_flow(&state, &socket, src, mapping).await else {
                            continue;
                        };
                        flows.insert(src, tx.clone());
                        tx
                    }
                };
                if tx.send(datagram).await.is_err() {
                    flows.remove(&src);
                }
            }
        }
    }
}

/// Dispatch a new session for a previously unseen datagram source.
async fn open_udp_flow(
    state: &Arc<FrontState>,
    socket: &Arc<UdpSocket>,
    src: SocketAddr,
    mapping: PortMapping,
) -> Option<mpsc::Sender<Vec<u8>>> {
    let ctrl = state.current_control()?;
    let sid = state.sids.next();

    let resource = {
        let _guard = state.dispatch_lock.lock().await;
        let Some((_seq, resource)) = state.pool.acquire(state.dial_timeout()).await else {
            state.note_starved(sid, mapping.listen_port);
            return None;
        };
        let dispatch = ControlFrame::Dispatch { sid, dest_port: mapping.remote_port };
        if ctrl.tx.send(dispatch).await.is_err() {
            return None;
        }
        resource
    };

    debug!(sid, port = mapping.listen_port, %src, "udp flow dispatched");

    let (tx, rx) = mpsc::channel(64);
    let ctx = SessionCtx::new(
        sid,
        mapping.listen_port,
        state.usage.clone(),
        ctrl.generation.child_token(),
    );
    let idle = Duration::from_secs(state.config.udp_idle_timeout.max(1));
    let socket = Arc::clone(socket);
    state.sessions.spawn(udp_flow_relay(ctx, resource, rx, socket, src, idle));
    Some(tx)
}

/// Pump datagrams in both directions until the flow idles out.
///
/// Each direction runs as its own task; racing the framed read against
/// other events would lose partially read frames on cancellation.
async fn udp_flow_relay(
    ctx: Arc<SessionCtx>,
    resource: BoxedStream,
    mut rx: mpsc::Receiver<Vec<u8>>,
    socket: Arc<UdpSocket>,
    src: SocketAddr,
    idle: Duration,
) {
    let (mut rd, mut wr) = tokio::io::split(resource);
    let flow = ctx.cancel.child_token();
    let activity = Arc::new(Mutex::new(Instant::now()));

    let mut outbound = {
        let flow = flow.clone();
        let activity = Arc::clone(&activity);
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            loop {
                let datagram = tokio::select! {
                    _ = flow.cancelled() => break,
                    maybe = rx.recv() => match maybe {
                        Some(datagram) => datagram,
                        None => break,
                    },
                };
                let len = datagram.len() as u64;
                if transport::write_datagram(&mut wr, &datagram).await.is_err() {
                    break;
                }
                ctx.record_up(len);
                *activity.lock().unwrap() = Instant::now();
            }
            let _ = wr.shutdown().await;
        })
    };

    let mut inbound = {
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
                if socket.send_to(&payload, src).await.is_err() {
                    break;
                }
                ctx.record_down(len);
                *activity.lock().unwrap() = Instant::now();
            }
        })
    };

    let mut outbound_done = false;
    let mut inbound_done = false;
    loop {
        tokio::select! {
            _ = flow.cancelled() => break,
            _ = &mut outbound, if !outbound_done => {
                outbound_done = true;
                if inbound_done {
                    break;
                }
            }
            _ = &mut inbound, if !inbound_done => {
                inbound_done = true;
                if outbound_done {
                    break;
                }
            }
            _ = tokio::time::sleep(idle) => {
                if activity.lock().unwrap().elapsed() >= idle {
                    debug!(sid = ctx.sid, %src, "udp flow idle, evicting");
                    break;
                }
            }
        }
    }

    flow.cancel();
    if !outbound_done {
        let _ = outbound.await;
    }
    if !inbound_done {
        let _ = inbound.await;
    }
}

impl crate::usage::ConfigProvider for TunnelServer {
    /// Live snapshot with tuner-mutated fields folded in
    fn server_config(&self) -> Option<ServerConfig> {
        let mut cfg = self.state.config.clone();
        let p = self.state.params.read().unwrap();
        cfg.keepalive_period = p.server_keepalive;
        cfg.heartbeat = p.heartbeat;
        cfg.channel_size = p.channel_size;
        cfg.mux_con = p.mux_con;
        cfg.mux_framesize = p.mux_framesize;
        cfg.mux_receivebuffer = p.mux_receivebuffer;
        cfg.mux_streambuffer = p.mux_streambuffer;
        cfg.nodelay = p.nodelay;
        Some(cfg)
    }

    fn client_config(&self) -> Option<crate::config::ClientConfig> {
        None
    }
}
