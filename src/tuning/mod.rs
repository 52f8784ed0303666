//! Auto-tuner
//!
//! A periodic worker samples CPU, memory, probe loss, throughput, and RTT,
//! then mutates the live parameter record within fixed min/max/step
//! envelopes. Sessions snapshot parameters at creation; established
//! connections keep their original socket options until replaced.
//!
//! The tick interval itself adapts to RTT variance between five and
//! fifteen minutes.

pub mod metrics;

pub use metrics::Sample;

use crate::config::{ClientConfig, Config, ServerConfig};
use crate::mux::MuxParams;
use crate::transport::SocketOptions;
use crate::usage::UsageStore;
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Which role's parameters this process drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Server,
    Client,
}

/// Allowed range and minimum change for one tunable
#[derive(Debug, Clone, Copy)]
pub struct Envelope {
    pub min: u64,
    pub max: u64,
    pub step: u64,
}

impl Envelope {
    pub fn clamp(&self, value: u64) -> u64 {
        value.clamp(self.min, self.max)
    }

    /// New value if it differs from `current` by at least `step`
    fn accept(&self, current: u64, target: u64) -> Option<u64> {
        let target = self.clamp(target);
        if target.abs_diff(current) >= self.step.max(1) {
            Some(target)
        } else {
            None
        }
    }
}

pub const CONNECTION_POOL: Envelope = Envelope { min: 1, max: 64, step: 1 };
/// Channel size moves by doubling/halving rather than a fixed step
pub const CHANNEL_SIZE: Envelope = Envelope { min: 256, max: 8192, step: 256 };
pub const KEEPALIVE: Envelope = Envelope { min: 10, max: 180, step: 5 };
pub const MAX_FRAME_SIZE: Envelope =
    Envelope { min: 16 * 1024, max: 128 * 1024, step: 8 * 1024 };
pub const MAX_RECEIVE_BUFFER: Envelope =
    Envelope { min: 1024 * 1024, max: 16 * 1024 * 1024, step: 1024 * 1024 };
pub const MAX_STREAM_BUFFER: Envelope =
    Envelope { min: 64 * 1024, max: 1024 * 1024, step: 64 * 1024 };
pub const HEARTBEAT: Envelope = Envelope { min: 10, max: 120, step: 15 };
pub const MUX_CON: Envelope = Envelope { min: 2, max: 32, step: 2 };

/// Tick interval floor
pub const MIN_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Tick interval ceiling
pub const MAX_INTERVAL: Duration = Duration::from_secs(15 * 60);
/// RTT samples kept for variance estimation
const RTT_WINDOW: usize = 10;

/// The live parameter record.
///
/// Mutated only by the tuner under the write lock; every session reads a
/// snapshot at start, so none observes a partial update.
#[derive(Debug, Clone)]
pub struct LiveParams {
    pub connection_pool: usize,
    pub channel_size: usize,
    pub server_keepalive: u64,
    pub client_keepalive: u64,
    pub heartbeat: u64,
    pub mux_con: usize,
    pub mux_framesize: usize,
    pub mux_receivebuffer: usize,
    pub mux_streambuffer: usize,
    pub nodelay: bool,
    pub so_rcvbuf: usize,
    pub so_sndbuf: usize,
}

/// Shared handle to the live parameter record
pub type SharedParams = Arc<RwLock<LiveParams>>;

impl LiveParams {
    pub fn from_config(config: &Config) -> Self {
        match (&config.server, &config.client) {
            (Some(server), _) => Self::from_server(server),
            (None, Some(client)) => Self::from_client(client),
            (None, None) => Self::from_server(&ServerConfig::default()),
        }
    }

    pub fn from_server(cfg: &ServerConfig) -> Self {
        Self {
            connection_pool: crate::config::defaults::CONNECTION_POOL,
            channel_size: cfg.channel_size,
            server_keepalive: cfg.keepalive_period,
            client_keepalive: cfg.keepalive_period,
            heartbeat: cfg.heartbeat,
            mux_con: cfg.mux_con,
            mux_framesize: cfg.mux_framesize,
            mux_receivebuffer: cfg.mux_receivebuffer,
            mux_streambuffer: cfg.mux_streambuffer,
            nodelay: cfg.nodelay,
            so_rcvbuf: cfg.so_rcvbuf,
            so_sndbuf: cfg.so_sndbuf,
        }
    }

    pub fn from_client(cfg: &ClientConfig) -> Self {
        Self {
            connection_pool: cfg.connection_pool,
            channel_size: crate::config::defaults::CHANNEL_SIZE,
            server_keepalive: cfg.keepalive_period,
            client_keepalive: cfg.keepalive_period,
            heartbeat: crate::config::defaults::HEARTBEAT,
            mux_con: crate::config::defaults::MUX_CON,
            mux_framesize: cfg.mux_framesize,
            mux_receivebuffer: cfg.mux_receivebuffer,
            mux_streambuffer: cfg.mux_streambuffer,
            nodelay: cfg.nodelay,
            so_rcvbuf: cfg.so_rcvbuf,
            so_sndbuf: cfg.so_sndbuf,
        }
    }

    /// Socket options snapshot for new connections
    pub fn socket_options(&self, role: PeerRole) -> SocketOptions {
        let keepalive = match role {
            PeerRole::Server => self.server_keepalive,
            PeerRole::Client => self.client_keepalive,
        };
        SocketOptions {
            nodelay: self.nodelay,
            keepalive: Duration::from_secs(keepalive),
            recv_buffer: self.so_rcvbuf,
            send_buffer: self.so_sndbuf,
        }
    }

    /// Mux parameter snapshot for new carriers
    pub fn mux_params(&self) -> MuxParams {
        MuxParams {
            max_frame_size: self.mux_framesize,
            max_receive_buffer: self.mux_receivebuffer,
            max_stream_buffer: self.mux_streambuffer,
            mux_con: self.mux_con,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trend {
    AdjustUp,
    AdjustDown,
    Hold,
}

/// The periodic tuning worker
pub struct Tuner {
    params: SharedParams,
    role: PeerRole,
    usage: Arc<UsageStore>,
    /// RTT probe target; falls back to a public resolver
    remote_addr: Option<String>,
    interval: Duration,
    rtt_window: VecDeque<f64>,
    last_total_bytes: u64,
    last_tick: Instant,
    keepalive_drift_ticks: u32,
    /// Published keepalive values; the peer machinery forwards each change
    /// over the control channel as a KEEPALIVE frame
    keepalive_tx: watch::Sender<u64>,
}

impl Tuner {
    pub fn new(
        params: SharedParams,
        role: PeerRole,
        usage: Arc<UsageStore>,
        remote_addr: Option<String>,
        initial_interval: Duration,
    ) -> Self {
        let last_total_bytes = usage.total_bytes();
        let initial_keepalive = {
            let p = params.read().unwrap();
            match role {
                PeerRole::Server => p.server_keepalive,
                PeerRole::Client => p.client_keepalive,
            }
        };
        let (keepalive_tx, _) = watch::channel(initial_keepalive);
        Self {
            params,
            role,
            usage,
            remote_addr,
            interval: initial_interval.clamp(MIN_INTERVAL, MAX_INTERVAL),
            rtt_window: VecDeque::with_capacity(RTT_WINDOW),
            last_total_bytes,
            last_tick: Instant::now(),
            keepalive_drift_ticks: 0,
            keepalive_tx,
        }
    }

    /// Current adaptive tick interval
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Subscribe to tuned keepalive values. The control-channel machinery
    /// forwards each update to the peer, which is the only path by which
    /// the two processes' parameter records converge.
    pub fn keepalive_updates(&self) -> watch::Receiver<u64> {
        self.keepalive_tx.subscribe()
    }

    /// Run until cancelled
    pub fn spawn(mut self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_s = self.interval.as_secs(), "auto-tuner started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.interval) => self.tick().await,
                }
            }
            info!("auto-tuner stopped");
        })
    }

    async fn tick(&mut self) {
        debug!("running parameter adjustment pass");

        let (cpu, mem) = tokio::task::spawn_blocking(metrics::cpu_mem_usage)
            .await
            .unwrap_or((None, None));
        let (rtt_ms, loss) =
            metrics::probe_rtt_with_fallback(self.remote_addr.as_deref()).await;

        let elapsed = self.last_tick.elapsed().as_secs_f64().max(1.0);
        let total = self.usage.total_bytes();
        let throughput = Some(total.saturating_sub(self.last_total_bytes) as f64 / elapsed);
        self.last_total_bytes = total;
        self.last_tick = Instant::now();

        self.apply_sample(Sample { cpu, mem, loss, rtt_ms, throughput });
    }

    /// Apply one tick's measurements to the live parameter record.
    ///
    /// Public so tests can drive the tuner with injected metrics.
    pub fn apply_sample(&mut self, sample: Sample) {
        if let Some(rtt) = sample.rtt_ms {
            if self.rtt_window.len() == RTT_WINDOW {
                self.rtt_window.pop_front();
            }
            self.rtt_window.push_back(rtt);
        }

        let trend = decide(&sample);
        debug!(?sample, ?trend, "tuner sample");

        match trend {
            Trend::AdjustDown => self.adjust_down(),
            Trend::AdjustUp => self.adjust_up(),
            Trend::Hold => {}
        }

        self.sync_keepalive();
        self.adapt_interval();
    }

    /// Load is high: shrink buffers and concurrency, probe more often.
    fn adjust_down(&mut self) {
        let mut p = self.params.write().unwrap();

        let keepalive = self.role_keepalive(&p);
        if let Some(v) = KEEPALIVE.accept(keepalive, KEEPALIVE.min) {
            self.set_role_keepalive(&mut p, v);
            info!(keepalive = v, "decreased keepalive period");
        }
        if let Some(v) = HEARTBEAT.accept(p.heartbeat, HEARTBEAT.max) {
            p.heartbeat = v;
            info!(heartbeat = v, "relaxed heartbeat interval");
        }
        if let Some(v) = MAX_FRAME_SIZE.accept(p.mux_framesize as u64, MAX_FRAME_SIZE.min) {
            p.mux_framesize = v as usize;
            info!(mux_framesize = v, "decreased mux frame size");
        }
        if let Some(v) =
            MAX_RECEIVE_BUFFER.accept(p.mux_receivebuffer as u64, MAX_RECEIVE_BUFFER.min)
        {
            p.mux_receivebuffer = v as usize;
            info!(mux_receivebuffer = v, "decreased mux receive buffer");
        }
        if let Some(v) =
            MAX_STREAM_BUFFER.accept(p.mux_streambuffer as u64, MAX_STREAM_BUFFER.min)
        {
            p.mux_streambuffer = v as usize;
            info!(mux_streambuffer = v, "decreased mux stream buffer");
        }
        if let Some(v) = MUX_CON.accept(p.mux_con as u64, MUX_CON.min) {
            p.mux_con = v as usize;
            info!(mux_con = v, "decreased mux concurrency");
        }
        if let Some(v) = CONNECTION_POOL
            .accept(p.connection_pool as u64, (p.connection_pool as u64).saturating_sub(1))
        {
            p.connection_pool = v as usize;
            info!(pool_size = v, "decreased connection pool");
        }
        if let Some(v) = CHANNEL_SIZE.accept(p.channel_size as u64, p.channel_size as u64 / 2) {
            p.channel_size = v as usize;
            info!(channel_size = v, "decreased channel size");
        }
    }

    /// Load is low and traffic flows: grow throughput-oriented parameters
    /// one step at a time.
    fn adjust_up(&mut self) {
        let mut p = self.params.write().unwrap();

        if let Some(v) = CONNECTION_POOL
            .accept(p.connection_pool as u64, p.connection_pool as u64 + CONNECTION_POOL.step)
        {
            p.connection_pool = v as usize;
            info!(pool_size = v, "increased connection pool");
        }
        if let Some(v) = CHANNEL_SIZE.accept(p.channel_size as u64, p.channel_size as u64 * 2) {
            p.channel_size = v as usize;
            info!(channel_size = v, "increased channel size");
        }
        let keepalive = self.role_keepalive(&p);
        if let Some(v) = KEEPALIVE.accept(keepalive, keepalive + KEEPALIVE.step) {
            self.set_role_keepalive(&mut p, v);
            info!(keepalive = v, "increased keepalive period");
        }
        if let Some(v) =
            HEARTBEAT.accept(p.heartbeat, p.heartbeat.saturating_sub(HEARTBEAT.step))
        {
            p.heartbeat = v;
            info!(heartbeat = v, "tightened heartbeat interval");
        }
        if let Some(v) = MAX_FRAME_SIZE
            .accept(p.mux_framesize as u64, p.mux_framesize as u64 + MAX_FRAME_SIZE.step)
        {
            p.mux_framesize = v as usize;
            info!(mux_framesize = v, "increased mux frame size");
        }
        if let Some(v) = MAX_RECEIVE_BUFFER.accept(
            p.mux_receivebuffer as u64,
            p.mux_receivebuffer as u64 + MAX_RECEIVE_BUFFER.step,
        ) {
            p.mux_receivebuffer = v as usize;
            info!(mux_receivebuffer = v, "increased mux receive buffer");
        }
        if let Some(v) = MAX_STREAM_BUFFER.accept(
            p.mux_streambuffer as u64,
            p.mux_streambuffer as u64 + MAX_STREAM_BUFFER.step,
        ) {
            p.mux_streambuffer = v as usize;
            info!(mux_streambuffer = v, "increased mux stream buffer");
        }
        if let Some(v) = MUX_CON.accept(p.mux_con as u64, p.mux_con as u64 + MUX_CON.step) {
            p.mux_con = v as usize;
            info!(mux_con = v, "increased mux concurrency");
        }
    }

    fn role_keepalive(&self, p: &LiveParams) -> u64 {
        match self.role {
            PeerRole::Server => p.server_keepalive,
            PeerRole::Client => p.client_keepalive,
        }
    }

    fn set_role_keepalive(&self, p: &mut LiveParams, value: u64) {
        match self.role {
            PeerRole::Server => p.server_keepalive = value,
            PeerRole::Client => p.client_keepalive = value,
        }
    }

    /// Server and client keepalive must stay synchronized. The peers run as
    /// separate processes, so a changed value is published here and travels
    /// to the other side as a KEEPALIVE control frame; the passive mirror
    /// field is only ever written by that wire path. A peer that has not
    /// caught up for two consecutive ticks draws a warning.
    fn sync_keepalive(&mut self) {
        let (server, client) = {
            let p = self.params.read().unwrap();
            (p.server_keepalive, p.client_keepalive)
        };
        let (active, passive) = match self.role {
            PeerRole::Server => (server, client),
            PeerRole::Client => (client, server),
        };

        if active.abs_diff(passive) >= KEEPALIVE.step {
            self.keepalive_drift_ticks += 1;
            if self.keepalive_drift_ticks >= 2 {
                warn!(
                    server,
                    client, "keepalive values diverged for consecutive ticks"
                );
            }
        } else {
            self.keepalive_drift_ticks = 0;
        }

        if *self.keepalive_tx.borrow() != active {
            self.keepalive_tx.send_replace(active);
            info!(keepalive = active, "published keepalive update for peer resync");
        }
    }

    /// Halve the interval when RTT is unstable, grow it when quiet.
    fn adapt_interval(&mut self) {
        if self.rtt_window.is_empty() {
            return;
        }
        let n = self.rtt_window.len() as f64;
        let mean = self.rtt_window.iter().sum::<f64>() / n;
        let variance =
            self.rtt_window.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>() / n;

        if variance > 0.3 * mean {
            self.interval = (self.interval / 2).max(MIN_INTERVAL);
            debug!(interval_s = self.interval.as_secs(), "RTT unstable, tightened tuner interval");
        } else if variance < 0.1 * mean {
            self.interval = (self.interval * 3 / 2).min(MAX_INTERVAL);
            debug!(interval_s = self.interval.as_secs(), "RTT stable, relaxed tuner interval");
        }
    }
}

/// Adopt a keepalive period advertised by the peer into the live parameter
/// record. Returns whether anything changed, so the caller can confirm the
/// adoption back exactly once instead of echoing forever.
pub fn adopt_keepalive(params: &SharedParams, period: u64) -> bool {
    let mut p = params.write().unwrap();
    let changed = p.server_keepalive != period || p.client_keepalive != period;
    p.server_keepalive = period;
    p.client_keepalive = period;
    changed
}

fn decide(sample: &Sample) -> Trend {
    let over = |metric: Option<f64>, limit: f64| metric.is_some_and(|v| v > limit);
    let under = |metric: Option<f64>, limit: f64| metric.is_some_and(|v| v < limit);

    if over(sample.rtt_ms, 200.0)
        || over(sample.cpu, 80.0)
        || over(sample.mem, 80.0)
        || over(sample.loss, 2.0)
    {
        return Trend::AdjustDown;
    }

    if under(sample.rtt_ms, 70.0)
        && under(sample.cpu, 60.0)
        && under(sample.mem, 60.0)
        && under(sample.loss, 1.0)
        && sample.throughput.is_some_and(|t| t > 0.0)
    {
        return Trend::AdjustUp;
    }

    Trend::Hold
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_params() -> SharedParams {
        Arc::new(RwLock::new(LiveParams::from_config(&Config::default())))
    }

    fn tuner(params: SharedParams, role: PeerRole) -> Tuner {
        Tuner::new(params, role, UsageStore::ephemeral(), None, Duration::from_secs(600))
    }

    fn down_sample() -> Sample {
        Sample {
            cpu: Some(90.0),
            mem: Some(50.0),
            loss: Some(0.0),
            rtt_ms: Some(300.0),
            throughput: Some(1000.0),
        }
    }

    fn up_sample() -> Sample {
        Sample {
            cpu: Some(20.0),
            mem: Some(30.0),
            loss: Some(0.0),
            rtt_ms: Some(40.0),
            throughput: Some(1000.0),
        }
    }

    fn hold_sample() -> Sample {
        Sample {
            cpu: Some(70.0),
            mem: Some(70.0),
            loss: Some(1.5),
            rtt_ms: Some(120.0),
            throughput: Some(0.0),
        }
    }

    #[test]
    fn test_down_adjust_reaches_conservative_bounds() {
        let params = default_params();
        let mut t = tuner(Arc::clone(&params), PeerRole::Server);

        t.apply_sample(down_sample());

        let p = params.read().unwrap();
        assert_eq!(p.server_keepalive, 10);
        assert_eq!(p.heartbeat, 120);
        assert_eq!(p.mux_framesize, 16 * 1024);
        assert_eq!(p.mux_con, 2);
        // The new value is published for the control channel to advertise
        assert_eq!(*t.keepalive_updates().borrow(), 10);
    }

    #[test]
    fn test_hold_sample_changes_nothing() {
        let params = default_params();
        let before = params.read().unwrap().clone();
        let mut t = tuner(Arc::clone(&params), PeerRole::Server);

        t.apply_sample(hold_sample());
        t.apply_sample(hold_sample());

        let after = params.read().unwrap();
        assert_eq!(after.server_keepalive, before.server_keepalive);
        assert_eq!(after.heartbeat, before.heartbeat);
        assert_eq!(after.mux_framesize, before.mux_framesize);
        assert_eq!(after.mux_con, before.mux_con);
        assert_eq!(after.channel_size, before.channel_size);
        assert_eq!(after.connection_pool, before.connection_pool);
    }

    #[test]
    fn test_envelopes_never_exceeded() {
        let params = default_params();
        let mut t = tuner(Arc::clone(&params), PeerRole::Client);

        for _ in 0..50 {
            t.apply_sample(up_sample());
        }
        {
            let p = params.read().unwrap();
            assert!(p.connection_pool as u64 <= CONNECTION_POOL.max);
            assert!(p.channel_size as u64 <= CHANNEL_SIZE.max);
            assert!(p.client_keepalive <= KEEPALIVE.max);
            assert!(p.heartbeat >= HEARTBEAT.min);
            assert!(p.mux_framesize as u64 <= MAX_FRAME_SIZE.max);
            assert!(p.mux_receivebuffer as u64 <= MAX_RECEIVE_BUFFER.max);
            assert!(p.mux_streambuffer as u64 <= MAX_STREAM_BUFFER.max);
            assert!(p.mux_con as u64 <= MUX_CON.max);
        }

        for _ in 0..50 {
            t.apply_sample(down_sample());
        }
        let p = params.read().unwrap();
        assert!(p.connection_pool as u64 >= CONNECTION_POOL.min);
        assert!(p.channel_size as u64 >= CHANNEL_SIZE.min);
        assert!(p.client_keepalive >= KEEPALIVE.min);
        assert!(p.heartbeat <= HEARTBEAT.max);
        assert!(p.mux_framesize as u64 >= MAX_FRAME_SIZE.min);
        assert!(p.mux_con as u64 >= MUX_CON.min);
    }

    #[test]
    fn test_keepalive_change_is_published_once() {
        let params = default_params();
        let mut t = tuner(Arc::clone(&params), PeerRole::Server);
        let mut rx = t.keepalive_updates();
        assert_eq!(*rx.borrow_and_update(), 75);

        t.apply_sample(down_sample());
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 10);

        // Unchanged metrics publish nothing further
        t.apply_sample(down_sample());
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_adopt_keepalive_changes_once() {
        let params = default_params();

        assert!(adopt_keepalive(&params, 10));
        {
            let p = params.read().unwrap();
            assert_eq!(p.server_keepalive, 10);
            assert_eq!(p.client_keepalive, 10);
        }

        // Re-adopting the same value reports no change, which is what
        // terminates the confirmation exchange
        assert!(!adopt_keepalive(&params, 10));
    }

    #[test]
    fn test_interval_adapts_to_rtt_variance() {
        let params = default_params();
        let mut t = tuner(params, PeerRole::Server);
        assert_eq!(t.interval(), Duration::from_secs(600));

        // Wildly varying RTT halves the interval down to the floor
        for rtt in [20.0, 400.0, 15.0, 380.0, 25.0, 390.0] {
            t.apply_sample(Sample { rtt_ms: Some(rtt), ..hold_sample() });
        }
        assert_eq!(t.interval(), MIN_INTERVAL);

        // Flat RTT grows it back toward the ceiling
        let mut t = tuner(default_params(), PeerRole::Server);
        for _ in 0..10 {
            t.apply_sample(Sample { rtt_ms: Some(100.0), ..hold_sample() });
        }
        assert_eq!(t.interval(), MAX_INTERVAL);
    }

    #[test]
    fn test_initial_interval_clamped() {
        let t = Tuner::new(
            default_params(),
            PeerRole::Server,
            UsageStore::ephemeral(),
            None,
            Duration::from_secs(30),
        );
        assert_eq!(t.interval(), MIN_INTERVAL);
    }
}
