//! End-to-end tunnel scenarios
//!
//! Runs a real front-peer and behind-peer on loopback and drives sessions
//! through them: single sessions with byte accounting, port remapping,
//! mux concurrency limits, heartbeat loss, pool starvation, UDP ingress,
//! and tuner adjustment.

use overpass::client::TunnelClient;
use overpass::config::{ClientConfig, Config, ServerConfig, TransportType};
use overpass::protocol::{self, ControlFrame};
use overpass::server::TunnelServer;
use overpass::tuning::{LiveParams, PeerRole, Sample, Tuner};
use overpass::usage::UsageStore;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

const TOKEN: &str = "integration-secret";

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

/// TCP echo service standing in for the behind-peer's local service
async fn spawn_echo(port: u16) {
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else { break };
            tokio::spawn(async move {
                let (mut rd, mut wr) = stream.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
                let _ = wr.shutdown().await;
            });
        }
    });
}

struct TestTunnel {
    listen_port: u16,
    echo_port: u16,
    control_addr: String,
    server_usage: Arc<UsageStore>,
    server_cancel: CancellationToken,
    client_cancel: CancellationToken,
}

impl TestTunnel {
    fn server_config(&self, transport: TransportType) -> ServerConfig {
        ServerConfig {
            bind_addr: self.control_addr.clone(),
            transport,
            token: TOKEN.to_string(),
            ports: vec![format!("{}={}", self.listen_port, self.echo_port)],
            heartbeat: 2,
            dial_timeout: 3,
            sniffer: false,
            ..Default::default()
        }
    }

    fn client_config(&self, transport: TransportType) -> ClientConfig {
        ClientConfig {
            remote_addr: self.control_addr.clone(),
            transport,
            token: TOKEN.to_string(),
            retry_interval: 1,
            dial_timeout: 3,
            connection_pool: 2,
            sniffer: false,
            ..Default::default()
        }
    }

    fn start_server(&self, config: ServerConfig) {
        let params = Arc::new(RwLock::new(LiveParams::from_server(&config)));
        let server = TunnelServer::new(
            config,
            params,
            Arc::clone(&self.server_usage),
            self.server_cancel.clone(),
            None,
        )
        .unwrap();
        tokio::spawn(async move {
            let _ = server.run().await;
        });
    }

    fn start_client(&self, config: ClientConfig) {
        let params = Arc::new(RwLock::new(LiveParams::from_client(&config)));
        let client = TunnelClient::new(
            config,
            params,
            UsageStore::ephemeral(),
            self.client_cancel.clone(),
            None,
        )
        .unwrap();
        tokio::spawn(async move {
            let _ = client.run().await;
        });
    }
}

async fn new_tunnel() -> TestTunnel {
    let tunnel = TestTunnel {
        listen_port: free_port(),
        echo_port: free_port(),
        control_addr: format!("127.0.0.1:{}", free_port()),
        server_usage: UsageStore::ephemeral(),
        server_cancel: CancellationToken::new(),
        client_cancel: CancellationToken::new(),
    };
    spawn_echo(tunnel.echo_port).await;
    tunnel
}

/// Start both peers for `transport` with config tweaks applied
async fn start_pair(
    transport: TransportType,
    server_tweak: impl FnOnce(&mut ServerConfig),
    client_tweak: impl FnOnce(&mut ClientConfig),
) -> TestTunnel {
    let tunnel = new_tunnel().await;
    let mut server_config = tunnel.server_config(transport);
    server_tweak(&mut server_config);
    let mut client_config = tunnel.client_config(transport);
    client_tweak(&mut client_config);
    tunnel.start_server(server_config);
    tunnel.start_client(client_config);
    wait_until_ready(tunnel.listen_port).await;
    tunnel
}

/// One echo round trip through the tunnel
async fn try_echo(port: u16, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
    stream.write_all(payload).await?;
    let mut buf = vec![0u8; payload.len()];
    timeout(Duration::from_secs(2), stream.read_exact(&mut buf)).await??;
    Ok(buf)
}

async fn wait_until_ready(port: u16) {
    for _ in 0..60 {
        if let Ok(reply) = try_echo(port, b"up?").await {
            if reply == b"up?" {
                return;
            }
        }
        sleep(Duration::from_millis(200)).await;
    }
    panic!("tunnel never became ready on port {}", port);
}

async fn connect_retry(addr: &str) -> TcpStream {
    for _ in 0..60 {
        if let Ok(stream) = TcpStream::connect(addr).await {
            return stream;
        }
        sleep(Duration::from_millis(100)).await;
    }
    panic!("could not connect to {}", addr);
}

/// Single TCP session: bytes arrive intact and are accounted to the
/// listener port in both directions.
#[tokio::test]
async fn test_single_tcp_session() {
    let tunnel = start_pair(TransportType::Tcp, |_| {}, |_| {}).await;

    let baseline = tunnel
        .server_usage
        .port_usage(tunnel.listen_port)
        .map(|u| (u.bytes_up, u.bytes_down))
        .unwrap_or((0, 0));

    let reply = try_echo(tunnel.listen_port, b"ping").await.unwrap();
    assert_eq!(reply, b"ping");

    // Counters are updated by the copy tasks; give them a beat
    for _ in 0..50 {
        let usage = tunnel.server_usage.port_usage(tunnel.listen_port).unwrap();
        if usage.bytes_up >= baseline.0 + 4 && usage.bytes_down >= baseline.1 + 4 {
            return;
        }
        sleep(Duration::from_millis(100)).await;
    }
    panic!("bytes were not accounted to port {}", tunnel.listen_port);
}

/// Port remap: the DISPATCH frame carries the remapped destination port.
#[tokio::test]
async fn test_port_remap_dispatch_frame() {
    let tunnel = new_tunnel().await;
    let mut config = tunnel.server_config(TransportType::Tcp);
    config.ports = vec![format!("{}=8080", tunnel.listen_port)];
    tunnel.start_server(config);

    // Hand-rolled behind-peer so the control channel can be inspected
    let mut control = connect_retry(&tunnel.control_addr).await;
    protocol::write_frame(&mut control, &ControlFrame::Hello { token: TOKEN.to_string() })
        .await
        .unwrap();
    let reply = protocol::read_frame(&mut control).await.unwrap();
    assert!(matches!(reply, ControlFrame::HelloOk { .. }));

    // Supply one warm data connection
    let mut data = TcpStream::connect(&tunnel.control_addr).await.unwrap();
    protocol::write_frame(&mut data, &ControlFrame::Ready { sid: 1 }).await.unwrap();
    sleep(Duration::from_millis(200)).await;

    let _user = TcpStream::connect(("127.0.0.1", tunnel.listen_port)).await.unwrap();

    let dispatched = timeout(Duration::from_secs(5), async {
        loop {
            match protocol::read_frame(&mut control).await.unwrap() {
                ControlFrame::Dispatch { sid, dest_port } => return (sid, dest_port),
                ControlFrame::Ping => {
                    protocol::write_frame(&mut control, &ControlFrame::Pong).await.unwrap();
                }
                other => panic!("unexpected control frame {:?}", other),
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(dispatched.1, 8080);
}

/// Mux concurrency: `MuxCon = 2` serves two concurrent sessions, rejects
/// the third while both slots are held, and recovers once one closes.
#[tokio::test]
async fn test_mux_concurrency_cap() {
    let tunnel = start_pair(
        TransportType::TcpMux,
        |server| {
            server.mux_con = 2;
            server.dial_timeout = 1;
        },
        |client| client.mux_session = 1,
    )
    .await;

    let listen_port = tunnel.listen_port;
    let hold = move |tag: &'static [u8; 4]| async move {
        let mut stream = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();
        stream.write_all(tag).await.unwrap();
        let mut buf = [0u8; 4];
        timeout(Duration::from_secs(2), stream.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf, tag);
        stream
    };

    let first = hold(b"one.").await;
    let second = hold(b"two.").await;

    // Both sub-stream slots are occupied; the third session is dropped
    // after the server-side wait budget.
    let mut third = TcpStream::connect(("127.0.0.1", tunnel.listen_port)).await.unwrap();
    third.write_all(b"full").await.unwrap();
    let mut buf = [0u8; 4];
    let outcome = timeout(Duration::from_secs(4), third.read_exact(&mut buf)).await;
    match outcome {
        Ok(Ok(_)) => panic!("third session should not fit into MuxCon=2"),
        Ok(Err(_)) | Err(_) => {}
    }

    // Releasing one slot lets new sessions through again
    drop(first);
    for _ in 0..40 {
        if try_echo(tunnel.listen_port, b"more").await.is_ok() {
            drop(second);
            return;
        }
        sleep(Duration::from_millis(200)).await;
    }
    panic!("mux slot was not released");
}

/// Five sessions through a MuxCon=2 carrier all complete with distinct
/// payloads echoed back.
#[tokio::test]
async fn test_mux_five_sessions_complete() {
    let tunnel = start_pair(
        TransportType::TcpMux,
        |server| server.mux_con = 2,
        |client| client.mux_session = 1,
    )
    .await;

    let mut tasks = Vec::new();
    for i in 0u8..5 {
        let port = tunnel.listen_port;
        tasks.push(tokio::spawn(async move {
            let payload = [b'm', b'u', b'x', i];
            let reply = try_echo(port, &payload).await.unwrap();
            assert_eq!(reply, payload);
        }));
    }
    for task in tasks {
        timeout(Duration::from_secs(10), task).await.unwrap().unwrap();
    }
}

/// Heartbeat loss: a silent behind-peer is reset after 3×Heartbeat, and a
/// real client can connect afterwards.
#[tokio::test]
async fn test_heartbeat_loss_and_reconnect() {
    let tunnel = new_tunnel().await;
    let mut config = tunnel.server_config(TransportType::Tcp);
    config.heartbeat = 1;
    tunnel.start_server(config);

    // A behind-peer that authenticates, then goes silent
    let mut silent = connect_retry(&tunnel.control_addr).await;
    protocol::write_frame(&mut silent, &ControlFrame::Hello { token: TOKEN.to_string() })
        .await
        .unwrap();
    let reply = protocol::read_frame(&mut silent).await.unwrap();
    assert!(matches!(reply, ControlFrame::HelloOk { heartbeat: 1 }));

    // The front resets the channel within one heartbeat period past the
    // 3×Heartbeat deadline; the silent peer observes the close as an error
    // or EOF on its socket.
    let observed = timeout(Duration::from_secs(6), async {
        let mut buf = [0u8; 64];
        loop {
            match silent.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    })
    .await;
    assert!(observed.is_ok(), "front-peer never reset the silent channel");

    // A real behind-peer reconnects and serves sessions
    tunnel.start_client(tunnel.client_config(TransportType::Tcp));
    wait_until_ready(tunnel.listen_port).await;
    let reply = try_echo(tunnel.listen_port, b"back").await.unwrap();
    assert_eq!(reply, b"back");
}

/// Pool starvation: with one warm resource and no refill, the second
/// session is dropped after `dial_timeout` while the first keeps running.
#[tokio::test]
async fn test_pool_starvation_drops_second_session() {
    let tunnel = new_tunnel().await;
    let mut config = tunnel.server_config(TransportType::Tcp);
    config.dial_timeout = 1;
    tunnel.start_server(config);

    // Behind-peer with a pool of exactly one, never refilled
    let mut control = connect_retry(&tunnel.control_addr).await;
    protocol::write_frame(&mut control, &ControlFrame::Hello { token: TOKEN.to_string() })
        .await
        .unwrap();
    protocol::read_frame(&mut control).await.unwrap();

    let mut data = TcpStream::connect(&tunnel.control_addr).await.unwrap();
    protocol::write_frame(&mut data, &ControlFrame::Ready { sid: 1 }).await.unwrap();

    // Keep the control channel alive and echo on the single data
    // connection once it is consumed
    tokio::spawn(async move {
        loop {
            match protocol::read_frame(&mut control).await {
                Ok(ControlFrame::Ping) => {
                    let _ = protocol::write_frame(&mut control, &ControlFrame::Pong).await;
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });
    tokio::spawn(async move {
        let (mut rd, mut wr) = data.split();
        let _ = tokio::io::copy(&mut rd, &mut wr).await;
    });
    sleep(Duration::from_millis(300)).await;

    let mut first = TcpStream::connect(("127.0.0.1", tunnel.listen_port)).await.unwrap();
    first.write_all(b"one!").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(Duration::from_secs(2), first.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"one!");

    // Second session starves and is dropped
    let mut second = TcpStream::connect(("127.0.0.1", tunnel.listen_port)).await.unwrap();
    second.write_all(b"two!").await.unwrap();
    let outcome = timeout(Duration::from_secs(4), second.read_exact(&mut buf)).await;
    match outcome {
        Ok(Ok(_)) => panic!("second session should starve with an empty pool"),
        Ok(Err(_)) | Err(_) => {}
    }

    // First session is unaffected
    first.write_all(b"agn!").await.unwrap();
    timeout(Duration::from_secs(2), first.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"agn!");
}

/// Round trip: a larger byte stream survives each stream transport intact.
async fn roundtrip_large(transport: TransportType) {
    let tunnel = start_pair(transport, |_| {}, |_| {}).await;

    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let mut stream = TcpStream::connect(("127.0.0.1", tunnel.listen_port)).await.unwrap();
    let (mut rd, mut wr) = stream.split();

    let write = async {
        wr.write_all(&payload).await.unwrap();
        wr.shutdown().await.unwrap();
    };
    let read = async {
        let mut received = Vec::with_capacity(expected.len());
        rd.read_to_end(&mut received).await.unwrap();
        received
    };
    let (_, received) =
        timeout(Duration::from_secs(20), async { tokio::join!(write, read) }).await.unwrap();

    assert_eq!(received.len(), expected.len());
    assert_eq!(received, expected);
}

#[tokio::test]
async fn test_tcp_roundtrip_large() {
    roundtrip_large(TransportType::Tcp).await;
}

#[tokio::test]
async fn test_tcpmux_roundtrip_large() {
    roundtrip_large(TransportType::TcpMux).await;
}

#[tokio::test]
async fn test_ws_roundtrip_large() {
    roundtrip_large(TransportType::Ws).await;
}

/// Boundary: a pool of one still serves sessions, one at a time.
#[tokio::test]
async fn test_min_pool_serves_sequentially() {
    let tunnel = start_pair(TransportType::Tcp, |_| {}, |client| {
        client.connection_pool = 1;
        client.aggressive_pool = false;
    })
    .await;

    for i in 0u8..3 {
        let payload = [b's', b'e', b'q', i];
        let reply = try_echo(tunnel.listen_port, &payload).await.unwrap();
        assert_eq!(reply, payload);
    }
}

/// UDP ingress: datagrams are framed over the tunnel and echoed back to
/// the original source address.
#[tokio::test]
async fn test_udp_ingress_roundtrip() {
    let tunnel = new_tunnel().await;

    // UDP echo standing in for the local service
    let echo = UdpSocket::bind(("127.0.0.1", tunnel.echo_port)).await.unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        while let Ok((n, src)) = echo.recv_from(&mut buf).await {
            let _ = echo.send_to(&buf[..n], src).await;
        }
    });

    tunnel.start_server(tunnel.server_config(TransportType::Udp));
    tunnel.start_client(tunnel.client_config(TransportType::Udp));

    let user = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    user.connect(("127.0.0.1", tunnel.listen_port)).await.unwrap();

    let mut buf = [0u8; 16];
    for _ in 0..60 {
        let _ = user.send(b"udp-ping").await;
        match timeout(Duration::from_millis(500), user.recv(&mut buf)).await {
            Ok(Ok(n)) => {
                assert_eq!(&buf[..n], b"udp-ping");
                return;
            }
            _ => continue,
        }
    }
    panic!("no UDP echo came back through the tunnel");
}

/// An idle UDP flow is evicted after `udp_idle_timeout`; traffic from the
/// same source afterwards gets a fresh flow and still works.
#[tokio::test]
async fn test_udp_flow_idle_eviction() {
    let tunnel = new_tunnel().await;

    let echo = UdpSocket::bind(("127.0.0.1", tunnel.echo_port)).await.unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        while let Ok((n, src)) = echo.recv_from(&mut buf).await {
            let _ = echo.send_to(&buf[..n], src).await;
        }
    });

    let mut server_config = tunnel.server_config(TransportType::Udp);
    server_config.udp_idle_timeout = 1;
    tunnel.start_server(server_config);
    tunnel.start_client(tunnel.client_config(TransportType::Udp));

    async fn exchange(user: &UdpSocket, tag: &'static [u8]) {
        let mut buf = [0u8; 16];
        for _ in 0..60 {
            let _ = user.send(tag).await;
            if let Ok(Ok(n)) = timeout(Duration::from_millis(500), user.recv(&mut buf)).await {
                assert_eq!(&buf[..n], tag);
                return;
            }
        }
        panic!("no UDP echo for {:?}", tag);
    }

    let user = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    user.connect(("127.0.0.1", tunnel.listen_port)).await.unwrap();

    exchange(&user, b"first").await;

    // Let the flow idle out, then exercise the replacement flow
    sleep(Duration::from_millis(2500)).await;
    exchange(&user, b"second").await;
}

/// Tuner down-adjust: high RTT and CPU push the live parameters to their
/// conservative bounds in one tick, and the keepalive change is published
/// for the control channel to advertise.
#[tokio::test]
async fn test_tuner_down_adjust() {
    let params = Arc::new(RwLock::new(LiveParams::from_config(&Config::default())));
    let mut tuner = Tuner::new(
        Arc::clone(&params),
        PeerRole::Server,
        UsageStore::ephemeral(),
        None,
        Duration::from_secs(600),
    );

    tuner.apply_sample(Sample {
        cpu: Some(90.0),
        mem: Some(40.0),
        loss: Some(0.0),
        rtt_ms: Some(300.0),
        throughput: Some(10_000.0),
    });

    {
        let p = params.read().unwrap();
        assert_eq!(p.server_keepalive, 10);
        assert_eq!(p.mux_framesize, 16 * 1024);
        assert_eq!(p.mux_con, 2);
        assert_eq!(p.heartbeat, 120);
    }
    assert_eq!(*tuner.keepalive_updates().borrow(), 10);
}

/// Keepalive convergence across real peers: the server and client each own
/// an independently-constructed parameter record; a tuned value reaches the
/// other process only via KEEPALIVE control frames, and both records (and
/// both mirrors) end up equal.
#[tokio::test]
async fn test_keepalive_update_crosses_the_wire() {
    let tunnel = new_tunnel().await;
    let mut server_config = tunnel.server_config(TransportType::Tcp);
    server_config.heartbeat = 1;

    let server_params = Arc::new(RwLock::new(LiveParams::from_server(&server_config)));
    let mut tuner = Tuner::new(
        Arc::clone(&server_params),
        PeerRole::Server,
        UsageStore::ephemeral(),
        None,
        Duration::from_secs(600),
    );

    let server = TunnelServer::new(
        server_config,
        Arc::clone(&server_params),
        Arc::clone(&tunnel.server_usage),
        tunnel.server_cancel.clone(),
        Some(tuner.keepalive_updates()),
    )
    .unwrap();
    tokio::spawn(async move {
        let _ = server.run().await;
    });

    let client_config = tunnel.client_config(TransportType::Tcp);
    let client_params = Arc::new(RwLock::new(LiveParams::from_client(&client_config)));
    let client = TunnelClient::new(
        client_config,
        Arc::clone(&client_params),
        UsageStore::ephemeral(),
        tunnel.client_cancel.clone(),
        None,
    )
    .unwrap();
    tokio::spawn(async move {
        let _ = client.run().await;
    });

    wait_until_ready(tunnel.listen_port).await;

    // High load on the server side drops its keepalive to the floor
    tuner.apply_sample(Sample {
        cpu: Some(90.0),
        mem: Some(40.0),
        loss: Some(0.0),
        rtt_ms: Some(300.0),
        throughput: Some(10_000.0),
    });
    assert_eq!(server_params.read().unwrap().server_keepalive, 10);

    for _ in 0..50 {
        let client_done = {
            let p = client_params.read().unwrap();
            p.client_keepalive == 10 && p.server_keepalive == 10
        };
        // The client's confirmation also updates the server's mirror
        let server_done = server_params.read().unwrap().client_keepalive == 10;
        if client_done && server_done {
            return;
        }
        sleep(Duration::from_millis(200)).await;
    }
    panic!("tuned keepalive never converged across the control channel");
}

/// Dispatched sids stay unique across concurrent sessions.
#[tokio::test]
async fn test_dispatch_sids_unique() {
    let tunnel = new_tunnel().await;
    let mut config = tunnel.server_config(TransportType::Tcp);
    config.dial_timeout = 2;
    tunnel.start_server(config);

    let mut control = connect_retry(&tunnel.control_addr).await;
    protocol::write_frame(&mut control, &ControlFrame::Hello { token: TOKEN.to_string() })
        .await
        .unwrap();
    protocol::read_frame(&mut control).await.unwrap();

    // Warm pool of four
    let mut data_conns = Vec::new();
    for seq in 1u32..=4 {
        let mut data = TcpStream::connect(&tunnel.control_addr).await.unwrap();
        protocol::write_frame(&mut data, &ControlFrame::Ready { sid: seq }).await.unwrap();
        data_conns.push(data);
    }
    sleep(Duration::from_millis(300)).await;

    let mut users = Vec::new();
    for _ in 0..4 {
        users.push(TcpStream::connect(("127.0.0.1", tunnel.listen_port)).await.unwrap());
    }

    let sids = timeout(Duration::from_secs(5), async {
        let mut sids = Vec::new();
        while sids.len() < 4 {
            match protocol::read_frame(&mut control).await.unwrap() {
                ControlFrame::Dispatch { sid, .. } => sids.push(sid),
                ControlFrame::Ping => {
                    protocol::write_frame(&mut control, &ControlFrame::Pong).await.unwrap();
                }
                _ => {}
            }
        }
        sids
    })
    .await
    .unwrap();

    let mut dedup = sids.clone();
    dedup.sort_unstable();
    dedup.dedup();
    assert_eq!(dedup.len(), sids.len(), "duplicate sid in {:?}", sids);
}
