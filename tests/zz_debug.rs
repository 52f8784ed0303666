use overpass::client::TunnelClient;
use overpass::config::{ClientConfig, ServerConfig, TransportType};
use overpass::server::TunnelServer;
use overpass::tuning::LiveParams;
use overpass::usage::UsageStore;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;

const TOKEN: &str = "integration-secret";

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

#[tokio::test]
async fn debug_ws() {
    let _ = tracing_subscriber::fmt::try_init();
    let listen_port = free_port();
    let echo_port = free_port();
    let control_port = free_port();
    let control_addr = format!("127.0.0.1:{}", control_port);

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", echo_port)).await.unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else { break };
            tokio::spawn(async move {
                let (mut rd, mut wr) = stream.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });

    let server_config = ServerConfig {
        bind_addr: control_addr.clone(),
        transport: TransportType::Ws,
        token: TOKEN.to_string(),
        ports: vec![format!("{}={}", listen_port, echo_port)],
        heartbeat: 2,
        dial_timeout: 3,
        sniffer: false,
        ..Default::default()
    };
    let client_config = ClientConfig {
        remote_addr: control_addr.clone(),
        transport: TransportType::Ws,
        token: TOKEN.to_string(),
        retry_interval: 1,
        dial_timeout: 3,
        connection_pool: 2,
        sniffer: false,
        ..Default::default()
    };

    let sparams = Arc::new(RwLock::new(LiveParams::from_server(&server_config)));
    let server = TunnelServer::new(
        server_config,
        sparams,
        UsageStore::ephemeral(),
        CancellationToken::new(),
        None,
    )
    .unwrap();
    tokio::spawn(async move {
        let r = server.run().await;
        println!("server exited: {:?}", r);
    });

    let cparams = Arc::new(RwLock::new(LiveParams::from_client(&client_config)));
    let client = TunnelClient::new(
        client_config,
        cparams,
        UsageStore::ephemeral(),
        CancellationToken::new(),
        None,
    )
    .unwrap();
    tokio::spawn(async move {
        let r = client.run().await;
        println!("client exited: {:?}", r);
    });

    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    match tokio::net::TcpStream::connect(("127.0.0.1", listen_port)).await {
        Ok(_) => println!("connected to listen port"),
        Err(e) => println!("connect failed: {:?}", e),
    }
}
