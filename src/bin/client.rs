//! Overpass Client (behind-peer)
//!
//! Dials the front-peer's control channel from inside the NAT, keeps warm
//! data resources ready, and glues dispatched sessions to local services.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use overpass::client::TunnelClient;
use overpass::config::Config;
use overpass::tuning::{LiveParams, PeerRole, Tuner};
use overpass::usage::UsageStore;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Overpass Client - reverse tunnel behind-peer
#[derive(Parser, Debug)]
#[command(name = "overpass-client")]
#[command(about = "Overpass Client - connect local services to a public front-peer")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error); overrides config
    #[arg(short = 'v', long)]
    log_level: Option<String>,

    /// Disable automatic performance tuning
    #[arg(long)]
    no_auto_tune: bool,

    /// Initial tuning interval in seconds
    #[arg(long, default_value_t = 600)]
    tune_interval: u64,
}

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(drained) => {
            if drained {
                0
            } else {
                2
            }
        }
        Err(e) => {
            error!(error = %e, "fatal error");
            eprintln!("error: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<bool> {
    let args = Args::parse();

    let config = Config::load(&args.config).context("failed to load configuration")?;
    let client_config = config
        .client
        .clone()
        .ok_or_else(|| anyhow!("no [client] section in config file"))?;

    let log_level = args.log_level.unwrap_or_else(|| client_config.log_level.clone());
    tracing_subscriber::fmt().with_env_filter(&log_level).init();

    info!(version = overpass::VERSION, config = %args.config, "overpass client starting");

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let usage = if client_config.sniffer {
        UsageStore::new(Some(client_config.sniffer_log.clone().into()))
    } else {
        UsageStore::ephemeral()
    };
    usage.spawn_flusher(Duration::from_secs(30), cancel.clone());

    let params = Arc::new(RwLock::new(LiveParams::from_client(&client_config)));

    let keepalive_rx = if args.no_auto_tune {
        info!("auto-tuning disabled by flag");
        None
    } else {
        let tuner = Tuner::new(
            Arc::clone(&params),
            PeerRole::Client,
            Arc::clone(&usage),
            Some(client_config.remote_addr.clone()),
            Duration::from_secs(args.tune_interval),
        );
        let keepalive_rx = tuner.keepalive_updates();
        tuner.spawn(cancel.clone());
        Some(keepalive_rx)
    };

    let client = TunnelClient::new(client_config, params, usage, cancel.clone(), keepalive_rx)
        .context("invalid client configuration")?;
    let drained = client.run().await.context("client failed")?;

    info!("all workers stopped");
    Ok(drained)
}

/// First signal starts the graceful drain; a second one force-exits.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received, draining sessions");
        cancel.cancel();

        wait_for_signal().await;
        warn!("second signal received, forcing shutdown");
        std::process::exit(2);
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
