//! Metric collection for the auto-tuner
//!
//! Collection failures are logged and surface as `None`; the tuner skips
//! the affected decisions for that tick instead of failing.

use std::time::Duration;
use sysinfo::System;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

/// Fallback RTT probe target when the tunnel remote is unreachable
pub const RTT_FALLBACK_ADDR: &str = "8.8.8.8:53";

/// TCP connect attempts per RTT measurement
pub const RTT_PROBE_ATTEMPTS: u32 = 3;

/// Per-probe connect budget
pub const RTT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// One tick's worth of measurements
#[derive(Debug, Clone, Copy, Default)]
pub struct Sample {
    /// CPU utilization percent (0–100)
    pub cpu: Option<f64>,
    /// Memory utilization percent (0–100)
    pub mem: Option<f64>,
    /// Probe loss percent (0–100)
    pub loss: Option<f64>,
    /// Mean probe RTT in milliseconds
    pub rtt_ms: Option<f64>,
    /// Tunnel throughput in bytes per second
    pub throughput: Option<f64>,
}

/// Sample CPU and memory utilization. Blocking; call via `spawn_blocking`.
pub fn cpu_mem_usage() -> (Option<f64>, Option<f64>) {
    let mut sys = System::new();

    sys.refresh_cpu_usage();
    std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    sys.refresh_cpu_usage();
    let cpu = Some(sys.global_cpu_usage() as f64);

    sys.refresh_memory();
    let mem = match sys.total_memory() {
        0 => {
            debug!("total memory reported as zero, skipping memory metric");
            None
        }
        total => Some(sys.used_memory() as f64 / total as f64 * 100.0),
    };

    (cpu, mem)
}

/// Measure RTT via TCP connects to `addr`.
///
/// Returns `(mean RTT ms, loss %)`; RTT is `None` when every probe failed.
pub async fn probe_rtt(addr: &str) -> (Option<f64>, Option<f64>) {
    let mut rtts = Vec::with_capacity(RTT_PROBE_ATTEMPTS as usize);
    let mut failures = 0u32;

    for _ in 0..RTT_PROBE_ATTEMPTS {
        let start = Instant::now();
        match tokio::time::timeout(RTT_PROBE_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                rtts.push(start.elapsed().as_secs_f64() * 1000.0);
                drop(stream);
            }
            Ok(Err(e)) => {
                debug!(addr, error = %e, "RTT probe failed");
                failures += 1;
            }
            Err(_) => {
                debug!(addr, "RTT probe timed out");
                failures += 1;
            }
        }
    }

    let loss = Some(failures as f64 / RTT_PROBE_ATTEMPTS as f64 * 100.0);
    let rtt = if rtts.is_empty() {
        None
    } else {
        Some(rtts.iter().sum::<f64>() / rtts.len() as f64)
    };
    (rtt, loss)
}

/// Probe the tunnel remote, falling back to a public resolver so that an
/// unreachable peer still yields a link-quality signal.
pub async fn probe_rtt_with_fallback(remote: Option<&str>) -> (Option<f64>, Option<f64>) {
    if let Some(addr) = remote {
        let (rtt, loss) = probe_rtt(addr).await;
        if rtt.is_some() {
            return (rtt, loss);
        }
    }
    probe_rtt(RTT_FALLBACK_ADDR).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_probe_rtt_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        // Keep accepting so probes connect
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });

        let (rtt, loss) = probe_rtt(&addr).await;
        assert!(rtt.is_some());
        assert_eq!(loss, Some(0.0));
    }

    #[tokio::test]
    async fn test_probe_rtt_all_failures() {
        // Bind then drop so the port is free and connects are refused
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let (rtt, loss) = probe_rtt(&addr).await;
        assert!(rtt.is_none());
        assert_eq!(loss, Some(100.0));
    }
}
