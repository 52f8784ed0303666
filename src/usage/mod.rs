//! Per-port traffic accounting
//!
//! Every byte copied through the tunnel is attributed to its listener port
//! so the external telemetry panel can summarize. Counters are per-port
//! atomics; the store itself is opaque to the data plane and recording
//! never fails a session.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Copy direction for attribution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// End user → behind-peer service
    Up,
    /// Behind-peer service → end user
    Down,
}

/// Sink the data plane reports into. Opaque; failures are non-fatal.
pub trait UsageSink: Send + Sync {
    fn record_bytes(&self, port: u16, direction: Direction, n: u64);
}

#[derive(Default)]
struct PortCounters {
    up: AtomicU64,
    down: AtomicU64,
}

/// Snapshot of one port's counters
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortUsage {
    pub port: u16,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

/// In-memory usage store with optional JSON persistence
pub struct UsageStore {
    ports: RwLock<HashMap<u16, PortCounters>>,
    /// Persistence target (`sniffer_log`); `None` disables flushing
    path: Option<PathBuf>,
}

impl UsageStore {
    pub fn new(path: Option<PathBuf>) -> Arc<Self> {
        let store = Arc::new(Self { ports: RwLock::new(HashMap::new()), path });
        store.load();
        store
    }

    /// Disabled store: counters work, nothing is persisted
    pub fn ephemeral() -> Arc<Self> {
        Self::new(None)
    }

    /// Total bytes in both directions across all ports
    pub fn total_bytes(&self) -> u64 {
        let ports = self.ports.read().unwrap();
        ports
            .values()
            .map(|c| c.up.load(Ordering::Relaxed) + c.down.load(Ordering::Relaxed))
            .sum()
    }

    /// Per-port snapshots, sorted by port
    pub fn snapshot(&self) -> Vec<PortUsage> {
        let ports = self.ports.read().unwrap();
        let mut usages: Vec<PortUsage> = ports
            .iter()
            .map(|(&port, c)| PortUsage {
                port,
                bytes_up: c.up.load(Ordering::Relaxed),
                bytes_down: c.down.load(Ordering::Relaxed),
            })
            .collect();
        usages.sort_by_key(|u| u.port);
        usages
    }

    pub fn port_usage(&self, port: u16) -> Option<PortUsage> {
        let ports = self.ports.read().unwrap();
        ports.get(&port).map(|c| PortUsage {
            port,
            bytes_up: c.up.load(Ordering::Relaxed),
            bytes_down: c.down.load(Ordering::Relaxed),
        })
    }

    /// Write counters to the configured file
    pub fn flush(&self) {
        let Some(path) = &self.path else { return };
        let snapshot = self.snapshot();
        match serde_json::to_vec_pretty(&snapshot) {
            Ok(data) => {
                if let Err(e) = std::fs::write(path, data) {
                    debug!(path = %path.display(), error = %e, "failed to persist usage");
                }
            }
            Err(e) => debug!(error = %e, "failed to serialize usage"),
        }
    }

    /// Load persisted counters. A corrupt file is truncated and
    /// reinitialized, logged once.
    fn load(&self) {
        let Some(path) = &self.path else { return };
        let data = match std::fs::read(path) {
            Ok(data) if !data.is_empty() => data,
            _ => return,
        };

        match serde_json::from_slice::<Vec<PortUsage>>(&data) {
            Ok(usages) => {
                let mut ports = self.ports.write().unwrap();
                for usage in usages {
                    let counters = ports.entry(usage.port).or_default();
                    counters.up.store(usage.bytes_up, Ordering::Relaxed);
                    counters.down.store(usage.bytes_down, Ordering::Relaxed);
                }
                info!(path = %path.display(), "restored usage counters");
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "usage file corrupt, reinitializing");
                let _ = std::fs::write(path, b"[]");
            }
        }
    }

    /// Spawn the periodic flush worker
    pub fn spawn_flusher(
        self: &Arc<Self>,
        interval: std::time::Duration,
        cancel: tokio_util::sync::CancellationToken,
    ) {
        if self.path.is_none() {
            return;
        }
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        store.flush();
                        break;
                    }
                    _ = ticker.tick() => store.flush(),
                }
            }
        });
    }
}

impl UsageSink for UsageStore {
    fn record_bytes(&self, port: u16, direction: Direction, n: u64) {
        if n == 0 {
            return;
        }
        {
            let ports = self.ports.read().unwrap();
            if let Some(counters) = ports.get(&port) {
                match direction {
                    Direction::Up => counters.up.fetch_add(n, Ordering::Relaxed),
                    Direction::Down => counters.down.fetch_add(n, Ordering::Relaxed),
                };
                return;
            }
        }
        let mut ports = self.ports.write().unwrap();
        let counters = ports.entry(port).or_default();
        match direction {
            Direction::Up => counters.up.fetch_add(n, Ordering::Relaxed),
            Direction::Down => counters.down.fetch_add(n, Ordering::Relaxed),
        };
    }
}

/// Live-config surface the external telemetry panel reads
pub trait ConfigProvider: Send + Sync {
    fn server_config(&self) -> Option<crate::config::ServerConfig>;
    fn client_config(&self) -> Option<crate::config::ClientConfig>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let store = UsageStore::ephemeral();
        store.record_bytes(7000, Direction::Up, 4);
        store.record_bytes(7000, Direction::Down, 4);
        store.record_bytes(8080, Direction::Up, 100);

        let usage = store.port_usage(7000).unwrap();
        assert_eq!(usage.bytes_up, 4);
        assert_eq!(usage.bytes_down, 4);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].port, 7000);
        assert_eq!(store.total_bytes(), 108);
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = std::env::temp_dir().join(format!("overpass-usage-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("roundtrip.json");

        {
            let store = UsageStore::new(Some(path.clone()));
            store.record_bytes(443, Direction::Down, 1234);
            store.flush();
        }

        let restored = UsageStore::new(Some(path.clone()));
        assert_eq!(restored.port_usage(443).unwrap().bytes_down, 1234);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_corrupt_file_reinitialized() {
        let dir = std::env::temp_dir().join(format!("overpass-usage-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("corrupt.json");
        std::fs::write(&path, b"{not json").unwrap();

        let store = UsageStore::new(Some(path.clone()));
        assert!(store.snapshot().is_empty());
        // File was truncated to a clean state
        assert_eq!(std::fs::read(&path).unwrap(), b"[]");

        std::fs::remove_file(path).ok();
    }
}
