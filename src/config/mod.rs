//! Configuration management

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Main configuration
///
/// Exactly one of `server` / `client` is active per process; the binaries
/// reject files that define neither (or an empty one) for their role.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server (front-peer) configuration
    pub server: Option<ServerConfig>,
    /// Client (behind-peer) configuration
    pub client: Option<ClientConfig>,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("failed to write config: {}", e)))
    }
}

/// Transport variant carried on the wire between the two peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    Tcp,
    TcpMux,
    Ws,
    Wss,
    WsMux,
    WssMux,
    Quic,
    Udp,
}

impl TransportType {
    /// Whether data resources are multiplexed carriers rather than
    /// one-connection-per-session streams.
    pub fn is_mux(&self) -> bool {
        matches!(self, TransportType::TcpMux | TransportType::WsMux | TransportType::WssMux)
    }

    /// Whether the WebSocket layer runs over TLS.
    pub fn is_tls(&self) -> bool {
        matches!(self, TransportType::Wss | TransportType::WssMux)
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportType::Tcp => "tcp",
            TransportType::TcpMux => "tcpmux",
            TransportType::Ws => "ws",
            TransportType::Wss => "wss",
            TransportType::WsMux => "wsmux",
            TransportType::WssMux => "wssmux",
            TransportType::Quic => "quic",
            TransportType::Udp => "udp",
        };
        f.write_str(s)
    }
}

/// One published port: listen on the front-peer, dial on the behind-peer.
///
/// Parsed from `"80"` (listen 80, dial 80) or `"80=8080"` (listen 80,
/// dial 8080). Immutable for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub listen_port: u16,
    pub remote_port: u16,
}

impl FromStr for PortMapping {
    type Err = crate::Error;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let bad = |spec: &str| crate::Error::Config(format!("invalid port spec: {:?}", spec));

        match spec.split_once('=') {
            Some((listen, remote)) => {
                let listen_port = listen.trim().parse().map_err(|_| bad(spec))?;
                let remote_port = remote.trim().parse().map_err(|_| bad(spec))?;
                Ok(Self { listen_port, remote_port })
            }
            None => {
                let port = spec.trim().parse().map_err(|_| bad(spec))?;
                Ok(Self { listen_port: port, remote_port: port })
            }
        }
    }
}

/// Parse the configured port specs, rejecting duplicate listen ports.
pub fn parse_port_mappings(specs: &[String]) -> Result<Vec<PortMapping>, crate::Error> {
    let mut mappings: Vec<PortMapping> = Vec::with_capacity(specs.len());
    for spec in specs {
        let mapping: PortMapping = spec.parse()?;
        if mappings.iter().any(|m| m.listen_port == mapping.listen_port) {
            return Err(crate::Error::Config(format!(
                "duplicate listen port {} in ports list",
                mapping.listen_port
            )));
        }
        mappings.push(mapping);
    }
    Ok(mappings)
}

/// Server (front-peer) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Public address for the control channel and data connections
    pub bind_addr: String,
    /// Transport variant
    pub transport: TransportType,
    /// Shared bearer token checked during the channel handshake
    pub token: String,
    /// Published ports, `"listen"` or `"listen=remote"`
    pub ports: Vec<String>,
    /// TCP_NODELAY on accepted and dialed sockets
    pub nodelay: bool,
    /// TCP keepalive period in seconds
    pub keepalive_period: u64,
    /// Control-channel ping interval in seconds
    pub heartbeat: u64,
    /// Bound for internal frame queues
    pub channel_size: usize,
    /// Max concurrent sub-streams per mux carrier / QUIC connection
    pub mux_con: usize,
    /// Mux protocol version, 1 or 2; both select the same sub-stream framing
    pub mux_version: u8,
    /// Largest mux data frame payload in bytes
    pub mux_framesize: usize,
    /// Per-carrier receive budget in bytes
    pub mux_receivebuffer: usize,
    /// Per-substream buffer in bytes
    pub mux_streambuffer: usize,
    /// Also accept UDP datagrams on published ports (tcp transport)
    pub accept_udp: bool,
    /// Wait budget for a ready resource before dropping a user connection
    pub dial_timeout: u64,
    /// Idle expiry for UDP datagram flows in seconds
    pub udp_idle_timeout: u64,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Record per-port usage counters
    pub sniffer: bool,
    /// Usage persistence file
    pub sniffer_log: String,
    /// Port the external telemetry panel listens on (0 = disabled)
    pub web_port: u16,
    /// TLS certificate path (wss / quic)
    pub tls_cert: Option<String>,
    /// TLS key path (wss / quic)
    pub tls_key: Option<String>,
    /// SO_RCVBUF in bytes (0 = kernel default)
    pub so_rcvbuf: usize,
    /// SO_SNDBUF in bytes (0 = kernel default)
    pub so_sndbuf: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: String::new(),
            transport: TransportType::Tcp,
            token: defaults::TOKEN.to_string(),
            ports: Vec::new(),
            nodelay: defaults::NODELAY,
            keepalive_period: defaults::KEEPALIVE,
            heartbeat: defaults::HEARTBEAT,
            channel_size: defaults::CHANNEL_SIZE,
            mux_con: defaults::MUX_CON,
            mux_version: defaults::MUX_VERSION,
            mux_framesize: defaults::MAX_FRAME_SIZE,
            mux_receivebuffer: defaults::MAX_RECEIVE_BUFFER,
            mux_streambuffer: defaults::MAX_STREAM_BUFFER,
            accept_udp: false,
            dial_timeout: defaults::DIAL_TIMEOUT,
            udp_idle_timeout: defaults::UDP_IDLE_TIMEOUT,
            log_level: defaults::LOG_LEVEL.to_string(),
            sniffer: true,
            sniffer_log: defaults::SNIFFER_LOG.to_string(),
            web_port: 0,
            tls_cert: None,
            tls_key: None,
            so_rcvbuf: 0,
            so_sndbuf: 0,
        }
    }
}

impl ServerConfig {
    /// Validate the server section before start-up. Failures are fatal.
    pub fn validate(&self) -> Result<Vec<PortMapping>, crate::Error> {
        if self.bind_addr.is_empty() {
            return Err(crate::Error::Config("server.bind_addr is required".into()));
        }
        if self.heartbeat == 0 {
            return Err(crate::Error::Config("server.heartbeat must be at least 1".into()));
        }
        if self.transport.is_mux() && self.mux_con == 0 {
            return Err(crate::Error::Config("server.mux_con must be at least 1".into()));
        }
        if !matches!(self.mux_version, 1 | 2) {
            return Err(crate::Error::Config(format!(
                "server.mux_version must be 1 or 2, got {}",
                self.mux_version
            )));
        }
        parse_port_mappings(&self.ports)
    }
}

/// Client (behind-peer) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address to dial for the control channel and data resources
    pub remote_addr: String,
    /// Transport variant; must match the server
    pub transport: TransportType,
    /// Shared bearer token
    pub token: String,
    /// TCP_NODELAY on dialed sockets
    pub nodelay: bool,
    /// TCP keepalive period in seconds
    pub keepalive_period: u64,
    /// Control-channel reconnect interval in seconds
    pub retry_interval: u64,
    /// Target number of warm data resources
    pub connection_pool: usize,
    /// Over-provision the pool on consumption bursts
    pub aggressive_pool: bool,
    /// Number of mux carrier connections
    pub mux_session: usize,
    /// Mux protocol version, 1 or 2; both select the same sub-stream framing
    pub mux_version: u8,
    /// Largest mux data frame payload in bytes
    pub mux_framesize: usize,
    /// Per-carrier receive budget in bytes
    pub mux_receivebuffer: usize,
    /// Per-substream buffer in bytes
    pub mux_streambuffer: usize,
    /// Local dial timeout in seconds
    pub dial_timeout: u64,
    /// Dial this IP instead of `remote_addr` while keeping the WS Host
    /// header and TLS SNI at `remote_addr` (CDN fronting)
    pub edge_ip: Option<String>,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Record per-port usage counters
    pub sniffer: bool,
    /// Usage persistence file
    pub sniffer_log: String,
    /// Port the external telemetry panel listens on (0 = disabled)
    pub web_port: u16,
    /// SO_RCVBUF in bytes (0 = kernel default)
    pub so_rcvbuf: usize,
    /// SO_SNDBUF in bytes (0 = kernel default)
    pub so_sndbuf: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            remote_addr: String::new(),
            transport: TransportType::Tcp,
            token: defaults::TOKEN.to_string(),
            nodelay: defaults::NODELAY,
            keepalive_period: defaults::KEEPALIVE,
            retry_interval: defaults::RETRY_INTERVAL,
            connection_pool: defaults::CONNECTION_POOL,
            aggressive_pool: defaults::AGGRESSIVE_POOL,
            mux_session: defaults::MUX_SESSION,
            mux_version: defaults::MUX_VERSION,
            mux_framesize: defaults::MAX_FRAME_SIZE,
            mux_receivebuffer: defaults::MAX_RECEIVE_BUFFER,
            mux_streambuffer: defaults::MAX_STREAM_BUFFER,
            dial_timeout: defaults::DIAL_TIMEOUT,
            edge_ip: None,
            log_level: defaults::LOG_LEVEL.to_string(),
            sniffer: true,
            sniffer_log: defaults::SNIFFER_LOG.to_string(),
            web_port: 0,
            so_rcvbuf: 0,
            so_sndbuf: 0,
        }
    }
}

impl ClientConfig {
    /// Validate the client section before start-up. Failures are fatal.
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.remote_addr.is_empty() {
            return Err(crate::Error::Config("client.remote_addr is required".into()));
        }
        if self.dial_timeout == 0 {
            return Err(crate::Error::Config("client.dial_timeout must be at least 1".into()));
        }
        if self.connection_pool == 0 {
            return Err(crate::Error::Config(
                "client.connection_pool must be at least 1".into(),
            ));
        }
        if self.transport.is_mux() && self.mux_session == 0 {
            return Err(crate::Error::Config("client.mux_session must be at least 1".into()));
        }
        if !matches!(self.mux_version, 1 | 2) {
            return Err(crate::Error::Config(format!(
                "client.mux_version must be 1 or 2, got {}",
                self.mux_version
            )));
        }
        Ok(())
    }
}

/// Default values applied to absent config fields
pub mod defaults {
    pub const TOKEN: &str = "overpass";
    pub const LOG_LEVEL: &str = "info";
    pub const NODELAY: bool = true;
    pub const KEEPALIVE: u64 = 75;
    pub const HEARTBEAT: u64 = 40;
    pub const CHANNEL_SIZE: usize = 2048;
    pub const CONNECTION_POOL: usize = 8;
    pub const AGGRESSIVE_POOL: bool = true;
    pub const RETRY_INTERVAL: u64 = 3;
    pub const DIAL_TIMEOUT: u64 = 10;
    pub const UDP_IDLE_TIMEOUT: u64 = 60;
    pub const MUX_SESSION: usize = 1;
    pub const MUX_CON: usize = 8;
    pub const MUX_VERSION: u8 = 1;
    pub const MAX_FRAME_SIZE: usize = 32 * 1024;
    pub const MAX_RECEIVE_BUFFER: usize = 4 * 1024 * 1024;
    pub const MAX_STREAM_BUFFER: usize = 256 * 1024;
    pub const SNIFFER_LOG: &str = "overpass.json";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_spec_plain() {
        let m: PortMapping = "7000".parse().unwrap();
        assert_eq!(m.listen_port, 7000);
        assert_eq!(m.remote_port, 7000);
    }

    #[test]
    fn test_port_spec_remap() {
        let m: PortMapping = "80=8080".parse().unwrap();
        assert_eq!(m.listen_port, 80);
        assert_eq!(m.remote_port, 8080);
    }

    #[test]
    fn test_port_spec_invalid() {
        assert!("".parse::<PortMapping>().is_err());
        assert!("80=".parse::<PortMapping>().is_err());
        assert!("http".parse::<PortMapping>().is_err());
        assert!("70000".parse::<PortMapping>().is_err());
    }

    #[test]
    fn test_duplicate_listen_ports_rejected() {
        let specs = vec!["80".to_string(), "80=8080".to_string()];
        assert!(parse_port_mappings(&specs).is_err());
    }

    #[test]
    fn test_config_parse_with_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [server]
            bind_addr = "0.0.0.0:3080"
            transport = "tcpmux"
            ports = ["7000", "80=8080"]
            "#,
        )
        .unwrap();

        let server = cfg.server.unwrap();
        assert_eq!(server.transport, TransportType::TcpMux);
        assert_eq!(server.keepalive_period, defaults::KEEPALIVE);
        assert_eq!(server.heartbeat, defaults::HEARTBEAT);
        assert_eq!(server.mux_con, defaults::MUX_CON);
        assert!(cfg.client.is_none());

        let mappings = server.validate().unwrap();
        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings[1].remote_port, 8080);
    }

    #[test]
    fn test_client_validation() {
        let mut client = ClientConfig::default();
        assert!(client.validate().is_err());
        client.remote_addr = "203.0.113.7:3080".to_string();
        assert!(client.validate().is_ok());
    }

    #[test]
    fn test_mux_version_bounds() {
        let mut server = ServerConfig { bind_addr: "0.0.0.0:3080".to_string(), ..Default::default() };
        server.mux_version = 2;
        assert!(server.validate().is_ok());
        server.mux_version = 99;
        assert!(server.validate().is_err());

        let mut client =
            ClientConfig { remote_addr: "203.0.113.7:3080".to_string(), ..Default::default() };
        client.mux_version = 0;
        assert!(client.validate().is_err());
        client.mux_version = 1;
        assert!(client.validate().is_ok());
    }
}
