//! # Overpass
//!
//! A reverse TCP tunnel: a pair of cooperating processes that expose
//! services running behind a NAT or firewall through a publicly reachable
//! host.
//!
//! ## Roles
//!
//! - **Server (front-peer)**: binds the control channel and the published
//!   ports, accepts end-user connections, and schedules each one onto a
//!   ready data resource supplied by the client.
//! - **Client (behind-peer)**: dials the server's control channel, keeps a
//!   pool (or multiplex) of warm data resources, and glues dispatched
//!   sessions to local services.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   Session Router                     │
//! │      (accept loops, dispatch, byte relaying)         │
//! ├─────────────────────────────────────────────────────┤
//! │               Pool / Mux Management                  │
//! │      (warm resources, refill, carrier streams)       │
//! ├─────────────────────────────────────────────────────┤
//! │                 Control Protocol                     │
//! │      (handshake, heartbeat, session dispatch)        │
//! ├─────────────────────────────────────────────────────┤
//! │                Transport Adapters                    │
//! │   (TCP, TCP-mux, WS, WS-mux, QUIC, UDP-over-TCP)    │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod client;
pub mod config;
pub mod mux;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;
pub mod tuning;
pub mod usage;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Mux error: {0}")]
    Mux(#[from] mux::MuxError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timeout")]
    Timeout,

    #[error("Authentication failed")]
    AuthenticationFailed,
}
