//! Multiplexed carrier layer for `tcpmux` / `wsmux` transports
//!
//! One underlying connection (the carrier) transports up to `MuxCon`
//! concurrent sub-streams, one per tunnel session. Provides:
//! - Sub-stream framing
//! - Sub-stream state machine
//! - The carrier engine pairing frames with per-session byte streams

mod frame;
mod session;
mod stream;

pub use frame::{MuxFrame, MuxFrameType, MUX_HEADER_SIZE};
pub use session::{MuxParams, MuxSession, MuxStream};
pub use stream::{SubStream, SubStreamState};

use thiserror::Error;

/// Mux layer errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("frame too large: {0} > {1}")]
    FrameTooLarge(usize, usize),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("carrier at capacity ({0} sub-streams)")]
    CarrierFull(usize),

    #[error("carrier closed")]
    CarrierClosed,
}
