//! Error kinds the transport crate signals (§7 Error Handling Design).

use thiserror::Error;

pub const MAX_CHUNK_SIZE: usize = 230;
pub const MAX_PAYLOAD_BYTES: usize = 10 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("chunk disagrees with bucket's expected total: {0}")]
    InconsistentTotal(String),

    #[error("encoded envelope of {actual} bytes exceeds the {limit} byte ceiling")]
    PayloadTooLarge { actual: usize, limit: usize },

    #[error("chunk of {actual} bytes exceeds the {limit} byte hard ceiling")]
    FrameTooLarge { actual: usize, limit: usize },

    #[error("reliability strategy {0:?} is reserved and not yet implemented")]
    Unimplemented(String),
}
