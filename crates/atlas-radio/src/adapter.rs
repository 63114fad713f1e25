//! # Radio Adapter contract (§4.8)
//!
//! Two implementations behind one contract: the hardware serial adapter
//! ([`crate::serial`]) and the in-memory simulation bus ([`crate::sim`]),
//! grounded on `strata-bonding::net::transport::TransportLink`'s pattern of
//! a thin I/O-adapter wrapping pure transport logic.

use bytes::Bytes;
use thiserror::Error;

pub const MAX_CHUNK_SIZE: usize = 230;

#[derive(Debug, Error)]
pub enum RadioError {
    #[error("frame of {actual} bytes exceeds the {limit} byte hard ceiling")]
    FrameTooLarge { actual: usize, limit: usize },

    #[error("radio send failed: {0}")]
    SendFailed(String),

    #[error("radio adapter closed")]
    Closed,
}

/// Unified send/receive contract. The adapter MUST NOT fragment: frames
/// exceeding [`MAX_CHUNK_SIZE`] are rejected with [`RadioError::FrameTooLarge`].
pub trait RadioAdapter: Send + Sync {
    /// Send one already-framed chunk to `destination_node_id`.
    fn send(&self, destination_node_id: &str, frame: Bytes) -> Result<(), RadioError>;

    /// Block until a frame arrives or the adapter is shut down.
    fn recv(&self) -> Result<(String, Bytes), RadioError>;
}

pub(crate) fn check_frame_size(frame: &[u8]) -> Result<(), RadioError> {
    if frame.len() > MAX_CHUNK_SIZE {
        return Err(RadioError::FrameTooLarge {
            actual: frame.len(),
            limit: MAX_CHUNK_SIZE,
        });
    }
    Ok(())
}
