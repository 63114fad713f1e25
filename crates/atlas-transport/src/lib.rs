//! # atlas-transport
//!
//! Reliable message transport core: envelope codec, chunk wire format,
//! reassembly, and selective-repeat reliability.
//!
//! ## Crate structure
//!
//! - [`wire`] — 16-byte chunk header serialization
//! - [`codec`] — envelope ↔ compact binary (key-alias, MessagePack, Zstandard)
//! - [`reassembler`] — per-(sender, prefix) TTL reassembly buckets
//! - [`reliability`] — windowed selective-repeat chunk recovery

pub mod codec;
pub mod error;
pub mod reassembler;
pub mod reliability;
pub mod wire;

pub use error::{TransportError, MAX_CHUNK_SIZE, MAX_PAYLOAD_BYTES};
