//! Envelope id helpers.
//!
//! §9 Design Notes: the correlation model assumes client-generated globally
//! unique ids, and retries MUST reuse the same id. This module centralizes
//! generation so client builders can't accidentally mint a fresh id per
//! retry.

use uuid::Uuid;

/// Generate a new globally-unique envelope id.
pub fn new_envelope_id() -> String {
    Uuid::now_v7().to_string()
}

/// The first 8 UTF-8 bytes of an envelope id, right-padded with `0x00`,
/// used as the chunk header's message-id prefix (§3 Chunk).
pub fn id_prefix(id: &str) -> [u8; 8] {
    let mut prefix = [0u8; 8];
    let bytes = id.as_bytes();
    let n = bytes.len().min(8);
    prefix[..n].copy_from_slice(&bytes[..n]);
    prefix
}
