//! # Codec
//!
//! Envelope ↔ compact binary (§4.1). Pipeline: canonicalize via serde →
//! key-alias (long field names compacted to short tags) → MessagePack pack
//! → Zstandard compression. Decode reverses the pipeline.
//!
//! The key-alias table is frozen in SPEC_FULL.md §6 and mirrored in the
//! `#[serde(rename = "...")]` attributes below.

use atlas_common::envelope::{Envelope, EnvelopeType};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{TransportError, MAX_PAYLOAD_BYTES};

const ZSTD_LEVEL: i32 = 3;

/// On-wire shape of an [`Envelope`] with the frozen key aliases applied.
#[derive(Debug, Serialize, Deserialize)]
struct WireEnvelope {
    i: String,
    t: EnvelopeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    c: Option<String>,
    #[serde(default = "default_priority")]
    p: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    x: Option<String>,
    #[serde(default)]
    d: Value,
    #[serde(default)]
    m: Map<String, Value>,
}

fn default_priority() -> i32 {
    atlas_common::envelope::DEFAULT_PRIORITY
}

impl From<&Envelope> for WireEnvelope {
    fn from(e: &Envelope) -> Self {
        WireEnvelope {
            i: e.id.clone(),
            t: e.ty,
            c: e.command.clone(),
            p: e.priority,
            x: e.correlation_id.clone(),
            d: e.data.clone(),
            m: e.meta.clone(),
        }
    }
}

impl From<WireEnvelope> for Envelope {
    fn from(w: WireEnvelope) -> Self {
        Envelope {
            id: w.i,
            ty: w.t,
            command: w.c,
            priority: w.p,
            correlation_id: w.x,
            data: w.d,
            meta: w.m,
        }
    }
}

/// Encode an envelope into its on-air byte representation.
///
/// Fails with [`TransportError::PayloadTooLarge`] if the encoded size
/// exceeds the 10 KB ceiling — this check happens at submit time, before
/// any chunking (§4.1).
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, TransportError> {
    let wire = WireEnvelope::from(envelope);
    let packed = rmp_serde::to_vec_named(&wire)
        .map_err(|e| TransportError::MalformedEnvelope(format!("msgpack encode: {e}")))?;
    let compressed = zstd::encode_all(packed.as_slice(), ZSTD_LEVEL)
        .map_err(|e| TransportError::MalformedEnvelope(format!("zstd encode: {e}")))?;
    if compressed.len() > MAX_PAYLOAD_BYTES {
        return Err(TransportError::PayloadTooLarge {
            actual: compressed.len(),
            limit: MAX_PAYLOAD_BYTES,
        });
    }
    Ok(compressed)
}

/// Decode an on-air byte representation back into an envelope.
///
/// Fails with [`TransportError::MalformedEnvelope`] when decompression
/// fails, the MessagePack body doesn't parse, or required fields (`id`,
/// `type`) are absent.
pub fn decode(bytes: &[u8]) -> Result<Envelope, TransportError> {
    let packed = zstd::decode_all(bytes)
        .map_err(|e| TransportError::MalformedEnvelope(format!("zstd decode: {e}")))?;
    let wire: WireEnvelope = rmp_serde::from_slice(&packed)
        .map_err(|e| TransportError::MalformedEnvelope(format!("msgpack decode: {e}")))?;
    Ok(wire.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_request() {
        let env = Envelope::request("list_entities", serde_json::json!({"x": 1}));
        let bytes = encode(&env).unwrap();
        let back = decode(&bytes).unwrap();
        assert_eq!(env.id, back.id);
        assert_eq!(env.command, back.command);
        assert_eq!(env.data, back.data);
        assert_eq!(env.priority, back.priority);
    }

    #[test]
    fn roundtrip_ack() {
        let env = Envelope::ack("req-42");
        let bytes = encode(&env).unwrap();
        let back = decode(&bytes).unwrap();
        assert!(back.ty.is_ack());
        assert_eq!(back.correlation_id.as_deref(), Some("req-42"));
    }

    #[test]
    fn oversize_payload_rejected() {
        let huge = "x".repeat(12 * 1024);
        let env = Envelope::request("bulk", serde_json::json!({ "blob": huge }));
        let err = encode(&env).unwrap_err();
        assert!(matches!(err, TransportError::PayloadTooLarge { .. }));
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = decode(b"not a zstd frame").unwrap_err();
        assert!(matches!(err, TransportError::MalformedEnvelope(_)));
    }

    #[test]
    fn wire_envelope_uses_short_keys() {
        let env = Envelope::request("test_echo", serde_json::json!({"x": 1}));
        let value = serde_json::to_value(WireEnvelope::from(&env)).unwrap();
        let obj = value.as_object().expect("wire envelope encodes as a map");
        assert!(obj.contains_key("i"));
        assert!(obj.contains_key("t"));
        assert!(obj.contains_key("c"));
        assert!(!obj.contains_key("id"));
        assert!(!obj.contains_key("command"));
    }
}
