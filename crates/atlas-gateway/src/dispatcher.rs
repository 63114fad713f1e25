//! # Dispatcher (gateway role, §4.7)
//!
//! Routes decoded envelopes: `ack` → Outbox, never to the application;
//! `request` → Dedupe Cache → HTTP executor → response routed back through
//! the Reliability Engine; control chunks bypass the Codec entirely and go
//! straight to the Reliability Engine. Grounded on
//! `strata-agent::control::run`'s `tokio::select!` multiplexing loop (here
//! driving radio inbound vs outbox flush vs shutdown instead of WS vs
//! heartbeat vs shutdown).

use std::time::Instant;

use atlas_common::envelope::{Envelope, EnvelopeType};
use atlas_dedupe::{DedupeCache, DedupeOutcome};
use atlas_transport::reassembler::Reassembler;
use atlas_transport::reliability::{
    missing_from_bitmap, split_into_chunks, NackIssuer, PendingSend, ReliabilityEngine,
    DEFAULT_NACK_INTERVAL, DEFAULT_NACK_MAX_PER_SEQ, CTRL_ALL_RECEIVED, CTRL_BITMAP_REQ,
};
use atlas_transport::wire::{Chunk, ChunkFlags};
use atlas_transport::{codec, TransportError};
use tracing::{info, warn};

/// What an inbound envelope implies the Dispatcher should do next, kept as
/// plain data so the routing decision itself is unit-testable without a
/// runtime (§4.7).
#[derive(Debug, PartialEq)]
pub enum GatewayAction {
    /// An end-to-end `ack` arrived; remove the matching Pending Send /
    /// Spool Record. Never forwarded to the application.
    AckReceived { correlation_id: String },
    /// A `request` was delivered; check dedupe, execute against the HTTP
    /// API if not cached, and reply.
    ExecuteRequest(Envelope),
    /// Anything else the gateway doesn't expect to receive (response/error
    /// arriving at a gateway implies the peer role is reversed).
    Unexpected(Envelope),
}

/// Pure routing decision for one delivered (non-control) envelope (§4.7).
pub fn route_envelope(envelope: Envelope) -> GatewayAction {
    match envelope.ty {
        EnvelopeType::Ack => GatewayAction::AckReceived {
            correlation_id: envelope.correlation_id.clone().unwrap_or_default(),
        },
        EnvelopeType::Request => GatewayAction::ExecuteRequest(envelope),
        EnvelopeType::Response | EnvelopeType::Error => GatewayAction::Unexpected(envelope),
    }
}

/// What to do with one inbound control chunk (ACK/NACK flag set), which
/// bypasses the Codec entirely (§4.7).
pub enum ControlAction {
    /// Peer confirmed full reassembly.
    AllReceived { envelope_id: String },
    /// Peer is asking for our missing-chunk bitmap (we are the receiver
    /// side for this message).
    BitmapRequested { envelope_id: String },
    /// Peer sent us a NACK bitmap (we are the sender side for this message).
    Nack {
        envelope_id: String,
        missing: std::collections::BTreeSet<u16>,
    },
    Unrecognized,
}

pub fn parse_control_chunk(chunk: &Chunk, total_hint: u16) -> ControlAction {
    if chunk.flags.is_nack() {
        // The NACK bitmap body doesn't carry the message id separately —
        // the chunk header's id_prefix identifies the message, same as a
        // data chunk.
        let missing = missing_from_bitmap(total_hint, &chunk.body);
        return ControlAction::Nack {
            envelope_id: String::new(),
            missing,
        };
    }
    if chunk.flags.is_ack() {
        let body = String::from_utf8_lossy(&chunk.body);
        if let Some(id) = body.strip_prefix(&format!("{CTRL_ALL_RECEIVED}|")) {
            return ControlAction::AllReceived {
                envelope_id: id.to_string(),
            };
        }
        if let Some(id) = body.strip_prefix(&format!("{CTRL_BITMAP_REQ}|")) {
            return ControlAction::BitmapRequested {
                envelope_id: id.to_string(),
            };
        }
    }
    ControlAction::Unrecognized
}

/// Owns the gateway's per-process reliability/reassembly/dedupe state.
/// Single-owner per §5 Shared-resource policy — driven from one task.
pub struct GatewayState {
    pub reassembler: Reassembler,
    pub reliability: ReliabilityEngine,
    pub dedupe: DedupeCache,
    nack_issuer: NackIssuer,
}

impl GatewayState {
    pub fn new(reliability: ReliabilityEngine, dedupe_ttl: std::time::Duration) -> Self {
        GatewayState {
            reassembler: Reassembler::default(),
            reliability,
            dedupe: DedupeCache::new(dedupe_ttl),
            nack_issuer: NackIssuer::new(DEFAULT_NACK_MAX_PER_SEQ, DEFAULT_NACK_INTERVAL),
        }
    }

    /// Feed one inbound data chunk. Returns the decoded envelope once
    /// reassembly completes.
    pub fn on_data_chunk(
        &mut self,
        sender: &str,
        chunk: &Chunk,
        now: Instant,
    ) -> Result<Option<Envelope>, TransportError> {
        match self.reassembler.insert(sender, chunk, now)? {
            Some(payload) => Ok(Some(codec::decode(&payload)?)),
            None => Ok(None),
        }
    }

    /// Reactive gap detection (§4.4): call after a data chunk lands in an
    /// incomplete bucket. Returns a rate-limited NACK chunk addressed back
    /// to `sender` when a gap is visible, or `None` if nothing is missing
    /// or the per-message rate limit suppresses it.
    pub fn maybe_reactive_nack(&mut self, sender: &str, chunk: &Chunk, now: std::time::Instant) -> Option<Chunk> {
        let (total, received) = self.reassembler.bucket_state(sender, chunk.id_prefix)?;
        let bitmap = self
            .nack_issuer
            .maybe_generate_nack(sender, chunk.id_prefix, total, &received, now)?;
        Some(Chunk::new(chunk.id_prefix, 1, total, ChunkFlags::NACK, bytes::Bytes::from(bitmap)))
    }

    /// Answer a peer's `bitmap_req` (§4.4): `all_received` if our bucket for
    /// this message is already gone (nothing missing), otherwise a NACK
    /// bitmap naming what's still outstanding. Rate-limited the same way as
    /// a reactive NACK, since spec.md groups both under one NACK issuance
    /// budget.
    pub fn answer_bitmap_request(
        &mut self,
        sender: &str,
        id_prefix: [u8; 8],
        envelope_id: &str,
        now: std::time::Instant,
    ) -> Option<Chunk> {
        let bucket = self.reassembler.bucket_state(sender, id_prefix);
        let nothing_missing = match &bucket {
            None => true,
            Some((total, received)) => received.len() == *total as usize,
        };
        if nothing_missing {
            let body = format!("{CTRL_ALL_RECEIVED}|{envelope_id}");
            return Some(Chunk::new(id_prefix, 1, 1, ChunkFlags::ACK, bytes::Bytes::from(body.into_bytes())));
        }
        let (total, received) = bucket.expect("nothing_missing handled the None case");
        let bitmap = self.nack_issuer.maybe_generate_nack(sender, id_prefix, total, &received, now)?;
        Some(Chunk::new(id_prefix, 1, total, ChunkFlags::NACK, bytes::Bytes::from(bitmap)))
    }

    /// Build the outbound chunk set for one envelope plus register it for
    /// chunk-level tracking (§4.1, §4.4).
    pub fn prepare_send(
        &mut self,
        envelope: &Envelope,
        id_prefix: [u8; 8],
        destination: &str,
        segment_size: u16,
        now: Instant,
    ) -> Result<Vec<Chunk>, TransportError> {
        let bytes = codec::encode(envelope)?;
        let chunks = split_into_chunks(id_prefix, &bytes, segment_size);
        Ok(self
            .reliability
            .submit(&envelope.id, id_prefix, destination, chunks, now))
    }

    pub fn on_ack(&mut self, correlation_id: &str) -> Option<PendingSend> {
        self.reliability.on_ack(correlation_id)
    }
}

/// Build the end-to-end `ack` envelope owed back to the sender once a
/// non-`ack` envelope has been delivered to the application (§4.4).
pub fn build_ack_for(delivered: &Envelope) -> Option<Envelope> {
    if delivered.ty.is_ack() {
        return None;
    }
    Some(Envelope::ack(delivered.id.clone()))
}

pub fn log_unexpected(envelope: &Envelope) {
    warn!(id = %envelope.id, ty = ?envelope.ty, "gateway received an envelope type it doesn't expect");
}

pub fn log_dedupe_hit(request_id: &str) {
    info!(request_id, "dedupe cache hit, skipping HTTP execution");
}

/// Check the dedupe cache before HTTP execution (§4.6). Returns the cached
/// response immediately on a hit.
pub fn check_dedupe(dedupe: &DedupeCache, request: &Envelope) -> DedupeOutcome {
    let outcome = dedupe.check_or_lease(&request.id);
    if matches!(outcome, DedupeOutcome::Cached(_)) {
        log_dedupe_hit(&request.id);
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn ack_routes_to_outbox_not_application() {
        let env = Envelope::ack("req-1");
        let action = route_envelope(env);
        assert!(matches!(action, GatewayAction::AckReceived { correlation_id } if correlation_id == "req-1"));
    }

    #[test]
    fn request_routes_to_execution() {
        let env = Envelope::request("list_entities", serde_json::json!({}));
        let action = route_envelope(env);
        assert!(matches!(action, GatewayAction::ExecuteRequest(_)));
    }

    #[test]
    fn response_at_gateway_is_unexpected() {
        let env = Envelope::response("req-1", serde_json::json!({}));
        let action = route_envelope(env);
        assert!(matches!(action, GatewayAction::Unexpected(_)));
    }

    #[test]
    fn parses_all_received_control() {
        let chunk = Chunk::new(
            [1; 8],
            1,
            1,
            ChunkFlags::ACK,
            Bytes::from(format!("{CTRL_ALL_RECEIVED}|abc-123").into_bytes()),
        );
        let action = parse_control_chunk(&chunk, 1);
        assert!(matches!(action, ControlAction::AllReceived { envelope_id } if envelope_id == "abc-123"));
    }

    #[test]
    fn parses_bitmap_req_control() {
        let chunk = Chunk::new(
            [1; 8],
            1,
            1,
            ChunkFlags::ACK,
            Bytes::from(format!("{CTRL_BITMAP_REQ}|abc-123").into_bytes()),
        );
        let action = parse_control_chunk(&chunk, 1);
        assert!(matches!(action, ControlAction::BitmapRequested { envelope_id } if envelope_id == "abc-123"));
    }

    #[test]
    fn parses_nack_bitmap() {
        let chunk = Chunk::new([1; 8], 1, 1, ChunkFlags::NACK, Bytes::from_static(&[0b0000_0100]));
        let action = parse_control_chunk(&chunk, 6);
        match action {
            ControlAction::Nack { missing, .. } => {
                assert_eq!(missing, [3].into_iter().collect());
            }
            _ => panic!("expected a NACK action"),
        }
    }

    #[test]
    fn ack_is_built_for_delivered_request() {
        let req = Envelope::request("test_echo", serde_json::json!({}));
        let ack = build_ack_for(&req).unwrap();
        assert!(ack.ty.is_ack());
        assert_eq!(ack.correlation_id.as_deref(), Some(req.id.as_str()));
    }

    #[test]
    fn no_ack_generated_for_an_ack() {
        let ack_envelope = Envelope::ack("req-1");
        assert!(build_ack_for(&ack_envelope).is_none());
    }
}
