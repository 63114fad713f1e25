//! # Dispatcher (client role, §4.7 mirrored for the originating side)
//!
//! The client only ever originates `request` envelopes and receives
//! `response`/`error`/`ack` back; a `request` arriving here would mean the
//! peer roles are reversed. Kept as pure routing functions plus a
//! single-owner `ClientState`, same split as the gateway's dispatcher
//! (grounded on `strata-agent::control::run`'s dispatch-by-type idiom).

use std::time::Instant;

use atlas_common::envelope::{Envelope, EnvelopeType};
use atlas_transport::reassembler::Reassembler;
use atlas_transport::reliability::{
    missing_from_bitmap, split_into_chunks, NackIssuer, PendingSend, ReliabilityEngine,
    DEFAULT_NACK_INTERVAL, DEFAULT_NACK_MAX_PER_SEQ, CTRL_ALL_RECEIVED, CTRL_BITMAP_REQ,
};
use atlas_transport::wire::{Chunk, ChunkFlags};
use atlas_transport::{codec, TransportError};
use tokio::sync::oneshot;
use tracing::warn;

/// What a decoded inbound envelope implies for the client.
pub enum ClientAction {
    /// End-to-end `ack` for something we sent; remove the Pending Send /
    /// Spool Record.
    AckReceived { correlation_id: String },
    /// The answer to a request we're waiting on.
    Delivered(Envelope),
    /// A `request` arriving at a client implies the peer thinks we're the
    /// gateway.
    Unexpected(Envelope),
}

pub fn route_envelope(envelope: Envelope) -> ClientAction {
    match envelope.ty {
        EnvelopeType::Ack => ClientAction::AckReceived {
            correlation_id: envelope.correlation_id.clone().unwrap_or_default(),
        },
        EnvelopeType::Response | EnvelopeType::Error => ClientAction::Delivered(envelope),
        EnvelopeType::Request => ClientAction::Unexpected(envelope),
    }
}

/// Owns the client's reassembly/reliability state plus the rendezvous
/// points for requests awaiting a `response`/`error` (§5 Cancellation and
/// timeouts: the waiter is removed on timeout, the Spool Record is not).
pub struct ClientState {
    pub reassembler: Reassembler,
    pub reliability: ReliabilityEngine,
    waiters: std::collections::HashMap<String, oneshot::Sender<Envelope>>,
    nack_issuer: NackIssuer,
}

impl ClientState {
    pub fn new(reliability: ReliabilityEngine) -> Self {
        ClientState {
            reassembler: Reassembler::default(),
            reliability,
            waiters: std::collections::HashMap::new(),
            nack_issuer: NackIssuer::new(DEFAULT_NACK_MAX_PER_SEQ, DEFAULT_NACK_INTERVAL),
        }
    }

    /// Register interest in the eventual `response`/`error` for
    /// `request_id`.
    pub fn await_response(&mut self, request_id: &str) -> oneshot::Receiver<Envelope> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(request_id.to_string(), tx);
        rx
    }

    /// Drop a waiter without having delivered a response, e.g. once its
    /// caller-side timeout fires.
    pub fn cancel_wait(&mut self, request_id: &str) {
        self.waiters.remove(request_id);
    }

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

    /// Reactive gap detection (§4.4), mirrored from the gateway's
    /// dispatcher: call after a data chunk lands in an incomplete bucket.
    pub fn maybe_reactive_nack(&mut self, sender: &str, chunk: &Chunk, now: std::time::Instant) -> Option<Chunk> {
        let (total, received) = self.reassembler.bucket_state(sender, chunk.id_prefix)?;
        let bitmap = self
            .nack_issuer
            .maybe_generate_nack(sender, chunk.id_prefix, total, &received, now)?;
        Some(Chunk::new(chunk.id_prefix, 1, total, ChunkFlags::NACK, bytes::Bytes::from(bitmap)))
    }

    /// Answer a peer's `bitmap_req` (§4.4), mirrored from the gateway's
    /// dispatcher.
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

    /// Hand a delivered `response`/`error` to whoever is waiting on its
    /// `correlation_id`, if anyone still is.
    pub fn deliver(&mut self, envelope: Envelope) {
        let Some(correlation_id) = envelope.correlation_id.clone() else {
            warn!(id = %envelope.id, "response/error envelope missing correlation_id, dropping");
            return;
        };
        if let Some(waiter) = self.waiters.remove(&correlation_id) {
            let _ = waiter.send(envelope);
        } else {
            warn!(correlation_id, "no waiter registered for delivered envelope, dropping");
        }
    }
}

/// What to do with one inbound control chunk (ACK/NACK flag set), mirrored
/// from the gateway's dispatcher (§4.7: control chunks bypass the Codec on
/// both ends symmetrically).
pub enum ControlAction {
    AllReceived { envelope_id: String },
    BitmapRequested { envelope_id: String },
    Nack {
        envelope_id: String,
        missing: std::collections::BTreeSet<u16>,
    },
    Unrecognized,
}

pub fn parse_control_chunk(chunk: &Chunk, total_hint: u16) -> ControlAction {
    if chunk.flags.is_nack() {
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

pub fn build_ack_for(delivered: &Envelope) -> Option<Envelope> {
    if delivered.ty.is_ack() {
        return None;
    }
    Some(Envelope::ack(delivered.id.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_routes_to_pending_send_removal() {
        let env = Envelope::ack("req-1");
        let action = route_envelope(env);
        assert!(matches!(action, ClientAction::AckReceived { correlation_id } if correlation_id == "req-1"));
    }

    #[test]
    fn response_routes_to_delivery() {
        let env = Envelope::response("req-1", serde_json::json!({}));
        let action = route_envelope(env);
        assert!(matches!(action, ClientAction::Delivered(_)));
    }

    #[test]
    fn request_at_client_is_unexpected() {
        let env = Envelope::request("list_entities", serde_json::json!({}));
        let action = route_envelope(env);
        assert!(matches!(action, ClientAction::Unexpected(_)));
    }

    #[tokio::test]
    async fn deliver_resolves_matching_waiter() {
        let engine = ReliabilityEngine::new(atlas_transport::reliability::ReliabilityStrategy::Window).unwrap();
        let mut state = ClientState::new(engine);
        let rx = state.await_response("req-1");
        let response = Envelope::response("req-1", serde_json::json!({"ok": true}));
        state.deliver(response);
        let got = rx.await.unwrap();
        assert_eq!(got.correlation_id.as_deref(), Some("req-1"));
    }

    #[test]
    fn ack_is_built_for_a_response() {
        let response = Envelope::response("req-1", serde_json::json!({}));
        let ack = build_ack_for(&response).unwrap();
        assert!(ack.ty.is_ack());
    }

    #[test]
    fn parses_all_received_control() {
        let chunk = Chunk::new(
            [1; 8],
            1,
            1,
            ChunkFlags::ACK,
            bytes::Bytes::from(format!("{CTRL_ALL_RECEIVED}|resp-123").into_bytes()),
        );
        let action = parse_control_chunk(&chunk, 1);
        assert!(matches!(action, ControlAction::AllReceived { envelope_id } if envelope_id == "resp-123"));
    }

    #[test]
    fn parses_nack_bitmap() {
        let chunk = Chunk::new([1; 8], 1, 1, ChunkFlags::NACK, bytes::Bytes::from_static(&[0b0000_0100]));
        let action = parse_control_chunk(&chunk, 6);
        match action {
            ControlAction::Nack { missing, .. } => assert_eq!(missing, [3].into_iter().collect()),
            _ => panic!("expected a NACK action"),
        }
    }

    #[test]
    fn reactive_nack_answers_a_gap() {
        let engine = ReliabilityEngine::new(atlas_transport::reliability::ReliabilityStrategy::Window).unwrap();
        let mut state = ClientState::new(engine);
        let now = std::time::Instant::now();
        let c1 = Chunk::new([9; 8], 1, 3, ChunkFlags::NONE, bytes::Bytes::from_static(b"a"));
        let c3 = Chunk::new([9; 8], 3, 3, ChunkFlags::NONE, bytes::Bytes::from_static(b"c"));
        assert!(state.on_data_chunk("gateway", &c1, now).unwrap().is_none());
        assert!(state.on_data_chunk("gateway", &c3, now).unwrap().is_none());
        let nack = state.maybe_reactive_nack("gateway", &c3, now).unwrap();
        assert!(nack.flags.is_nack());
    }
}
