//! # Reliability Engine
//!
//! Windowed selective-repeat chunk recovery plus the progress-resetting
//! timeout that drives bitmap requests (§4.4). Grounded on
//! `strata-transport::arq::{LossDetector, RetransmitTracker}` for the
//! rate-limited NACK issuance and per-sequence retry budget, and on
//! `strata-transport::sender::Sender`/`receiver::Receiver` for the
//! split/resend and ACK/NACK processing shape.
//!
//! End-to-end application ACK (§4.4 "End-to-end ACK") is a separate,
//! higher-level concern owned by the Dispatcher/Outbox — this module only
//! tracks chunk-level delivery for a single outbound envelope.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::debug;

use crate::error::TransportError;
use crate::wire::{Chunk, ChunkFlags};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(90);
pub const DEFAULT_ABSOLUTE_CAP: Duration = Duration::from_secs(150);
pub const DEFAULT_NACK_MAX_PER_SEQ: u8 = 3;
pub const DEFAULT_NACK_INTERVAL: Duration = Duration::from_millis(1000);

/// Control-string prefixes carried in the body of control chunks (§6).
pub const CTRL_ALL_RECEIVED: &str = "all_received";
pub const CTRL_BITMAP_REQ: &str = "bitmap_req";

/// Runtime-selectable loss-recovery strategy (§4.4). Selection is
/// per-process; both endpoints must agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReliabilityStrategy {
    /// No recovery; single-shot send, relies entirely on the end-to-end ACK.
    Simple,
    /// Staged completion markers (periodic `all_received`-style acks
    /// mid-stream). Parses and round-trips through config, but
    /// `ReliabilityEngine::new` rejects it until its mid-stream ack cadence
    /// is specified — same deferral as `WindowFec`.
    Stage,
    /// Windowed selective repeat via NACK bitmaps. Default.
    Window,
    /// Reserved for forward error correction; same wire format, augmented
    /// with parity chunks. Per SPEC_FULL §9, not operational.
    WindowFec,
}

impl ReliabilityStrategy {
    pub fn from_config_str(s: &str) -> Option<Self> {
        match s {
            "simple" => Some(Self::Simple),
            "stage" => Some(Self::Stage),
            "window" => Some(Self::Window),
            "window_fec" => Some(Self::WindowFec),
            _ => None,
        }
    }
}

/// Split an encoded envelope into 1-based sequence chunks of at most
/// `segment_size` bytes each (§4.4: `N = ceil(payload_len / SEGMENT_SIZE)`).
pub fn split_into_chunks(id_prefix: [u8; 8], payload: &[u8], segment_size: u16) -> Vec<Chunk> {
    if payload.is_empty() {
        return vec![Chunk::new(id_prefix, 1, 1, ChunkFlags::NONE, Bytes::new())];
    }
    let segment_size = segment_size.max(1) as usize;
    let total = payload.len().div_ceil(segment_size) as u16;
    payload
        .chunks(segment_size)
        .enumerate()
        .map(|(i, body)| {
            Chunk::new(
                id_prefix,
                (i + 1) as u16,
                total,
                ChunkFlags::NONE,
                Bytes::copy_from_slice(body),
            )
        })
        .collect()
}

/// Compute the NACK bitmap for a total/received pair. Bit *i* set iff
/// sequence `i + 1` is missing from `received` (§6, little-endian within
/// byte — pinned in SPEC_FULL §9 Open Question resolutions).
pub fn compute_missing_bitmap(total: u16, received: &BTreeSet<u16>) -> Vec<u8> {
    let nbytes = (total as usize).div_ceil(8);
    let mut bits = vec![0u8; nbytes];
    for seq in 1..=total {
        if !received.contains(&seq) {
            let i = (seq - 1) as usize;
            bits[i / 8] |= 1 << (i % 8);
        }
    }
    bits
}

/// Inverse of [`compute_missing_bitmap`]: the set of missing sequences
/// encoded by `bitmap` for a given `total`.
pub fn missing_from_bitmap(total: u16, bitmap: &[u8]) -> BTreeSet<u16> {
    let mut missing = BTreeSet::new();
    for i in 0..total as usize {
        let byte = match bitmap.get(i / 8) {
            Some(b) => *b,
            None => break,
        };
        if byte & (1 << (i % 8)) != 0 {
            missing.insert((i + 1) as u16);
        }
    }
    missing
}

/// Per-message NACK issuance state, rate-limited per §4.4: at most
/// `nack_max_per_seq` NACKs per missing sequence, at most one NACK frame
/// per `nack_interval`.
#[derive(Default)]
struct NackIssuanceState {
    counts: HashMap<u16, u8>,
    last_nack_at: Option<Instant>,
}

/// Receiver-side NACK rate limiter. One instance covers all in-flight
/// inbound messages; keyed by the sender's (sender, prefix) bucket key to
/// match the Reassembler (§9: pair prefix with sender identity).
#[derive(Default)]
pub struct NackIssuer {
    state: HashMap<(String, [u8; 8]), NackIssuanceState>,
    max_per_seq: u8,
    interval: Duration,
}

impl NackIssuer {
    pub fn new(max_per_seq: u8, interval: Duration) -> Self {
        NackIssuer {
            state: HashMap::new(),
            max_per_seq,
            interval,
        }
    }

    /// Gap detection is reactive only (§4.4): call this when a newer
    /// sequence arrives before older ones, or in response to a
    /// `bitmap_req`. Returns the bitmap to send, or `None` if rate-limited
    /// or nothing is missing.
    pub fn maybe_generate_nack(
        &mut self,
        sender: &str,
        prefix: [u8; 8],
        total: u16,
        received: &BTreeSet<u16>,
        now: Instant,
    ) -> Option<Vec<u8>> {
        let key = (sender.to_string(), prefix);
        let state = self.state.entry(key).or_default();

        if let Some(last) = state.last_nack_at {
            if now.duration_since(last) < self.interval {
                return None;
            }
        }

        let raw_missing = compute_missing_bitmap(total, received);
        let mut eligible = BTreeSet::new();
        for seq in missing_from_bitmap(total, &raw_missing) {
            let count = state.counts.entry(seq).or_insert(0);
            if *count < self.max_per_seq {
                eligible.insert(seq);
            }
        }

        if eligible.is_empty() {
            return None;
        }

        for seq in &eligible {
            *state.counts.get_mut(seq).expect("just touched") += 1;
        }
        state.last_nack_at = Some(now);

        // Re-render a bitmap covering only the rate-limit-eligible gaps:
        // treat every non-eligible sequence as "received" for encoding
        // purposes so exhausted sequences stop being named (§8 property 5),
        // while sequences we are allowed to name still satisfy the raw
        // correctness rule (§8 property 4) relative to `received`.
        let mut adjusted_received = received.clone();
        for seq in 1..=total {
            if !eligible.contains(&seq) {
                adjusted_received.insert(seq);
            }
        }
        Some(compute_missing_bitmap(total, &adjusted_received))
    }
}

struct ProgressTimer {
    started_at: Instant,
    last_progress: Instant,
    base: Duration,
    absolute_cap: Duration,
}

impl ProgressTimer {
    fn new(now: Instant, base: Duration, absolute_cap: Duration) -> Self {
        ProgressTimer {
            started_at: now,
            last_progress: now,
            base,
            absolute_cap,
        }
    }

    fn on_progress(&mut self, now: Instant) {
        self.last_progress = now;
    }

    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_progress) >= self.base
            || now.duration_since(self.started_at) >= self.absolute_cap
    }
}

/// Tracked per outbound envelope awaiting chunk-level completion (§3
/// Pending Send).
pub struct PendingSend {
    pub envelope_id: String,
    pub id_prefix: [u8; 8],
    pub destination: String,
    pub chunks: Vec<Chunk>,
    pub retry_counts: HashMap<u16, u8>,
    timer: Option<ProgressTimer>,
    bitmap_req_sent: bool,
}

impl PendingSend {
    pub fn total(&self) -> u16 {
        self.chunks.len() as u16
    }
}

/// Sender-side engine: splits envelopes into chunks, tracks pending sends,
/// and resends on NACK. One engine instance per process role.
pub struct ReliabilityEngine {
    strategy: ReliabilityStrategy,
    timeout: Duration,
    absolute_cap: Duration,
    pending: HashMap<String, PendingSend>,
}

impl ReliabilityEngine {
    pub fn new(strategy: ReliabilityStrategy) -> Result<Self, TransportError> {
        if strategy == ReliabilityStrategy::WindowFec {
            return Err(TransportError::Unimplemented("window_fec".to_string()));
        }
        if strategy == ReliabilityStrategy::Stage {
            return Err(TransportError::Unimplemented("stage".to_string()));
        }
        Ok(ReliabilityEngine {
            strategy,
            timeout: DEFAULT_TIMEOUT,
            absolute_cap: DEFAULT_ABSOLUTE_CAP,
            pending: HashMap::new(),
        })
    }

    pub fn with_timeouts(mut self, timeout: Duration, absolute_cap: Duration) -> Self {
        self.timeout = timeout;
        self.absolute_cap = absolute_cap;
        self
    }

    pub fn strategy(&self) -> ReliabilityStrategy {
        self.strategy
    }

    /// Register a newly submitted envelope's chunks for chunk-level
    /// tracking. Returns the chunks to transmit, in ascending sequence
    /// order (§5 Ordering guarantees: first send is always in-order).
    pub fn submit(
        &mut self,
        envelope_id: &str,
        id_prefix: [u8; 8],
        destination: &str,
        chunks: Vec<Chunk>,
        now: Instant,
    ) -> Vec<Chunk> {
        let n = chunks.len();
        let timer = if n > 1 && self.strategy != ReliabilityStrategy::Simple {
            Some(ProgressTimer::new(now, self.timeout, self.absolute_cap))
        } else {
            None
        };
        let out = chunks.clone();
        self.pending.insert(
            envelope_id.to_string(),
            PendingSend {
                envelope_id: envelope_id.to_string(),
                id_prefix,
                destination: destination.to_string(),
                chunks,
                retry_counts: HashMap::new(),
                timer,
                bitmap_req_sent: false,
            },
        );
        out
    }

    /// Record that some inbound activity (any chunk or control frame) was
    /// observed from the peer for this message, resetting its
    /// progress-resetting timer (§4.4, §5 Cancellation and timeouts).
    pub fn note_progress(&mut self, envelope_id: &str, now: Instant) {
        if let Some(pending) = self.pending.get_mut(envelope_id) {
            if let Some(timer) = pending.timer.as_mut() {
                timer.on_progress(now);
            }
        }
    }

    /// Check all pending sends for expired progress timers. For each one
    /// that hasn't already issued a `bitmap_req`, returns `(destination,
    /// chunk)` to send. Single-chunk envelopes (N == 1) never appear here —
    /// they rely solely on the end-to-end ACK (§4.4).
    pub fn check_timeouts(&mut self, now: Instant) -> Vec<(String, Chunk)> {
        let mut out = Vec::new();
        for pending in self.pending.values_mut() {
            let Some(timer) = pending.timer.as_ref() else {
                continue;
            };
            if pending.bitmap_req_sent || !timer.is_expired(now) {
                continue;
            }
            let body = format!("{CTRL_BITMAP_REQ}|{}", pending.envelope_id);
            let chunk = Chunk::new(
                pending.id_prefix,
                1,
                1,
                ChunkFlags::ACK,
                Bytes::from(body.into_bytes()),
            );
            pending.bitmap_req_sent = true;
            out.push((pending.destination.clone(), chunk));
        }
        out
    }

    /// Process a NACK bitmap from the peer: returns chunks to resend, in
    /// ascending sequence order, respecting each sequence's retry budget.
    pub fn process_nack(
        &mut self,
        envelope_id: &str,
        missing: &BTreeSet<u16>,
        max_retries_per_chunk: u8,
    ) -> Vec<Chunk> {
        let Some(pending) = self.pending.get_mut(envelope_id) else {
            return Vec::new();
        };
        pending.bitmap_req_sent = false;
        let mut out = Vec::new();
        for &seq in missing {
            let count = pending.retry_counts.entry(seq).or_insert(0);
            if *count >= max_retries_per_chunk {
                continue;
            }
            if let Some(chunk) = pending.chunks.get((seq - 1) as usize) {
                *count += 1;
                out.push(chunk.clone());
            }
        }
        out
    }

    /// The peer confirmed full reassembly (`all_received`). Chunk-level
    /// work for this envelope is done; the Pending Send lingers only as a
    /// record until the end-to-end `ack` arrives and the Dispatcher/Outbox
    /// remove it via [`Self::on_ack`].
    pub fn process_all_received(&mut self, envelope_id: &str) {
        if let Some(pending) = self.pending.get_mut(envelope_id) {
            pending.timer = None;
            debug!(envelope_id, "chunk-level reassembly confirmed by peer");
        }
    }

    /// Remove the Pending Send on receipt of the end-to-end `ack` (§4.4).
    pub fn on_ack(&mut self, envelope_id: &str) -> Option<PendingSend> {
        self.pending.remove(envelope_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, envelope_id: &str) -> bool {
        self.pending.contains_key(envelope_id)
    }

    /// Recover the full envelope id for a Pending Send from its 8-byte
    /// chunk-header prefix. NACK chunks only carry the prefix, not the
    /// full id, so the Dispatcher needs this to route a NACK bitmap back
    /// to the right Pending Send.
    pub fn envelope_id_for_prefix(&self, prefix: [u8; 8]) -> Option<&str> {
        self.pending
            .values()
            .find(|p| p.id_prefix == prefix)
            .map(|p| p.envelope_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_respects_segment_size() {
        let payload = vec![0u8; 1180];
        let chunks = split_into_chunks([1; 8], &payload, 210);
        assert_eq!(chunks.len(), 6);
        assert_eq!(chunks[0].total, 6);
        assert_eq!(chunks[5].body.len(), 1180 - 5 * 210);
    }

    #[test]
    fn single_byte_payload_is_one_chunk() {
        let chunks = split_into_chunks([1; 8], b"x", 210);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].sequence, 1);
        assert_eq!(chunks[0].total, 1);
    }

    #[test]
    fn bitmap_matches_missing_sequences() {
        let received: BTreeSet<u16> = [1, 2, 4, 5, 6].into_iter().collect();
        let bitmap = compute_missing_bitmap(6, &received);
        // only seq 3 missing -> bit index 2 set -> byte 0 = 0b00000100
        assert_eq!(bitmap, vec![0b0000_0100]);
        assert_eq!(missing_from_bitmap(6, &bitmap), [3].into_iter().collect());
    }

    #[test]
    fn bitmap_roundtrip_arbitrary() {
        let total = 20u16;
        let received: BTreeSet<u16> = [1, 3, 5, 7, 9, 11, 13].into_iter().collect();
        let bitmap = compute_missing_bitmap(total, &received);
        let missing = missing_from_bitmap(total, &bitmap);
        for seq in 1..=total {
            assert_eq!(!received.contains(&seq), missing.contains(&seq));
        }
    }

    #[test]
    fn nack_rate_limited_per_interval() {
        let mut issuer = NackIssuer::new(3, Duration::from_secs(1));
        let now = Instant::now();
        let received: BTreeSet<u16> = [1, 2].into_iter().collect();
        let first = issuer.maybe_generate_nack("nodeA", [1; 8], 3, &received, now);
        assert!(first.is_some());
        let second = issuer.maybe_generate_nack("nodeA", [1; 8], 3, &received, now);
        assert!(second.is_none(), "second NACK within interval must be suppressed");
        let later = now + Duration::from_secs(2);
        let third = issuer.maybe_generate_nack("nodeA", [1; 8], 3, &received, later);
        assert!(third.is_some());
    }

    #[test]
    fn nack_per_sequence_budget_exhausts() {
        let mut issuer = NackIssuer::new(2, Duration::from_millis(1));
        let mut now = Instant::now();
        let received: BTreeSet<u16> = BTreeSet::new();
        let mut emissions = 0;
        for _ in 0..5 {
            if issuer
                .maybe_generate_nack("nodeA", [1; 8], 1, &received, now)
                .is_some()
            {
                emissions += 1;
            }
            now += Duration::from_millis(5);
        }
        assert_eq!(emissions, 2, "sequence 1 should be named at most twice");
    }

    #[test]
    fn engine_rejects_window_fec() {
        let err = ReliabilityEngine::new(ReliabilityStrategy::WindowFec).unwrap_err();
        assert!(matches!(err, TransportError::Unimplemented(_)));
    }

    #[test]
    fn engine_rejects_stage() {
        let err = ReliabilityEngine::new(ReliabilityStrategy::Stage).unwrap_err();
        assert!(matches!(err, TransportError::Unimplemented(_)));
    }

    #[test]
    fn single_chunk_envelope_has_no_timer() {
        let mut engine = ReliabilityEngine::new(ReliabilityStrategy::Window).unwrap();
        let chunks = split_into_chunks([1; 8], b"x", 210);
        let now = Instant::now();
        engine.submit("id-1", [1; 8], "nodeA", chunks, now);
        let timeouts = engine.check_timeouts(now + DEFAULT_ABSOLUTE_CAP * 2);
        assert!(timeouts.is_empty());
    }

    #[test]
    fn multi_chunk_timeout_issues_bitmap_req_once() {
        let mut engine = ReliabilityEngine::new(ReliabilityStrategy::Window).unwrap();
        let payload = vec![0u8; 1000];
        let chunks = split_into_chunks([1; 8], &payload, 210);
        let now = Instant::now();
        engine.submit("id-2", [1; 8], "nodeA", chunks, now);
        let later = now + DEFAULT_TIMEOUT + Duration::from_secs(1);
        let first = engine.check_timeouts(later);
        assert_eq!(first.len(), 1);
        let second = engine.check_timeouts(later);
        assert!(second.is_empty(), "bitmap_req should only be issued once until a NACK resets it");
    }

    #[test]
    fn process_nack_resends_only_missing_in_order() {
        let mut engine = ReliabilityEngine::new(ReliabilityStrategy::Window).unwrap();
        let payload = vec![0u8; 1000];
        let chunks = split_into_chunks([1; 8], &payload, 210);
        let now = Instant::now();
        engine.submit("id-3", [1; 8], "nodeA", chunks, now);
        let missing: BTreeSet<u16> = [2, 4].into_iter().collect();
        let resent = engine.process_nack("id-3", &missing, 3);
        assert_eq!(resent.len(), 2);
        assert_eq!(resent[0].sequence, 2);
        assert_eq!(resent[1].sequence, 4);
    }

    #[test]
    fn process_nack_respects_retry_budget() {
        let mut engine = ReliabilityEngine::new(ReliabilityStrategy::Window).unwrap();
        let payload = vec![0u8; 1000];
        let chunks = split_into_chunks([1; 8], &payload, 210);
        let now = Instant::now();
        engine.submit("id-4", [1; 8], "nodeA", chunks, now);
        let missing: BTreeSet<u16> = [2].into_iter().collect();
        for _ in 0..2 {
            let resent = engine.process_nack("id-4", &missing, 2);
            assert_eq!(resent.len(), 1);
        }
        let resent = engine.process_nack("id-4", &missing, 2);
        assert!(resent.is_empty(), "retry budget for sequence 2 is exhausted");
    }

    #[test]
    fn ack_removes_pending_send() {
        let mut engine = ReliabilityEngine::new(ReliabilityStrategy::Window).unwrap();
        let chunks = split_into_chunks([1; 8], b"hello", 210);
        let now = Instant::now();
        engine.submit("id-5", [1; 8], "nodeA", chunks, now);
        assert!(engine.is_pending("id-5"));
        let removed = engine.on_ack("id-5");
        assert!(removed.is_some());
        assert!(!engine.is_pending("id-5"));
    }
}
