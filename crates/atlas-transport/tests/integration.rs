//! # Integration tests: full chunk pipeline across a lossy link
//!
//! Drives the whole stack without a real radio: `codec::encode` →
//! `split_into_chunks` → `ReliabilityEngine::submit` → (simulated loss) →
//! `Reassembler::insert` / `NackIssuer` → `ReliabilityEngine::process_nack`
//! → resend → reassembly complete. No network I/O; loss is applied by
//! filtering which chunks get handed to the receiver, same shape as
//! `strata-transport::tests::integration::loss_recovery_via_nack_retransmit`.

use std::collections::BTreeSet;
use std::time::Instant;

use atlas_common::envelope::Envelope;
use atlas_common::ids::id_prefix;
use atlas_transport::codec;
use atlas_transport::reassembler::Reassembler;
use atlas_transport::reliability::{
    compute_missing_bitmap, missing_from_bitmap, split_into_chunks, NackIssuer, ReliabilityEngine,
    ReliabilityStrategy,
};

const SENDER: &str = "client-1";

/// §8 S2: a payload that encodes past 1180 bytes splits into 6 chunks at
/// segment size 210; dropping seq 3 once should produce NACK bitmap
/// `00000100`, a resend of just seq 3, and a completed reassembly.
#[test]
fn lossy_six_chunk_upload_recovers_via_nack() {
    let envelope = Envelope::request("upload", serde_json::json!({ "note": "large upload" }));
    let prefix = id_prefix(&envelope.id);

    // Synthetic 1180-byte payload standing in for a real `codec::encode`
    // output of that length (§8 S2) — the byte content itself is
    // irrelevant here, the chunk math and loss/recovery plumbing is what's
    // under test. A real compressed envelope's size isn't pinnable without
    // running the codec, so the varied byte pattern below fixes the
    // scenario's chunk count deterministically instead.
    let payload: Vec<u8> = (0..1180u32).map(|i| (i % 251) as u8).collect();

    let mut sender = ReliabilityEngine::new(ReliabilityStrategy::Window).unwrap();
    let chunks = split_into_chunks(prefix, &payload, 210);
    assert_eq!(chunks.len(), 6, "1180 bytes at segment 210 should split into 6 chunks");

    let now = Instant::now();
    let outbound = sender.submit(&envelope.id, prefix, "gateway-1", chunks, now);

    let mut reassembler = Reassembler::default();
    let mut first_complete = None;
    for chunk in &outbound {
        if chunk.sequence == 3 {
            continue; // simulated loss of seq 3 on the first pass
        }
        first_complete = reassembler.insert(SENDER, chunk, now).unwrap();
    }
    assert!(first_complete.is_none(), "reassembly must stall with seq 3 missing");

    let (total, received) = reassembler.bucket_state(SENDER, prefix).unwrap();
    assert_eq!(total, 6);
    let bitmap = compute_missing_bitmap(total, &received);
    assert_eq!(bitmap, vec![0b0000_0100], "bit 2 (seq 3) should be the only gap");

    let mut nack_issuer = NackIssuer::new(3, std::time::Duration::from_millis(0));
    let reissued = nack_issuer
        .maybe_generate_nack(SENDER, prefix, total, &received, now)
        .expect("a real gap should always produce a NACK on first ask");
    assert_eq!(reissued, bitmap);

    let missing = missing_from_bitmap(total, &bitmap);
    assert_eq!(missing, BTreeSet::from([3]));

    let resend = sender.process_nack(&envelope.id, &missing, 3);
    assert_eq!(resend.len(), 1);
    assert_eq!(resend[0].sequence, 3);

    let completed = reassembler.insert(SENDER, &resend[0], now).unwrap();
    let reassembled = completed.expect("reassembly should complete once seq 3 arrives");
    assert_eq!(reassembled.as_ref(), payload.as_slice());

    sender.process_all_received(&envelope.id);
    assert!(sender.is_pending(&envelope.id), "pending send lingers until the end-to-end ack arrives");
    let freed = sender.on_ack(&envelope.id);
    assert!(freed.is_some());
    assert!(!sender.is_pending(&envelope.id));
}

/// A full envelope through the real codec, single-shot (no loss): sanity
/// check that the pipeline this test file drives piecewise also works
/// end-to-end through `codec::encode`/`codec::decode`.
#[test]
fn small_envelope_round_trips_through_codec_and_reassembly() {
    let envelope = Envelope::response("req-1", serde_json::json!({ "ok": true }));
    let encoded = codec::encode(&envelope).unwrap();
    let prefix = id_prefix(&envelope.id);

    let mut sender = ReliabilityEngine::new(ReliabilityStrategy::Simple).unwrap();
    let chunks = split_into_chunks(prefix, &encoded, 210);
    let now = Instant::now();
    let outbound = sender.submit(&envelope.id, prefix, "client-1", chunks, now);

    let mut reassembler = Reassembler::default();
    let mut delivered = None;
    for chunk in &outbound {
        delivered = reassembler.insert("gateway-1", chunk, now).unwrap();
    }
    let payload = delivered.expect("single-chunk envelope should reassemble immediately");
    let decoded: Envelope = codec::decode(&payload).unwrap();
    assert_eq!(decoded.id, envelope.id);
    assert_eq!(decoded.data, envelope.data);
}

#[test]
fn single_chunk_envelope_has_no_progress_timer() {
    let envelope = Envelope::ack("req-1");
    let encoded = codec::encode(&envelope).unwrap();
    let prefix = id_prefix(&envelope.id);

    let mut sender = ReliabilityEngine::new(ReliabilityStrategy::Window).unwrap();
    let chunks = split_into_chunks(prefix, &encoded, 210);
    assert_eq!(chunks.len(), 1);

    let now = Instant::now();
    sender.submit(&envelope.id, prefix, "gateway-1", chunks, now);
    assert!(sender.check_timeouts(now + std::time::Duration::from_secs(200)).is_empty());
}
