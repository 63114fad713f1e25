//! # Reassembler
//!
//! Per-(sender, message-id prefix) TTL buckets holding partial chunk sets
//! and delivering the assembled payload on completion (§4.3, §3 Reassembly
//! Bucket).
//!
//! Grounded on `strata-transport::receiver::FragmentAssembler`'s
//! `BTreeMap`-keyed partial-chain tracking and idempotent-insert idiom,
//! adapted from a single reassembly stream per sender to the
//! (sender, prefix) keying this protocol needs (§9 Design Notes: "pair
//! prefix with sender identity in all bucket keys").

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::warn;

use crate::error::TransportError;
use crate::wire::Chunk;

/// Base TTL granted to a bucket on first chunk arrival (§3 Reassembly Bucket).
pub const TTL_BASE: Duration = Duration::from_secs(120);
/// TTL is extended by this quantum on each fresh chunk.
pub const TTL_QUANTUM: Duration = Duration::from_secs(30);
/// TTL is never extended past this ceiling.
pub const TTL_CAP: Duration = Duration::from_secs(600);
/// Soft cap on live buckets before oldest-first eviction kicks in.
pub const DEFAULT_SOFT_LIMIT: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub sender: String,
    pub id_prefix: [u8; 8],
}

struct Bucket {
    total: u16,
    parts: BTreeMap<u16, Bytes>,
    first_seen: Instant,
    last_update: Instant,
    ttl: Duration,
    warned_inconsistent: bool,
}

impl Bucket {
    fn new(total: u16, now: Instant) -> Self {
        Bucket {
            total,
            parts: BTreeMap::new(),
            first_seen: now,
            last_update: now,
            ttl: TTL_BASE,
            warned_inconsistent: false,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_update) >= self.ttl
    }

    fn is_complete(&self) -> bool {
        self.parts.len() == self.total as usize
    }

    fn extend_ttl(&mut self) {
        self.ttl = (self.ttl + TTL_QUANTUM).min(TTL_CAP);
    }

    fn concat(&self) -> Bytes {
        let mut buf = BytesMut::new();
        for seq in 1..=self.total {
            if let Some(part) = self.parts.get(&seq) {
                buf.extend_from_slice(part);
            }
        }
        buf.freeze()
    }
}

/// Owns all live reassembly buckets. Per §5 Shared-resource policy, a
/// `Reassembler` is meant to be owned by a single reassembly task; external
/// callers only observe it via [`Reassembler::snapshot_len`].
pub struct Reassembler {
    buckets: std::collections::HashMap<BucketKey, Bucket>,
    soft_limit: usize,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(DEFAULT_SOFT_LIMIT)
    }
}

impl Reassembler {
    pub fn new(soft_limit: usize) -> Self {
        Reassembler {
            buckets: std::collections::HashMap::new(),
            soft_limit,
        }
    }

    /// Feed one data chunk into the assembler. Returns the assembled
    /// payload once every slot for its bucket has been filled; the bucket
    /// is destroyed immediately after.
    pub fn insert(
        &mut self,
        sender: &str,
        chunk: &Chunk,
        now: Instant,
    ) -> Result<Option<Bytes>, TransportError> {
        if chunk.total == 0 || chunk.sequence == 0 || chunk.sequence > chunk.total {
            return Err(TransportError::InvalidFrame(format!(
                "sequence {} out of range for total {}",
                chunk.sequence, chunk.total
            )));
        }

        let key = BucketKey {
            sender: sender.to_string(),
            id_prefix: chunk.id_prefix,
        };

        if !self.buckets.contains_key(&key) {
            self.evict_if_over_capacity(now);
            self.buckets.insert(key.clone(), Bucket::new(chunk.total, now));
        }

        let bucket = self.buckets.get_mut(&key).expect("just inserted");

        if bucket.total != chunk.total {
            if !bucket.warned_inconsistent {
                warn!(
                    sender,
                    expected_total = bucket.total,
                    got_total = chunk.total,
                    "chunk disagrees with bucket's expected total, dropping"
                );
                bucket.warned_inconsistent = true;
            }
            return Err(TransportError::InconsistentTotal(format!(
                "bucket expects total {}, chunk carries {}",
                bucket.total, chunk.total
            )));
        }

        match bucket.parts.get(&chunk.sequence) {
            Some(existing) if existing.len() != chunk.body.len() => {
                warn!(
                    sender,
                    sequence = chunk.sequence,
                    "late duplicate chunk with mismatched body length, ignoring"
                );
            }
            _ => {
                bucket.parts.insert(chunk.sequence, chunk.body.clone());
            }
        }

        bucket.last_update = now;
        bucket.extend_ttl();

        if bucket.is_complete() {
            let payload = bucket.concat();
            self.buckets.remove(&key);
            Ok(Some(payload))
        } else {
            Ok(None)
        }
    }

    /// Remove buckets whose TTL has elapsed. Expired buckets never emit a
    /// partial envelope — they're simply dropped. Meant to be driven by a
    /// background sweeper on a coarse (≥ 1 s) tick (§4.3).
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| !bucket.is_expired(now));
        before - self.buckets.len()
    }

    fn evict_if_over_capacity(&mut self, now: Instant) {
        if self.buckets.len() < self.soft_limit {
            return;
        }
        if let Some(oldest_key) = self
            .buckets
            .iter()
            .min_by_key(|(_, b)| b.last_update)
            .map(|(k, _)| k.clone())
        {
            let _ = now;
            self.buckets.remove(&oldest_key);
        }
    }

    /// Number of live buckets — the only externally observable state, per
    /// the single-owner-task contract in §5.
    pub fn snapshot_len(&self) -> usize {
        self.buckets.len()
    }

    /// `total` and the set of sequences received so far for one bucket, if
    /// it's still live. Used by the Dispatcher to answer a `bitmap_req` or
    /// to check for a reactive NACK (§4.4) — reading this is the one
    /// exception to buckets being opaque to external callers, since
    /// answering "what's missing" requires exactly this snapshot.
    pub fn bucket_state(&self, sender: &str, id_prefix: [u8; 8]) -> Option<(u16, BTreeSet<u16>)> {
        let key = BucketKey {
            sender: sender.to_string(),
            id_prefix,
        };
        self.buckets
            .get(&key)
            .map(|b| (b.total, b.parts.keys().copied().collect()))
    }
}
