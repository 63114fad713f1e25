//! # Dedupe Cache (gateway only)
//!
//! Suppresses duplicate request execution and serves cached responses for
//! retried requests (§4.6, §3 Dedupe Entry). Grounded on
//! `strata-control::state::{AppState, Inner}`'s `DashMap`-backed concurrent
//! map keyed by an id string — the same "cheap `Arc`-shared concurrent map,
//! infrequent writes, reads on every request" shape (§5 Shared-resource
//! policy: "readers-writer lock or equivalent").

use std::time::{Duration, Instant};

use atlas_common::envelope::Envelope;
use dashmap::DashMap;
use tracing::debug;

pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

#[derive(Clone)]
struct DedupeEntry {
    response: Envelope,
    created_at: Instant,
}

/// Outcome of checking/leasing a request id before execution.
pub enum DedupeOutcome {
    /// A cached response exists; return it directly, do not re-execute.
    Cached(Envelope),
    /// No cached response and no in-flight lease existed; the caller now
    /// holds the lease and must call [`DedupeCache::complete`] or
    /// [`DedupeCache::release`] when done.
    Leased,
    /// Another execution for this id is already in flight.
    InFlight,
}

/// Gateway-side cache suppressing duplicate `request` execution.
pub struct DedupeCache {
    entries: DashMap<String, DedupeEntry>,
    leases: DashMap<String, ()>,
    fingerprints: DashMap<String, String>,
    ttl: Duration,
}

impl Default for DedupeCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl DedupeCache {
    pub fn new(ttl: Duration) -> Self {
        DedupeCache {
            entries: DashMap::new(),
            leases: DashMap::new(),
            fingerprints: DashMap::new(),
            ttl,
        }
    }

    /// Check the cache by `envelope.id` (primary key) before executing a
    /// `request`. On a lazy-evicted miss, attempts to acquire the
    /// execution lease; concurrent duplicates observe [`DedupeOutcome::InFlight`]
    /// and should retry after a brief wait (§4.6).
    pub fn check_or_lease(&self, request_id: &str) -> DedupeOutcome {
        if let Some(entry) = self.entries.get(request_id) {
            if entry.created_at.elapsed() < self.ttl {
                return DedupeOutcome::Cached(entry.response.clone());
            }
            drop(entry);
            self.entries.remove(request_id);
        }

        match self.leases.entry(request_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => DedupeOutcome::InFlight,
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(());
                DedupeOutcome::Leased
            }
        }
    }

    /// Optional semantic-fingerprint check (§4.6): catches retries that
    /// (incorrectly) mutated `id` but kept the same command + canonicalized
    /// data. Returns the original request id's cached response if a
    /// fingerprint collision is found.
    pub fn check_fingerprint(&self, fingerprint: &str) -> Option<Envelope> {
        let original_id = self.fingerprints.get(fingerprint)?.clone();
        self.entries.get(&original_id).and_then(|e| {
            if e.created_at.elapsed() < self.ttl {
                Some(e.response.clone())
            } else {
                None
            }
        })
    }

    /// Store the response, release the lease, and register the semantic
    /// fingerprint for future lookups (§4.6).
    pub fn complete(&self, request_id: &str, fingerprint: Option<&str>, response: Envelope) {
        self.entries.insert(
            request_id.to_string(),
            DedupeEntry {
                response,
                created_at: Instant::now(),
            },
        );
        if let Some(fp) = fingerprint {
            self.fingerprints.insert(fp.to_string(), request_id.to_string());
        }
        self.leases.remove(request_id);
    }

    /// Release a lease without caching a response (e.g. execution failed
    /// and should be retried by a future duplicate rather than suppressed).
    pub fn release(&self, request_id: &str) {
        self.leases.remove(request_id);
    }

    /// Periodic sweep for TTL-expired entries, in addition to the lazy
    /// eviction `check_or_lease` performs on access (§4.6).
    pub fn sweep(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.created_at.elapsed() < self.ttl);
        let evicted = before - self.entries.len();
        if evicted > 0 {
            debug!(evicted, "dedupe cache sweep evicted expired entries");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_request_leases_second_sees_cached() {
        let cache = DedupeCache::default();
        let outcome = cache.check_or_lease("req-1");
        assert!(matches!(outcome, DedupeOutcome::Leased));

        let response = Envelope::response("req-1", serde_json::json!({"ok": true}));
        cache.complete("req-1", None, response.clone());

        let second = cache.check_or_lease("req-1");
        match second {
            DedupeOutcome::Cached(cached) => {
                assert_eq!(cached.correlation_id.as_deref(), Some("req-1"));
            }
            _ => panic!("expected a cached response"),
        }
    }

    #[test]
    fn concurrent_duplicate_sees_in_flight() {
        let cache = DedupeCache::default();
        assert!(matches!(cache.check_or_lease("req-2"), DedupeOutcome::Leased));
        assert!(matches!(cache.check_or_lease("req-2"), DedupeOutcome::InFlight));
    }

    #[test]
    fn released_lease_allows_retry() {
        let cache = DedupeCache::default();
        assert!(matches!(cache.check_or_lease("req-3"), DedupeOutcome::Leased));
        cache.release("req-3");
        assert!(matches!(cache.check_or_lease("req-3"), DedupeOutcome::Leased));
    }

    #[test]
    fn ttl_expiry_evicts_on_access() {
        let cache = DedupeCache::new(Duration::from_millis(1));
        cache.check_or_lease("req-4");
        cache.complete("req-4", None, Envelope::response("req-4", serde_json::json!({})));
        std::thread::sleep(Duration::from_millis(5));
        assert!(matches!(cache.check_or_lease("req-4"), DedupeOutcome::Leased));
    }

    #[test]
    fn fingerprint_catches_id_mutated_retry() {
        let cache = DedupeCache::default();
        cache.check_or_lease("req-5");
        cache.complete(
            "req-5",
            Some("list_entities:{}"),
            Envelope::response("req-5", serde_json::json!({"n": 3})),
        );
        let hit = cache.check_fingerprint("list_entities:{}");
        assert!(hit.is_some());
    }
}
