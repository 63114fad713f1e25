//! # Outbox / Spool
//!
//! Durable single-file JSON store mirroring every envelope awaiting
//! end-to-end ACK (§4.5, §6 Spool file). The atomic write-temp-fsync-rename
//! discipline is grounded on `summit-services::cache::write_chunk`'s
//! `File::create` → `write_all` → `sync_all()` → `rename` sequence. The
//! exponential-backoff retry schedule itself is grounded on
//! `strata-agent::control::run`'s reconnect loop (see [`crate::backoff`]).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use atlas_common::envelope::Envelope;
use chrono::{DateTime, Utc};
use rand::rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backoff::{next_delay, DEFAULT_BASE, DEFAULT_CAP};
use crate::error::{DeliveryFailed, SpoolError};

/// Durable mirror of a Pending Send (§3 Spool Record).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoolRecord {
    pub envelope: Envelope,
    pub destination: String,
    pub first_submitted: DateTime<Utc>,
    pub retry_count: u32,
    #[serde(default = "Utc::now")]
    pub next_attempt: DateTime<Utc>,
}

/// Durable JSON-on-disk queue of envelopes awaiting end-to-end ACK.
pub struct Outbox {
    path: PathBuf,
    records: HashMap<String, SpoolRecord>,
    retries: u32,
    base: std::time::Duration,
    cap: std::time::Duration,
}

impl Outbox {
    /// Open (or create) the spool at `path`. A corrupt file is quarantined
    /// (moved aside with a timestamp suffix); the outbox then starts empty.
    /// This is logged, not fatal (§4.5 File-format discipline).
    pub fn open(path: impl AsRef<Path>, retries: u32) -> Result<Self, SpoolError> {
        let path = path.as_ref().to_path_buf();
        let records = if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(text) => match serde_json::from_str::<Vec<SpoolRecord>>(&text) {
                    Ok(list) => list
                        .into_iter()
                        .map(|r| (r.envelope.id.clone(), r))
                        .collect(),
                    Err(source) => {
                        Self::quarantine(&path);
                        let err = SpoolError::Corrupt {
                            path: path.display().to_string(),
                            source,
                        };
                        warn!(error = %err, "spool file corrupt, quarantined");
                        HashMap::new()
                    }
                },
                Err(_) => HashMap::new(),
            }
        } else {
            HashMap::new()
        };

        let mut outbox = Outbox {
            path,
            records,
            retries,
            base: DEFAULT_BASE,
            cap: DEFAULT_CAP,
        };
        outbox.replay_on_startup();
        Ok(outbox)
    }

    fn quarantine(path: &Path) {
        let suffix = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let quarantined = path.with_extension(format!("corrupt.{suffix}"));
        let _ = std::fs::rename(path, quarantined);
    }

    /// Reset in-memory timers so every loaded record is immediately due,
    /// per §4.5 `replay_on_startup`.
    fn replay_on_startup(&mut self) {
        let now = Utc::now();
        for record in self.records.values_mut() {
            record.next_attempt = now;
        }
    }

    /// Append a Spool Record, persist (fsync via atomic rewrite), ready for
    /// hand-off to the Reliability Engine by the caller (§4.5 `submit`).
    pub fn submit(&mut self, envelope: Envelope, destination: String) -> Result<(), SpoolError> {
        let now = Utc::now();
        let record = SpoolRecord {
            envelope: envelope.clone(),
            destination,
            first_submitted: now,
            retry_count: 0,
            next_attempt: now,
        };
        self.records.insert(envelope.id.clone(), record);
        self.persist()
    }

    /// Remove the matching record on receipt of an `ack` (§4.5 `on_ack`).
    pub fn on_ack(&mut self, correlation_id: &str) -> Result<bool, SpoolError> {
        let removed = self.records.remove(correlation_id).is_some();
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Records whose `next_attempt <= now`, ready to reissue (§4.5 `flush`).
    pub fn due_records(&self, now: DateTime<Utc>) -> Vec<SpoolRecord> {
        self.records
            .values()
            .filter(|r| r.next_attempt <= now)
            .cloned()
            .collect()
    }

    /// Record that a due envelope was reissued: bump `retry_count` and
    /// reschedule `next_attempt`. Once `retries` is exhausted, the record
    /// is dropped and a [`DeliveryFailed`] event returned (§4.5, §7).
    pub fn mark_attempted(
        &mut self,
        envelope_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DeliveryFailed>, SpoolError> {
        let Some(record) = self.records.get_mut(envelope_id) else {
            return Ok(None);
        };
        record.retry_count += 1;

        if record.retry_count > self.retries {
            let destination = record.destination.clone();
            let attempts = record.retry_count;
            self.records.remove(envelope_id);
            self.persist()?;
            info!(envelope_id, attempts, "outbox retries exhausted, dropping record");
            return Ok(Some(DeliveryFailed {
                envelope_id: envelope_id.to_string(),
                destination,
                attempts,
            }));
        }

        let mut rng = rng();
        let delay = next_delay(record.retry_count, self.base, self.cap, &mut rng);
        record.next_attempt = now
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(0));
        self.persist()?;
        Ok(None)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, envelope_id: &str) -> bool {
        self.records.contains_key(envelope_id)
    }

    /// Entire store is rewritten atomically: write to a temp path in the
    /// same directory, fsync it, then rename over the real path (§4.5
    /// File-format discipline, §4.5 `submit`'s "append Spool Record, fsync").
    fn persist(&self) -> Result<(), SpoolError> {
        let list: Vec<&SpoolRecord> = self.records.values().collect();
        let json = serde_json::to_string_pretty(&list).expect("spool records always serialize");
        let tmp_path = self.path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&tmp_path).map_err(|source| SpoolError::Write {
                path: tmp_path.display().to_string(),
                source,
            })?;
            use std::io::Write;
            file.write_all(json.as_bytes()).map_err(|source| SpoolError::Write {
                path: tmp_path.display().to_string(),
                source,
            })?;
            file.sync_all().map_err(|source| SpoolError::Write {
                path: tmp_path.display().to_string(),
                source,
            })?;
        }
        std::fs::rename(&tmp_path, &self.path).map_err(|source| SpoolError::Write {
            path: self.path.display().to_string(),
            source,
        })
    }
}
