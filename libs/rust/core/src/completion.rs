//! Per-experiment completion barrier.
//!
//! One `CompletionRecord` per fingerprint, stored in a sharded mutex map so
//! unrelated experiments never contend on one lock. `observe` is the only
//! mutation path; the check-and-fire is atomic under the record's shard lock,
//! so the barrier fires at most once per fingerprint no matter how events
//! interleave.

use crate::metrics;
use crate::types::{LifecycleEvent, LifecycleStatus};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tracing::{debug, info};

const SHARD_COUNT: usize = 16;

#[derive(Debug, Clone)]
pub struct CompletionRecord {
    pub expected_producers: BTreeSet<String>,
    pub reported_succeeded: BTreeMap<String, LifecycleEvent>,
    /// Producers that reported FAILED at least once. Observability only: a
    /// failure never blocks the remaining producers from completing.
    pub reported_failed: BTreeSet<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub fired: bool,
    pub fired_at: Option<DateTime<Utc>>,
}

impl CompletionRecord {
    fn new(expected_producers: BTreeSet<String>, now: DateTime<Utc>) -> Self {
        Self {
            expected_producers,
            reported_succeeded: BTreeMap::new(),
            reported_failed: BTreeSet::new(),
            first_seen_at: now,
            last_updated_at: now,
            fired: false,
            fired_at: None,
        }
    }

    fn missing(&self) -> Vec<String> {
        self.expected_producers
            .iter()
            .filter(|p| !self.reported_succeeded.contains_key(*p))
            .cloned()
            .collect()
    }
}

/// The full succeeded set handed downstream exactly once per fingerprint.
#[derive(Debug, Clone)]
pub struct CompletedSet {
    pub fingerprint: String,
    pub completed: BTreeMap<String, LifecycleEvent>,
}

#[derive(Debug)]
pub enum Observation {
    /// Barrier not yet satisfied; lists the producers still missing.
    Pending { missing: Vec<String> },
    /// This event completed the barrier. Emitted exactly once per fingerprint.
    Fired(CompletedSet),
    /// Barrier already fired; duplicate terminal events land here.
    AlreadyFired,
}

/// A fingerprint that exceeded the stale deadline without firing.
#[derive(Debug, Clone)]
pub struct StaleFingerprint {
    pub fingerprint: String,
    pub missing: Vec<String>,
    pub age: Duration,
}

pub struct CompletionTracker {
    expected: BTreeSet<String>,
    shards: Vec<Mutex<HashMap<String, CompletionRecord>>>,
}

impl CompletionTracker {
    pub fn new(expected: impl IntoIterator<Item = String>) -> Self {
        Self {
            expected: expected.into_iter().collect(),
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, fingerprint: &str) -> &Mutex<HashMap<String, CompletionRecord>> {
        let mut hasher = DefaultHasher::new();
        fingerprint.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    /// Fold one lifecycle event into the barrier state. The caller has
    /// already validated the event (non-empty fingerprint).
    pub fn observe(&self, event: &LifecycleEvent) -> Observation {
        let now = Utc::now();
        let mut shard = self.shard(&event.fingerprint).lock();
        let record = shard
            .entry(event.fingerprint.clone())
            .or_insert_with(|| CompletionRecord::new(self.expected.clone(), now));
        record.last_updated_at = now;

        match event.status {
            LifecycleStatus::Started => {
                debug!(target: "completion", producer = %event.producer_id, fingerprint = %event.fingerprint, "producer started");
            }
            LifecycleStatus::Failed => {
                record.reported_failed.insert(event.producer_id.clone());
                debug!(target: "completion", producer = %event.producer_id, fingerprint = %event.fingerprint, "producer failed");
            }
            LifecycleStatus::Succeeded => {
                if record.fired {
                    return Observation::AlreadyFired;
                }
                // Duplicate SUCCEEDED for the same producer overwrites in place.
                record.reported_succeeded.insert(event.producer_id.clone(), event.clone());
                let satisfied = record
                    .expected_producers
                    .iter()
                    .all(|p| record.reported_succeeded.contains_key(p));
                if satisfied {
                    record.fired = true;
                    record.fired_at = Some(now);
                    metrics::BARRIER_FIRED_TOTAL.inc();
                    info!(target: "completion", fingerprint = %event.fingerprint, producers = record.reported_succeeded.len(), "barrier complete");
                    return Observation::Fired(CompletedSet {
                        fingerprint: event.fingerprint.clone(),
                        completed: record.reported_succeeded.clone(),
                    });
                }
            }
        }
        if record.fired {
            Observation::AlreadyFired
        } else {
            Observation::Pending { missing: record.missing() }
        }
    }

    /// Remove and return unfired records whose last update is older than the
    /// stale timeout. Removal is the GC for barriers that will never fire.
    pub fn sweep_stale(&self, stale_timeout: Duration) -> Vec<StaleFingerprint> {
        let now = Utc::now();
        let mut stale = Vec::new();
        for shard in &self.shards {
            let mut shard = shard.lock();
            shard.retain(|fingerprint, record| {
                if record.fired {
                    return true;
                }
                let age = now
                    .signed_duration_since(record.last_updated_at)
                    .to_std()
                    .unwrap_or_default();
                if age < stale_timeout {
                    return true;
                }
                stale.push(StaleFingerprint {
                    fingerprint: fingerprint.clone(),
                    missing: record.missing(),
                    age,
                });
                false
            });
        }
        stale
    }

    /// Drop fired records past the retention window; returns how many were
    /// collected.
    pub fn sweep_fired(&self, retention: Duration) -> usize {
        let now = Utc::now();
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.lock();
            shard.retain(|_, record| {
                let expired = record.fired_at.is_some_and(|fired_at| {
                    now.signed_duration_since(fired_at).to_std().unwrap_or_default() >= retention
                });
                if expired {
                    removed += 1;
                }
                !expired
            });
        }
        removed
    }

    /// Number of live records, across all shards. Test and health plumbing.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
