//! Waiting queues
//!
//! One ready queue per time slot plus a shared delayed set. Ready queues
//! order by (priority desc, submission sequence asc); the delayed set is
//! keyed by wake time and feeds entries back into their slot queue once
//! due.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ledger::{JobId, TimeSlot};

/// Ordering key of a ready entry: higher priority first, then earlier
/// submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueKey {
    /// Queue priority
    pub priority: i32,
    /// Submission sequence, unique per process
    pub seq: u64,
    /// The queued job
    pub job_id: JobId,
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then(self.seq.cmp(&other.seq))
            // Keeps Ord consistent with Eq; seq is unique in practice.
            .then(self.job_id.cmp(&other.job_id))
    }
}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// An entry parked until its wake time
#[derive(Debug, Clone)]
struct DelayedEntry {
    key: QueueKey,
    slot: TimeSlot,
}

/// Read-only view of one queue
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    /// Queue partition name
    pub name: String,
    /// Jobs ready for release, in dispatch order
    pub ready: Vec<JobId>,
    /// Jobs still blocked on their wake time, with the time they unblock
    pub blocked: Vec<(JobId, DateTime<Utc>)>,
}

/// Per-slot ready queues plus the delayed set
#[derive(Default)]
pub struct WaitingQueues {
    ready: BTreeMap<TimeSlot, BTreeSet<QueueKey>>,
    delayed: BTreeMap<(DateTime<Utc>, u64), DelayedEntry>,
}

impl WaitingQueues {
    /// Create empty queues
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a ready job into its slot queue
    pub fn push(&mut self, slot: TimeSlot, key: QueueKey) {
        self.ready.entry(slot).or_default().insert(key);
    }

    /// Park a job until `wake`
    pub fn push_delayed(&mut self, slot: TimeSlot, key: QueueKey, wake: DateTime<Utc>) {
        self.delayed
            .insert((wake, key.seq), DelayedEntry { key, slot });
    }

    /// Move every delayed entry whose wake time has arrived into its slot
    /// queue; returns how many were released
    pub fn release_due(&mut self, now: DateTime<Utc>) -> usize {
        let due: Vec<_> = self
            .delayed
            .range(..=(now, u64::MAX))
            .map(|(k, _)| *k)
            .collect();
        let count = due.len();
        for key in due {
            if let Some(entry) = self.delayed.remove(&key) {
                self.push(entry.slot, entry.key);
            }
        }
        count
    }

    /// Take the best ready job across all slots: highest priority, then
    /// earliest submission
    pub fn pop_next(&mut self) -> Option<QueueKey> {
        let best_slot = self
            .ready
            .iter()
            .filter_map(|(slot, keys)| keys.first().map(|key| (*slot, *key)))
            .min_by(|(_, a), (_, b)| a.cmp(b))
            .map(|(slot, _)| slot)?;
        let keys = self.ready.get_mut(&best_slot)?;
        let key = *keys.first()?;
        keys.remove(&key);
        Some(key)
    }

    /// Remove a job wherever it sits; returns true if it was queued
    pub fn remove(&mut self, job_id: JobId) -> bool {
        for keys in self.ready.values_mut() {
            if let Some(key) = keys.iter().find(|k| k.job_id == job_id).copied() {
                keys.remove(&key);
                return true;
            }
        }
        if let Some(found) = self
            .delayed
            .iter()
            .find(|(_, entry)| entry.key.job_id == job_id)
            .map(|(k, _)| *k)
        {
            self.delayed.remove(&found);
            return true;
        }
        false
    }

    /// Total queued jobs, ready and delayed
    pub fn len(&self) -> usize {
        self.ready.values().map(BTreeSet::len).sum::<usize>() + self.delayed.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read-only snapshot of every queue partition
    pub fn snapshot(&self) -> Vec<QueueSnapshot> {
        let mut slots: BTreeSet<TimeSlot> = self.ready.keys().copied().collect();
        slots.extend(self.delayed.values().map(|e| e.slot));

        slots
            .into_iter()
            .map(|slot| QueueSnapshot {
                name: slot.name().to_string(),
                ready: self
                    .ready
                    .get(&slot)
                    .map(|keys| keys.iter().map(|k| k.job_id).collect())
                    .unwrap_or_default(),
                blocked: self
                    .delayed
                    .iter()
                    .filter(|(_, e)| e.slot == slot)
                    .map(|((wake, _), e)| (e.key.job_id, *wake))
                    .collect(),
            })
            .collect()
    }
}
