//! Last-known replica queue lengths with staleness expiry.
//!
//! The scheduler consults this cache before probing so that a recently
//! observed queue length can satisfy an assignment attempt without a
//! round trip. Entries expire passively: a read older than the staleness
//! timeout returns nothing, and the entry is overwritten by the next
//! probe. Entries for replicas that leave the active set are pruned on
//! every [`update_replicas`](crate::PowerOfTwoScheduler::update_replicas).
//!
//! Per-entry state machine:
//!
//! ```text
//! absent --update--> fresh --staleness elapses--> stale (reads as absent)
//!   ^                  ^                            |
//!   |                  +----------update------------+
//!   +---- remove_inactive / invalidate (any state)
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::Clock;

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    queue_len: u32,
    last_updated: f64,
}

/// Per-replica map of last-known queue length with a staleness timeout.
///
/// Accessed concurrently from scheduling tasks and background probes.
/// The interior lock is a `std::sync::Mutex` (not tokio): it is never
/// held across an `.await` point, and every critical section is a few
/// map operations. Concurrent updates for the same key have no ordering
/// guarantee beyond last-writer-wins on the stored timestamp.
pub struct QueueLengthCache {
    staleness: Duration,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl QueueLengthCache {
    /// Create a cache whose entries are fresh for `staleness` after each
    /// update.
    pub fn new(staleness: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            staleness,
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the stored queue length for `replica_id` if the entry is
    /// still fresh.
    ///
    /// An entry is fresh iff `now - last_updated < staleness`. Stale
    /// entries read as absent and are not mutated; the next update
    /// refreshes them in place.
    pub fn get(&self, replica_id: &str) -> Option<u32> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.get(replica_id)?;
        if self.clock.now() - entry.last_updated < self.staleness.as_secs_f64() {
            Some(entry.queue_len)
        } else {
            None
        }
    }

    /// Record a freshly observed queue length for `replica_id`.
    pub fn update(&self, replica_id: &str, queue_len: u32) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            replica_id.to_owned(),
            CacheEntry {
                queue_len,
                last_updated: self.clock.now(),
            },
        );
    }

    /// Drop the entry for `replica_id`, if any.
    ///
    /// Used when a probe reveals the replica is unreachable or has left
    /// the active set; the stored value can no longer be trusted.
    pub fn invalidate(&self, replica_id: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(replica_id);
    }

    /// Delete every entry whose key is not in `active_ids`.
    pub fn remove_inactive(&self, active_ids: &HashSet<String>) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|id, _| active_ids.contains(id));
    }

    /// Number of entries currently stored, fresh or stale.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether the cache holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for QueueLengthCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueLengthCache")
            .field("staleness", &self.staleness)
            .field("entries", &self.len())
            .finish()
    }
}
