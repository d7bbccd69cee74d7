//! Change-detection cache.
//!
//! A time-bounded map from entity id to the last state that was
//! successfully published. It is owned by a single poller and never shared,
//! so it needs no locking. Entries older than the TTL read as absent even
//! before [`DedupCache::sweep_expired`] removes them.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

/// Default TTL for dedup entries.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug)]
struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

/// Last-observed-state store keyed by entity id.
#[derive(Debug)]
pub struct DedupCache<K, V> {
    ttl: Duration,
    entries: HashMap<K, Entry<V>>,
}

impl<K: Eq + Hash, V: PartialEq> DedupCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn live(&self, key: &K) -> Option<&Entry<V>> {
        self.entries
            .get(key)
            .filter(|entry| entry.inserted_at.elapsed() <= self.ttl)
    }

    /// True if a non-expired entry exists for `key`.
    pub fn has(&self, key: &K) -> bool {
        self.live(key).is_some()
    }

    /// Last recorded value for `key`, unless expired.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.live(key).map(|entry| &entry.value)
    }

    /// Record `value` for `key` and reset its age to zero.
    pub fn set(&mut self, key: K, value: V) {
        self.entries.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// An observation is a change iff nothing live is recorded for the key or
    /// the recorded value differs.
    pub fn is_changed(&self, key: &K, observed: &V) -> bool {
        self.get(key) != Some(observed)
    }

    /// Drop every entry older than the TTL. Returns how many were removed.
    pub fn sweep_expired(&mut self) -> usize {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.inserted_at.elapsed() <= ttl);
        before - self.entries.len()
    }

    /// Number of stored entries, expired-but-unswept ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
