use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

/// A stored value with its freshness stamp. Never handed out; callers get clones.
#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    /// An entry aged exactly `ttl` is already stale.
    #[inline]
    fn is_fresh(&self) -> bool {
        self.stored_at.elapsed() < self.ttl
    }
}

/// Keyed, time-expiring memo of fetch results.
///
/// Eviction is lazy: an expired entry is only dropped when a `get` touches it.
/// Memory is bounded by the number of distinct keys requested in a session.
/// Values should be cheap to clone (`Arc` payloads) since every hit clones.
#[derive(Debug)]
pub struct TtlCache<V> {
    entries: DashMap<String, CacheEntry<V>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new() -> Self {
        Self { entries: DashMap::new() }
    }

    /// Returns the value while it is younger than its ttl, otherwise evicts it.
    pub fn get(&self, key: &str) -> Option<V> {
        {
            let entry = self.entries.get(key)?;
            if entry.is_fresh() {
                return Some(entry.value.clone());
            }
        }
        // Guard dropped above: removing while holding a shard ref deadlocks.
        // remove_if keeps an entry that was re-set between the two steps.
        self.entries.remove_if(key, |_, entry| !entry.is_fresh());
        None
    }

    /// Unconditionally replaces any entry under `key`, stamped now.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        self.entries.insert(
            key.into(),
            CacheEntry {
                value,
                stored_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Removes the exact key and every key that starts with it.
    /// Returns how many entries were dropped.
    pub fn invalidate(&self, key_or_prefix: &str) -> usize {
        let mut removed = 0usize;
        self.entries.retain(|key, _| {
            let hit = key.starts_with(key_or_prefix);
            if hit {
                removed += 1;
            }
            !hit
        });
        removed
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of stored entries, stale ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<V: Clone> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new()
    }
}
