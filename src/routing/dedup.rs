//! Time-windowed deduplication cache
//!
//! Remembers keys for a fixed window. Expired entries are evicted lazily,
//! whenever the cache is queried.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Set of recently seen keys with lazy expiry
#[derive(Debug, Clone)]
pub struct DedupCache<K> {
    entries: HashMap<K, Instant>,
    window: Duration,
}

impl<K: Eq + Hash + Clone> DedupCache<K> {
    pub fn new(window: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            window,
        }
    }

    /// Window after which an entry is forgotten
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Check whether `key` was inserted within the window.
    ///
    /// Drops every expired entry before testing membership.
    pub fn contains(&mut self, key: &K) -> bool {
        self.evict_expired();
        self.entries.contains_key(key)
    }

    /// Record `key` as seen now, refreshing its timestamp if present
    pub fn insert(&mut self, key: K) {
        self.entries.insert(key, Instant::now());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_expired(&mut self) {
        let now = Instant::now();
        let window = self.window;
        let before = self.entries.len();
        self.entries
            .retain(|_, seen_at| now.duration_since(*seen_at) < window);
        let evicted = before - self.entries.len();
        if evicted > 0 {
            trace!(evicted, "Evicted expired dedup entries");
        }
    }
}
