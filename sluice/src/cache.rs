//! A small TTL cache shared by the config resolver, the repository's entity
//! cache, and the namespace registry's name/ID lookup (spec §4.3, §4.4,
//! §4.8, §5 "Shared state").
//!
//! Backed by [`dashmap`] rather than a single `Mutex`-guarded map: fine-grained
//! locking over a single global mutex, the same lock-free concurrent map
//! pattern used elsewhere in this crate for per-process shared caches.

use std::hash::Hash;

use dashmap::DashMap;

/// One cached value, stamped with the insertion time and an optional
/// version tag (used by the config resolver to scope negative caching by
/// `config_version`, per spec §4.4).
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at_ms: i64,
    version: i64,
}

/// A process-wide, per-repository TTL cache. `ttl_ms = None` disables
/// expiry (entries live until explicitly invalidated); `ttl_ms = Some(0)`
/// disables caching outright (every read misses).
pub struct TtlCache<K, V> {
    entries: DashMap<K, CacheEntry<V>>,
    ttl_ms: Option<i64>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl_ms: Option<i64>) -> Self {
        Self {
            entries: DashMap::new(),
            ttl_ms,
        }
    }

    fn is_live(&self, entry: &CacheEntry<V>, now_ms: i64) -> bool {
        match self.ttl_ms {
            None => true,
            Some(0) => false,
            Some(ttl) => now_ms.saturating_sub(entry.inserted_at_ms) < ttl,
        }
    }

    /// Returns the cached value (and its version tag) if present and live.
    pub fn get(&self, key: &K, now_ms: i64) -> Option<(V, i64)> {
        let entry = self.entries.get(key)?;
        if self.is_live(&entry, now_ms) {
            Some((entry.value.clone(), entry.version))
        } else {
            None
        }
    }

    pub fn insert(&self, key: K, value: V, now_ms: i64, version: i64) {
        if self.ttl_ms == Some(0) {
            return;
        }
        self.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at_ms: now_ms,
                version,
            },
        );
    }

    /// Evicts a single key. Used by setter/deleter calls on an atomic
    /// `config_version` bump (spec §4.4).
    pub fn invalidate(&self, key: &K) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
