//! Repository (spec §4.3).
//!
//! Owns the store handle, the entity cache, and the config resolver's cache.
//! Every durable read or write funnels through here — the limiter, lease,
//! and aggregator never touch [`crate::store::Store`] directly.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use rand::Rng;

use crate::clock::Clock;
use crate::config::RepositoryConfig;
use crate::config_resolver::ConfigResolver;
use crate::error::{Error, Result};
use crate::keys::{self, DEFAULT_RESOURCE};
use crate::model::{Bucket, BucketLimitState, ConfigLevel, Entity, Limit, VersionRecord};
use crate::store::{
    AttributeValue, Condition, Gsi, ReturnValues, Store, StoreError, TransactWrite, UpdateAction,
    UpdateItemRequest,
};
use crate::validate;

/// Immutable-after-creation entity metadata, cached without invalidation
/// (spec §5, "Shared state").
#[derive(Debug, Clone, Copy)]
pub struct EntityMeta {
    pub cascade: bool,
}

#[derive(Debug, Clone)]
struct EntityMetaWithParent {
    cascade: bool,
    parent_id: Option<String>,
}

/// Why a [`Repository::speculative_consume`] attempt failed, used by the
/// limiter to choose its next step (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    BucketMissing,
    AppLimitExhausted,
    WcuExhausted,
    BothExhausted,
    PartitionThrottled,
}

#[derive(Debug, Clone)]
pub struct SpeculativeOutcome {
    pub success: bool,
    pub shard_id: u32,
    pub shard_count: Option<u32>,
    pub bucket: Option<Bucket>,
    pub failure_reason: Option<FailureReason>,
}

pub struct Repository<S: Store> {
    store: Arc<S>,
    config: RepositoryConfig,
    clock: Arc<dyn Clock>,
    entity_meta_cache: DashMap<(String, String), EntityMetaWithParent>,
    shard_count_cache: DashMap<(String, String, String), u32>,
    resolver: ConfigResolver<S>,
}

impl<S: Store> Repository<S> {
    pub fn new(store: Arc<S>, config: RepositoryConfig, clock: Arc<dyn Clock>) -> Self {
        let ttl_ms = config.config_cache_ttl_ms();
        Self {
            resolver: ConfigResolver::new(store.clone(), ttl_ms),
            store,
            config,
            clock,
            entity_meta_cache: DashMap::new(),
            shard_count_cache: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    // ---- entity management -------------------------------------------------

    pub async fn create_entity(&self, ns: &str, entity: Entity) -> Result<()> {
        validate::validate_entity_id(&entity.entity_id)?;
        if let Some(parent) = &entity.parent_id {
            validate::validate_entity_id(parent)?;
        }
        let item = entity.to_item(ns);
        self.store
            .put_item(item, Some(Condition::AttributeNotExists("PK".to_string())))
            .await
            .map_err(|e| match e {
                StoreError::ConditionalCheckFailed { .. } => {
                    Error::validation(format!("entity '{}' already exists", entity.entity_id))
                }
                other => Error::unavailable(other.to_string()),
            })?;
        self.entity_meta_cache.insert(
            (ns.to_string(), entity.entity_id.clone()),
            EntityMetaWithParent {
                cascade: entity.cascade,
                parent_id: entity.parent_id,
            },
        );
        Ok(())
    }

    /// Cache-only lookup; returns `None` on a miss without touching the
    /// store (spec §4.5 step 2: "on miss, a dedicated slow-path ... populates
    /// it").
    pub fn cached_entity_meta(&self, ns: &str, entity_id: &str) -> Option<(bool, Option<String>)> {
        self.entity_meta_cache
            .get(&(ns.to_string(), entity_id.to_string()))
            .map(|m| (m.cascade, m.parent_id.clone()))
    }

    /// Reads entity metadata from the store and populates the cache. Used by
    /// the limiter's slow path on a cache miss.
    pub async fn fetch_entity_meta(
        &self,
        ns: &str,
        entity_id: &str,
    ) -> Result<Option<(bool, Option<String>)>> {
        let (pk, sk) = keys::pk_entity_meta(ns, entity_id);
        let item = self
            .store
            .get_item(&pk, sk)
            .await
            .map_err(|e| Error::unavailable(e.to_string()))?;
        let Some(item) = item else {
            return Ok(None);
        };
        let entity = Entity::from_item(&item).ok_or_else(|| {
            Error::validation(format!("malformed entity item at {pk}"))
        })?;
        self.entity_meta_cache.insert(
            (ns.to_string(), entity_id.to_string()),
            EntityMetaWithParent {
                cascade: entity.cascade,
                parent_id: entity.parent_id.clone(),
            },
        );
        Ok(Some((entity.cascade, entity.parent_id)))
    }

    /// Enumerates an entity's direct children via `GSI1`.
    pub async fn get_children(&self, ns: &str, parent_id: &str) -> Result<Vec<Entity>> {
        let gsi1pk = keys::gsi1pk_parent(ns, parent_id);
        let items = self
            .store
            .query(Gsi::Gsi1, &gsi1pk, false)
            .await
            .map_err(|e| Error::unavailable(e.to_string()))?;
        Ok(items.iter().filter_map(Entity::from_item).collect())
    }

    // ---- shard-count cache ---------------------------------------------------

    /// `shard_count` hint for a new admission: the cached value, or `1` on a
    /// miss (so `shard_id` always resolves to `0` until a real count is
    /// observed). See DESIGN.md for why this implementation treats spec
    /// §4.3's "fallback: 0 on cache miss" as "fall back to shard 0", not a
    /// literal `shard_count` of zero (which would make the random range
    /// empty).
    pub fn cached_shard_count(&self, ns: &str, entity_id: &str, resource: &str) -> u32 {
        self.shard_count_cache
            .get(&(ns.to_string(), entity_id.to_string(), resource.to_string()))
            .map(|v| *v)
            .unwrap_or(1)
    }

    /// Replaces the cached shard count with the max of the current and
    /// observed values (spec §5: "always replaced with the max observed
    /// value").
    pub fn observe_shard_count(&self, ns: &str, entity_id: &str, resource: &str, observed: u32) {
        self.shard_count_cache
            .entry((ns.to_string(), entity_id.to_string(), resource.to_string()))
            .and_modify(|v| *v = (*v).max(observed))
            .or_insert(observed);
    }

    pub(crate) fn pick_shard(shard_count_hint: u32) -> u32 {
        let n = shard_count_hint.max(1);
        if n == 1 {
            0
        } else {
            rand::thread_rng().gen_range(0..n)
        }
    }

    /// Picks a shard other than any in `exclude`, for shard retries (spec
    /// §4.5 step 5).
    pub fn pick_other_shard(shard_count: u32, exclude: &[u32]) -> u32 {
        let n = shard_count.max(1);
        if n <= 1 {
            return 0;
        }
        let candidates: Vec<u32> = (0..n).filter(|s| !exclude.contains(s)).collect();
        if candidates.is_empty() {
            return rand::thread_rng().gen_range(0..n);
        }
        candidates[rand::thread_rng().gen_range(0..candidates.len())]
    }

    // ---- config resolution ---------------------------------------------------

    pub async fn resolve_limits(
        &self,
        ns: &str,
        entity_id: &str,
        resource: &str,
        caller_override: &[Limit],
    ) -> Result<BTreeMap<String, Limit>> {
        self.resolver
            .resolve(ns, entity_id, resource, caller_override, self.now_ms())
            .await
    }

    /// Like [`resolve_limits`][Self::resolve_limits], but also reports
    /// whether the resolution is governed by an entity-level config, for
    /// deciding bucket TTL-eligibility (spec §3).
    pub async fn resolve_limits_governed(
        &self,
        ns: &str,
        entity_id: &str,
        resource: &str,
        caller_override: &[Limit],
    ) -> Result<(BTreeMap<String, Limit>, bool)> {
        self.resolver
            .resolve_with_governance(ns, entity_id, resource, caller_override, self.now_ms())
            .await
    }

    /// Computes the TTL attribute for a freshly created bucket, per spec §3:
    /// `now + max_time_to_fill × bucket_ttl_refill_multiplier`, or `None`
    /// when the multiplier is `0` or the bucket is governed by an explicit
    /// per-entity config rather than a resource/system default.
    pub fn bucket_ttl_ms(&self, entity_governed: bool, resolved: &BTreeMap<String, Limit>) -> Option<i64> {
        if entity_governed {
            return None;
        }
        let max_time_to_fill_seconds = resolved
            .values()
            .filter(|l| l.name != crate::validate::RESERVED_LIMIT_NAME)
            .map(|l| crate::bucket_math::time_to_fill_seconds(&l.to_milli_config()))
            .fold(0.0_f64, f64::max);
        crate::bucket_math::bucket_ttl_ms(
            self.now_ms(),
            max_time_to_fill_seconds,
            self.config.bucket_ttl_refill_multiplier,
        )
    }

    async fn set_config_level(
        &self,
        ns: &str,
        pk: &str,
        sk: &str,
        limits: &[Limit],
    ) -> Result<()> {
        for limit in limits {
            validate::validate_limit_name(&limit.name)?;
        }
        let existing = self
            .store
            .get_item(pk, sk)
            .await
            .map_err(|e| Error::unavailable(e.to_string()))?;
        let prior_version = existing
            .as_ref()
            .and_then(ConfigLevel::from_item)
            .map(|l| l.config_version)
            .unwrap_or(0);
        let level = ConfigLevel {
            limits: limits.iter().map(|l| (l.name.clone(), l.clone())).collect(),
            config_version: prior_version + 1,
        };
        self.store
            .put_item(level.to_item(ns, pk, sk), None)
            .await
            .map_err(|e| Error::unavailable(e.to_string()))
    }

    pub async fn set_entity_limits(
        &self,
        ns: &str,
        entity_id: &str,
        resource: &str,
        limits: &[Limit],
    ) -> Result<()> {
        if self.fetch_entity_meta(ns, entity_id).await?.is_none()
            && self.cached_entity_meta(ns, entity_id).is_none()
        {
            return Err(Error::not_found(format!("entity '{entity_id}' not found")));
        }
        let (pk, sk) = keys::pk_entity_config(ns, entity_id, resource);
        self.set_config_level(ns, &pk, &sk, limits).await?;
        self.resolver.invalidate_entity(ns, entity_id, resource);
        Ok(())
    }

    pub async fn set_entity_default_limits(
        &self,
        ns: &str,
        entity_id: &str,
        limits: &[Limit],
    ) -> Result<()> {
        self.set_entity_limits(ns, entity_id, DEFAULT_RESOURCE, limits).await
    }

    pub async fn set_resource_limits(&self, ns: &str, resource: &str, limits: &[Limit]) -> Result<()> {
        validate::validate_resource_name(resource)?;
        let (pk, sk) = keys::pk_resource_config(ns, resource);
        self.set_config_level(ns, &pk, sk, limits).await?;
        self.resolver.invalidate_resource(ns, resource);
        Ok(())
    }

    pub async fn set_system_limits(&self, ns: &str, limits: &[Limit]) -> Result<()> {
        let (pk, sk) = keys::pk_system_config(ns);
        self.set_config_level(ns, &pk, sk, limits).await?;
        self.resolver.invalidate_system(ns);
        Ok(())
    }

    // ---- admission writes -----------------------------------------------------

    fn user_limit_actions(
        consume_milli: &BTreeMap<String, i64>,
    ) -> (Vec<UpdateAction>, Condition) {
        let mut actions = Vec::with_capacity(consume_milli.len() * 2 + 2);
        let mut condition = Condition::AttributeExists("PK".to_string());
        for (name, milli) in consume_milli {
            actions.push(UpdateAction::Add(format!("b_{name}_tk"), -milli));
            actions.push(UpdateAction::Add(format!("b_{name}_tc"), *milli));
            condition = condition.and(Condition::NumGte(format!("b_{name}_tk"), *milli));
        }
        actions.push(UpdateAction::Add("b_wcu_tk".to_string(), -1000));
        actions.push(UpdateAction::Add("b_wcu_tc".to_string(), 1000));
        condition = condition.and(Condition::NumGte("b_wcu_tk".to_string(), 1000));
        (actions, condition)
    }

    /// Single-round-trip admission for one bucket shard (spec §4.3).
    pub async fn speculative_consume(
        &self,
        ns: &str,
        entity_id: &str,
        resource: &str,
        consume_milli: &BTreeMap<String, i64>,
        shard_count_hint: u32,
    ) -> Result<SpeculativeOutcome> {
        let shard_id = Self::pick_shard(shard_count_hint);
        self.speculative_consume_on_shard(ns, entity_id, resource, consume_milli, shard_id)
            .await
    }

    /// As [`Self::speculative_consume`], but against a caller-chosen shard
    /// (used for shard retries).
    pub async fn speculative_consume_on_shard(
        &self,
        ns: &str,
        entity_id: &str,
        resource: &str,
        consume_milli: &BTreeMap<String, i64>,
        shard_id: u32,
    ) -> Result<SpeculativeOutcome> {
        let (pk, sk) = keys::pk_bucket(ns, entity_id, resource, shard_id);
        let (actions, condition) = Self::user_limit_actions(consume_milli);
        let req = UpdateItemRequest {
            pk,
            sk: sk.to_string(),
            actions,
            condition: Some(condition),
            return_values: ReturnValues::AllNew,
        };

        match self.store.update_item(req).await {
            Ok(success) => {
                let item = success.item.expect("ALL_NEW was requested");
                let bucket = Bucket::from_item(&item);
                if let Some(b) = &bucket {
                    self.observe_shard_count(ns, entity_id, resource, b.shard_count);
                }
                Ok(SpeculativeOutcome {
                    success: true,
                    shard_id,
                    shard_count: bucket.as_ref().map(|b| b.shard_count),
                    bucket,
                    failure_reason: None,
                })
            }
            Err(StoreError::ConditionalCheckFailed { old_item: None }) => {
                Ok(SpeculativeOutcome {
                    success: false,
                    shard_id,
                    shard_count: None,
                    bucket: None,
                    failure_reason: Some(FailureReason::BucketMissing),
                })
            }
            Err(StoreError::ConditionalCheckFailed {
                old_item: Some(item),
            }) => {
                let bucket = Bucket::from_item(&item);
                let wcu_exhausted = bucket
                    .as_ref()
                    .and_then(|b| b.wcu())
                    .is_some_and(|s| s.tk_milli < 1000);
                let app_exhausted = bucket.as_ref().is_some_and(|b| {
                    consume_milli.iter().any(|(name, milli)| {
                        b.limits
                            .get(name)
                            .is_some_and(|state| state.tk_milli < *milli)
                    })
                });
                let reason = match (app_exhausted, wcu_exhausted) {
                    (true, true) => FailureReason::BothExhausted,
                    (true, false) => FailureReason::AppLimitExhausted,
                    (false, true) => FailureReason::WcuExhausted,
                    (false, false) => FailureReason::AppLimitExhausted,
                };
                if let Some(b) = &bucket {
                    self.observe_shard_count(ns, entity_id, resource, b.shard_count);
                }
                Ok(SpeculativeOutcome {
                    success: false,
                    shard_id,
                    shard_count: bucket.as_ref().map(|b| b.shard_count),
                    bucket,
                    failure_reason: Some(reason),
                })
            }
            Err(StoreError::PartitionThrottled) => Ok(SpeculativeOutcome {
                success: false,
                shard_id,
                shard_count: None,
                bucket: None,
                failure_reason: Some(FailureReason::PartitionThrottled),
            }),
            Err(StoreError::Unavailable(msg)) => Err(Error::unavailable(msg)),
            Err(StoreError::TransactionCanceled { .. }) => {
                unreachable!("single-item update never returns a transaction error")
            }
        }
    }

    /// As [`Self::speculative_consume_on_shard`], but for
    /// `speculative_writes = false`: reads the bucket first instead of
    /// racing a single conditional `UpdateItem`, then commits the
    /// consumption as its own one-item transaction. Used in place of the
    /// speculative fast path throughout admission when that config flag is
    /// off; still produces the same [`SpeculativeOutcome`] shape so callers
    /// don't need a second code path for shard retry/doubling.
    pub async fn consume_on_shard_slow(
        &self,
        ns: &str,
        entity_id: &str,
        resource: &str,
        consume_milli: &BTreeMap<String, i64>,
        shard_id: u32,
    ) -> Result<SpeculativeOutcome> {
        let (pk, sk) = keys::pk_bucket(ns, entity_id, resource, shard_id);
        let item = self
            .store
            .get_item(&pk, &sk)
            .await
            .map_err(|e| Error::unavailable(e.to_string()))?;
        let Some(item) = item else {
            return Ok(SpeculativeOutcome {
                success: false,
                shard_id,
                shard_count: None,
                bucket: None,
                failure_reason: Some(FailureReason::BucketMissing),
            });
        };
        let Some(bucket) = Bucket::from_item(&item) else {
            return Ok(SpeculativeOutcome {
                success: false,
                shard_id,
                shard_count: None,
                bucket: None,
                failure_reason: Some(FailureReason::BucketMissing),
            });
        };
        self.observe_shard_count(ns, entity_id, resource, bucket.shard_count);

        let wcu_exhausted = bucket.wcu().is_some_and(|s| s.tk_milli < 1000);
        let app_exhausted = consume_milli.iter().any(|(name, milli)| {
            bucket
                .limits
                .get(name)
                .is_some_and(|state| state.tk_milli < *milli)
        });
        if wcu_exhausted || app_exhausted {
            let reason = match (app_exhausted, wcu_exhausted) {
                (true, true) => FailureReason::BothExhausted,
                (true, false) => FailureReason::AppLimitExhausted,
                (false, true) => FailureReason::WcuExhausted,
                (false, false) => unreachable!(),
            };
            return Ok(SpeculativeOutcome {
                success: false,
                shard_id,
                shard_count: Some(bucket.shard_count),
                bucket: Some(bucket),
                failure_reason: Some(reason),
            });
        }

        let write = Self::build_retry_write(ns, entity_id, resource, shard_id, consume_milli);
        match self.store.transact_write_items(vec![write]).await {
            Ok(()) => {
                let mut consumed = bucket.clone();
                for (name, milli) in consume_milli {
                    if let Some(state) = consumed.limits.get_mut(name) {
                        state.tk_milli -= milli;
                        state.tc += milli;
                    }
                }
                if let Some(wcu) = consumed.limits.get_mut("wcu") {
                    wcu.tk_milli -= 1000;
                    wcu.tc += 1000;
                }
                Ok(SpeculativeOutcome {
                    success: true,
                    shard_id,
                    shard_count: Some(consumed.shard_count),
                    bucket: Some(consumed),
                    failure_reason: None,
                })
            }
            // Lost a race against a concurrent writer between the read and
            // the commit. Reclassify as an ordinary exhaustion signal so the
            // caller's existing shard-retry loop handles it uniformly.
            Err(StoreError::TransactionCanceled { .. }) => Ok(SpeculativeOutcome {
                success: false,
                shard_id,
                shard_count: Some(bucket.shard_count),
                bucket: Some(bucket),
                failure_reason: Some(FailureReason::AppLimitExhausted),
            }),
            Err(StoreError::PartitionThrottled) => Ok(SpeculativeOutcome {
                success: false,
                shard_id,
                shard_count: None,
                bucket: None,
                failure_reason: Some(FailureReason::PartitionThrottled),
            }),
            Err(StoreError::Unavailable(msg)) => Err(Error::unavailable(msg)),
            Err(StoreError::ConditionalCheckFailed { .. }) => Ok(SpeculativeOutcome {
                success: false,
                shard_id,
                shard_count: Some(bucket.shard_count),
                bucket: Some(bucket),
                failure_reason: Some(FailureReason::AppLimitExhausted),
            }),
        }
    }

    /// Probes shard 1 with a single read, for the `PARTITION_THROTTLED`
    /// handling in spec §4.5 step 5.
    pub async fn probe_shard(
        &self,
        ns: &str,
        entity_id: &str,
        resource: &str,
        shard: u32,
    ) -> Result<Option<Bucket>> {
        let (pk, sk) = keys::pk_bucket(ns, entity_id, resource, shard);
        let item = self
            .store
            .get_item(&pk, sk)
            .await
            .map_err(|e| Error::unavailable(e.to_string()))?;
        Ok(item.as_ref().and_then(Bucket::from_item))
    }

    /// Atomic multi-item commit used by the slow path and the cascade path
    /// (spec §4.3). `writes` must already encode the right shape (normal,
    /// retry, or create) per bucket.
    pub async fn commit_initial(&self, writes: Vec<TransactWrite>) -> Result<()> {
        self.store.transact_write_items(writes).await.map_err(|e| match e {
            StoreError::TransactionCanceled { index } => {
                Error::concurrency(format!("bucket commit lost a race at item {index}"))
            }
            other => Error::unavailable(other.to_string()),
        })
    }

    /// Builds a `Create` transact-write: a brand-new bucket item with
    /// consumption already applied, guarded by `attribute_not_exists(PK)`.
    pub fn build_create_write(bucket: &Bucket) -> TransactWrite {
        TransactWrite::Put {
            item: bucket.to_item(),
            condition: Some(Condition::AttributeNotExists("PK".to_string())),
        }
    }

    /// Builds a `Normal` transact-write: refill-then-consume, guarded by
    /// `rf = expected_rf`.
    pub fn build_normal_write(
        ns: &str,
        entity_id: &str,
        resource: &str,
        shard: u32,
        expected_rf_ms: i64,
        new_rf_ms: i64,
        refill_delta_milli: &BTreeMap<String, i64>,
        consume_milli: &BTreeMap<String, i64>,
    ) -> TransactWrite {
        let (pk, sk) = keys::pk_bucket(ns, entity_id, resource, shard);
        let mut actions = Vec::new();
        for (name, refill) in refill_delta_milli {
            let consumed = consume_milli.get(name).copied().unwrap_or(0);
            actions.push(UpdateAction::Add(format!("b_{name}_tk"), refill - consumed));
            actions.push(UpdateAction::Add(format!("b_{name}_tc"), consumed));
        }
        let wcu_consumed = 1000;
        actions.push(UpdateAction::Add("b_wcu_tk".to_string(), -wcu_consumed));
        actions.push(UpdateAction::Add("b_wcu_tc".to_string(), wcu_consumed));
        actions.push(UpdateAction::Set("rf".to_string(), AttributeValue::N(new_rf_ms)));
        TransactWrite::Update(UpdateItemRequest {
            pk,
            sk: sk.to_string(),
            actions,
            condition: Some(Condition::NumEq("rf".to_string(), expected_rf_ms)),
            return_values: ReturnValues::None,
        })
    }

    /// Builds a no-op confirmation write for a bucket that already admitted
    /// speculatively outside this transaction: participates in the
    /// transaction's atomicity (so a sibling failure still rolls this item
    /// back to its pre-transaction state) without re-applying the
    /// consumption a second time.
    pub fn build_confirm_write(ns: &str, entity_id: &str, resource: &str, shard: u32) -> TransactWrite {
        let (pk, sk) = keys::pk_bucket(ns, entity_id, resource, shard);
        TransactWrite::Update(UpdateItemRequest {
            pk,
            sk: sk.to_string(),
            actions: Vec::new(),
            condition: Some(Condition::AttributeExists("PK".to_string())),
            return_values: ReturnValues::None,
        })
    }

    /// Builds a `Retry` transact-write: consume-only, no refill, guarded by
    /// `tk >= consumed` per limit plus `wcu_tk >= 1000`.
    pub fn build_retry_write(
        ns: &str,
        entity_id: &str,
        resource: &str,
        shard: u32,
        consume_milli: &BTreeMap<String, i64>,
    ) -> TransactWrite {
        let (pk, sk) = keys::pk_bucket(ns, entity_id, resource, shard);
        let (actions, condition) = Self::user_limit_actions(consume_milli);
        TransactWrite::Update(UpdateItemRequest {
            pk,
            sk: sk.to_string(),
            actions,
            condition: Some(condition),
            return_values: ReturnValues::None,
        })
    }

    /// Independent, unconditional single-item writes — used by `adjust` and
    /// by compensating rollback. Never fails outwardly; store errors are
    /// logged and swallowed (spec §4.6, §7).
    pub async fn write_each(&self, writes: Vec<(String, String, Vec<UpdateAction>)>) {
        for (pk, sk, actions) in writes {
            let req = UpdateItemRequest {
                pk: pk.clone(),
                sk: sk.clone(),
                actions,
                condition: None,
                return_values: ReturnValues::None,
            };
            if let Err(e) = self.store.update_item(req).await {
                tracing::error!(pk = %pk, sk = %sk, error = %e, "compensating write failed; bucket state may be inconsistent");
            }
        }
    }

    /// Conditional doubling of shard 0's `shard_count` (spec §4.3).
    /// Idempotent under races: a losing caller adopts whatever value won.
    pub async fn bump_shard_count(
        &self,
        ns: &str,
        entity_id: &str,
        resource: &str,
        current: u32,
    ) -> Result<u32> {
        let (pk, sk) = keys::pk_bucket(ns, entity_id, resource, 0);
        let new = current.saturating_mul(2).max(1);
        let req = UpdateItemRequest {
            pk: pk.clone(),
            sk: sk.to_string(),
            actions: vec![UpdateAction::Set(
                "shard_count".to_string(),
                AttributeValue::N(new as i64),
            )],
            condition: Some(Condition::NumEq("shard_count".to_string(), current as i64)),
            return_values: ReturnValues::AllNew,
        };
        match self.store.update_item(req).await {
            Ok(success) => {
                let observed = success
                    .item
                    .and_then(|i| i.get_n("shard_count"))
                    .unwrap_or(new as i64) as u32;
                self.observe_shard_count(ns, entity_id, resource, observed);
                Ok(observed)
            }
            Err(StoreError::ConditionalCheckFailed { old_item }) => {
                let observed = old_item
                    .and_then(|i| i.get_n("shard_count"))
                    .map(|n| n as u32)
                    .or_else(|| {
                        self.shard_count_cache
                            .get(&(ns.to_string(), entity_id.to_string(), resource.to_string()))
                            .map(|v| *v)
                    })
                    .unwrap_or(new);
                self.observe_shard_count(ns, entity_id, resource, observed);
                Ok(observed)
            }
            Err(other) => Err(Error::unavailable(other.to_string())),
        }
    }

    /// Discovery over `GSI3`, then a batch fetch of the full items (spec
    /// §4.3).
    pub async fn get_buckets(
        &self,
        ns: &str,
        entity_id: &str,
        resource: Option<&str>,
    ) -> Result<Vec<Bucket>> {
        let gsi3pk = keys::gsi3pk_entity(ns, entity_id);
        let key_items = self
            .store
            .query(Gsi::Gsi3, &gsi3pk, true)
            .await
            .map_err(|e| Error::unavailable(e.to_string()))?;

        let mut wanted_keys = Vec::new();
        for item in &key_items {
            let (Some(pk), Some(sk)) = (item.pk(), item.sk()) else {
                continue;
            };
            if let Some(r) = resource {
                let Some((_, _, parsed_resource, _)) = keys::parse_bucket_pk(pk) else {
                    continue;
                };
                if parsed_resource != r {
                    continue;
                }
            }
            wanted_keys.push((pk.to_string(), sk.to_string()));
        }

        let full_items = self
            .store
            .batch_get_item(&wanted_keys)
            .await
            .map_err(|e| Error::unavailable(e.to_string()))?;

        Ok(full_items
            .into_iter()
            .flatten()
            .filter_map(|item| Bucket::from_item(&item))
            .collect())
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Reads the namespace's version record, writing [`CURRENT_SCHEMA_VERSION`]
    /// on first use (a fresh namespace has none yet) and returning
    /// [`Error::Version`] if a stored schema version is newer than this
    /// build understands (spec §3, "Version record"; spec §7 `VERSION`).
    /// Call once per namespace before serving admission traffic against it.
    pub async fn ensure_schema_version(&self, ns: &str) -> Result<()> {
        let (pk, sk) = keys::pk_system_version(ns);
        let existing = self
            .store
            .get_item(&pk, sk)
            .await
            .map_err(|e| Error::unavailable(e.to_string()))?;
        match existing.as_ref().and_then(VersionRecord::from_item) {
            Some(record) if record.schema_version > CURRENT_SCHEMA_VERSION => {
                Err(Error::Version {
                    have: record.schema_version,
                    need: CURRENT_SCHEMA_VERSION,
                })
            }
            Some(_) => Ok(()),
            None => {
                let record = VersionRecord {
                    schema_version: CURRENT_SCHEMA_VERSION,
                    aggregator_version: CURRENT_SCHEMA_VERSION,
                };
                match self
                    .store
                    .put_item(record.to_item(ns), Some(Condition::AttributeNotExists("PK".to_string())))
                    .await
                {
                    Ok(()) | Err(StoreError::ConditionalCheckFailed { .. }) => Ok(()),
                    Err(other) => Err(Error::unavailable(other.to_string())),
                }
            }
        }
    }
}

/// The schema version this build of the core understands. Bumped whenever an
/// on-wire item shape changes in a way older aggregators/limiters could not
/// read correctly.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Builds the full set of (user + `wcu`) limits, in milli-units, that a
/// fresh bucket item should hold. `shard_count` is baked into the sharded
/// capacity/refill of application limits; `wcu` is never sharded.
pub fn build_initial_bucket_limits(
    limits: &BTreeMap<String, Limit>,
    shard_count: u32,
) -> BTreeMap<String, BucketLimitState> {
    let mut out = BTreeMap::new();
    for (name, limit) in limits {
        let milli = limit.to_milli_config();
        let cp = crate::bucket_math::effective_capacity_milli(milli.capacity_milli, shard_count);
        let ra = crate::bucket_math::effective_refill_amount_milli(milli.refill_amount_milli, shard_count);
        let bx = crate::bucket_math::effective_capacity_milli(milli.burst_milli, shard_count);
        out.insert(
            name.clone(),
            BucketLimitState {
                tk_milli: cp,
                cp_milli: cp,
                bx_milli: bx,
                ra_milli: ra,
                rp_ms: milli.refill_period_ms,
                tc: 0,
            },
        );
    }
    let wcu = Limit::wcu().to_milli_config();
    out.insert(
        "wcu".to_string(),
        BucketLimitState {
            tk_milli: wcu.capacity_milli,
            cp_milli: wcu.capacity_milli,
            bx_milli: wcu.burst_milli,
            ra_milli: wcu.refill_amount_milli,
            rp_ms: wcu.refill_period_ms,
            tc: 0,
        },
    );
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::clock::TestClock;
    use crate::store::memory::MemoryStore;

    fn rpm(capacity: i64) -> Limit {
        Limit {
            name: "rpm".to_string(),
            capacity,
            burst: capacity,
            refill_amount: capacity,
            refill_period_seconds: 60,
        }
    }

    fn fresh_bucket(ns: &str, entity: &str, resource: &str, shard: u32, limits: &BTreeMap<String, Limit>) -> Bucket {
        Bucket {
            ns: ns.to_string(),
            entity_id: entity.to_string(),
            resource: resource.to_string(),
            shard,
            rf_ms: 0,
            shard_count: 1,
            cascade: false,
            parent_id: None,
            limits: build_initial_bucket_limits(limits, 1),
            ttl_ms: None,
        }
    }

    fn repo() -> Repository<MemoryStore> {
        Repository::new(
            Arc::new(MemoryStore::new()),
            RepositoryConfig::default(),
            Arc::new(TestClock::new(0)),
        )
    }

    #[tokio::test]
    async fn speculative_consume_on_missing_bucket_reports_bucket_missing() {
        let repo = repo();
        let mut consume = BTreeMap::new();
        consume.insert("rpm".to_string(), 1000);
        let outcome = repo
            .speculative_consume("ns00000000a", "e1", "r1", &consume, 1)
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.failure_reason, Some(FailureReason::BucketMissing));
    }

    #[tokio::test]
    async fn speculative_consume_succeeds_then_exhausts() {
        let repo = repo();
        let mut limits = BTreeMap::new();
        limits.insert("rpm".to_string(), rpm(2));
        let bucket = fresh_bucket("ns00000000a", "e1", "r1", 0, &limits);
        repo.commit_initial(vec![Repository::<MemoryStore>::build_create_write(&bucket)])
            .await
            .unwrap();

        let mut consume = BTreeMap::new();
        consume.insert("rpm".to_string(), 1000);

        let first = repo
            .speculative_consume_on_shard("ns00000000a", "e1", "r1", &consume, 0)
            .await
            .unwrap();
        assert!(first.success);

        let second = repo
            .speculative_consume_on_shard("ns00000000a", "e1", "r1", &consume, 0)
            .await
            .unwrap();
        assert!(second.success);

        let third = repo
            .speculative_consume_on_shard("ns00000000a", "e1", "r1", &consume, 0)
            .await
            .unwrap();
        assert!(!third.success);
        assert_eq!(third.failure_reason, Some(FailureReason::AppLimitExhausted));
    }

    #[tokio::test]
    async fn bump_shard_count_doubles_and_is_idempotent_under_races() {
        let repo = repo();
        let mut limits = BTreeMap::new();
        limits.insert("rpm".to_string(), rpm(100));
        let bucket = fresh_bucket("ns00000000a", "e1", "r1", 0, &limits);
        repo.commit_initial(vec![Repository::<MemoryStore>::build_create_write(&bucket)])
            .await
            .unwrap();

        let first = repo.bump_shard_count("ns00000000a", "e1", "r1", 1).await.unwrap();
        assert_eq!(first, 2);

        // A second caller racing with a stale `current=1` loses the
        // conditional write but adopts the already-bumped value.
        let second = repo.bump_shard_count("ns00000000a", "e1", "r1", 1).await.unwrap();
        assert_eq!(second, 2);
    }

    #[tokio::test]
    async fn get_buckets_discovers_across_shards() {
        let repo = repo();
        let mut limits = BTreeMap::new();
        limits.insert("rpm".to_string(), rpm(100));
        for shard in 0..3u32 {
            let bucket = fresh_bucket("ns00000000a", "e1", "r1", shard, &limits);
            repo.commit_initial(vec![Repository::<MemoryStore>::build_create_write(&bucket)])
                .await
                .unwrap();
        }
        let found = repo.get_buckets("ns00000000a", "e1", Some("r1")).await.unwrap();
        assert_eq!(found.len(), 3);
    }
}
