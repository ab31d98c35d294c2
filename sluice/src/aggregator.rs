//! Stream aggregator (spec §4.7).
//!
//! Consumes ordered change-stream batches of bucket-item mutations and
//! performs five best-effort, error-collecting actions per batch: proactive
//! sharding under `wcu` pressure, shard-count propagation from shard 0 to
//! its siblings, proactive refills under an optimistic lock on `rf`, usage
//! snapshot emission, and (via [`AuditSink`]) handing consumption deltas to
//! whatever external archival collaborator the host application wires in —
//! this crate defines the seam, not the S3 writer (spec §1 Non-goals).
//!
//! Every step is independent: a failure in one bucket's refill does not stop
//! another bucket's shard propagation. Errors are collected into the
//! returned [`BatchResult`] rather than aborting the batch, so the invoking
//! runtime can decide its own retry/DLQ policy (spec §4.7, "Failure
//! handling").

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::bucket_math::{self, LimitConfig};
use crate::keys;
use crate::model::{Bucket, UsageSnapshot};
use crate::repository::Repository;
use crate::store::{ChangeRecord, Condition, EventName, Store, StoreError, UpdateAction, UpdateItemRequest};
use crate::validate::RESERVED_LIMIT_NAME;

/// One consumption event handed to an [`AuditSink`] — the data an external
/// archival collaborator (e.g. an S3 writer) would need, with nothing about
/// how or where it is durably archived (spec §1 Non-goals: "S3 audit
/// archival" is out of scope for this core).
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEvent {
    pub ns: String,
    pub entity_id: String,
    pub resource: String,
    pub shard: u32,
    /// Per-limit `tc` deltas observed in this batch, including `wcu`.
    pub tc_delta_milli: BTreeMap<String, i64>,
    pub observed_at_ms: i64,
}

/// Extension point for audit archival. The default [`NoopAuditSink`] drops
/// every event; a host application wires in its own sink (S3, a message
/// bus, ...) to actually archive them.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn record(&self, _event: AuditEvent) {}
}

/// A usage-snapshot window granularity (spec §4.7 step 6: "windows are
/// configured (e.g., hourly, daily)").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageWindow {
    Hourly,
    Daily,
}

impl UsageWindow {
    /// Canonical time-bucket string for `now_ms` at this granularity. Plain
    /// integer epoch-bucket arithmetic rather than a calendar library: the
    /// key only needs to be a stable, sortable identifier for "which
    /// window", not a human-readable date.
    pub fn window_key(self, now_ms: i64) -> String {
        match self {
            UsageWindow::Hourly => format!("H{}", now_ms.div_euclid(3_600_000)),
            UsageWindow::Daily => format!("D{}", now_ms.div_euclid(86_400_000)),
        }
    }
}

/// Best-effort outcome of one [`Aggregator::process_batch`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResult {
    pub buckets_aggregated: usize,
    pub refills_written: usize,
    pub shard_doublings: usize,
    pub shard_propagations_written: usize,
    pub usage_snapshots_written: usize,
    pub errors: Vec<String>,
}

/// One (ns, entity, resource, shard)'s aggregated view of a batch.
struct AggregatedBucket {
    latest: Bucket,
    tc_delta_milli: BTreeMap<String, i64>,
}

/// A shard-0 `shard_count` transition observed within the batch.
#[derive(Debug, Clone, Copy)]
struct ShardTransition {
    old_count: u32,
    new_count: u32,
}

pub struct Aggregator<S: Store> {
    repository: Arc<Repository<S>>,
    windows: Vec<UsageWindow>,
    audit_sink: Arc<dyn AuditSink>,
}

impl<S: Store> Aggregator<S> {
    pub fn new(repository: Arc<Repository<S>>) -> Self {
        Self {
            repository,
            windows: vec![UsageWindow::Hourly, UsageWindow::Daily],
            audit_sink: Arc::new(NoopAuditSink),
        }
    }

    pub fn with_windows(mut self, windows: Vec<UsageWindow>) -> Self {
        self.windows = windows;
        self
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = sink;
        self
    }

    /// Processes one change-stream batch, in order. `now_ms` is the clock
    /// reading the caller observed when it pulled the batch (passed in
    /// rather than read from [`crate::clock::Clock`] here, since the
    /// aggregator has no admission-side notion of "now" of its own).
    pub async fn process_batch(&self, records: Vec<ChangeRecord>, now_ms: i64) -> BatchResult {
        let mut result = BatchResult::default();

        // Step 1: parse every MODIFY on a bucket PK.
        let mut aggregated: BTreeMap<(String, String, String, u32), AggregatedBucket> = BTreeMap::new();
        let mut shard_transitions: BTreeMap<(String, String, String), ShardTransition> = BTreeMap::new();

        for record in &records {
            if record.event_name != EventName::Modify {
                continue;
            }
            let (Some(new_image), Some(old_image)) = (&record.new_image, &record.old_image) else {
                continue;
            };
            let Some(new_pk) = new_image.pk() else { continue };
            if keys::parse_bucket_pk(new_pk).is_none() {
                continue;
            }
            let Some(new_bucket) = Bucket::from_item(new_image) else {
                result.errors.push(format!("malformed bucket NewImage at {new_pk}"));
                continue;
            };
            let old_bucket = Bucket::from_item(old_image);

            let mut tc_delta_milli = BTreeMap::new();
            for (name, new_state) in &new_bucket.limits {
                let old_tc = old_bucket
                    .as_ref()
                    .and_then(|b| b.limits.get(name))
                    .map(|s| s.tc)
                    .unwrap_or(0);
                let delta = (new_state.tc - old_tc).max(0);
                if delta > 0 {
                    tc_delta_milli.insert(name.clone(), delta);
                }
            }

            if new_bucket.shard == 0 {
                let old_count = old_bucket.as_ref().map(|b| b.shard_count).unwrap_or(new_bucket.shard_count);
                if new_bucket.shard_count > old_count {
                    let key = (new_bucket.ns.clone(), new_bucket.entity_id.clone(), new_bucket.resource.clone());
                    shard_transitions
                        .entry(key)
                        .and_modify(|t| t.new_count = t.new_count.max(new_bucket.shard_count))
                        .or_insert(ShardTransition {
                            old_count,
                            new_count: new_bucket.shard_count,
                        });
                }
            }

            // Step 2: aggregate by (ns, entity, resource, shard).
            let key = (
                new_bucket.ns.clone(),
                new_bucket.entity_id.clone(),
                new_bucket.resource.clone(),
                new_bucket.shard,
            );
            self.audit_sink.record(AuditEvent {
                ns: new_bucket.ns.clone(),
                entity_id: new_bucket.entity_id.clone(),
                resource: new_bucket.resource.clone(),
                shard: new_bucket.shard,
                tc_delta_milli: tc_delta_milli.clone(),
                observed_at_ms: now_ms,
            });
            aggregated
                .entry(key)
                .and_modify(|agg| {
                    for (name, delta) in &tc_delta_milli {
                        *agg.tc_delta_milli.entry(name.clone()).or_insert(0) += delta;
                    }
                    agg.latest = new_bucket.clone();
                })
                .or_insert(AggregatedBucket {
                    latest: new_bucket,
                    tc_delta_milli,
                });
        }

        result.buckets_aggregated = aggregated.len();

        // Step 3: proactive sharding under wcu pressure (shard 0 only).
        for agg in aggregated.values() {
            if agg.latest.shard != 0 {
                continue;
            }
            let Some(wcu) = agg.latest.wcu() else { continue };
            if wcu.cp_milli <= 0 {
                continue;
            }
            let wcu_delta = agg.tc_delta_milli.get(RESERVED_LIMIT_NAME).copied().unwrap_or(0);
            let pressure = wcu_delta as f64 / wcu.cp_milli as f64;
            if pressure <= self.repository.config().wcu_proactive_threshold {
                continue;
            }
            let current = agg.latest.shard_count.max(1);
            let warning_threshold = self.repository.config().shard_warning_threshold;
            if current >= warning_threshold {
                tracing::warn!(
                    ns = %agg.latest.ns,
                    entity_id = %agg.latest.entity_id,
                    resource = %agg.latest.resource,
                    shard_count = current,
                    "proactively doubling shard count past the configured warning threshold"
                );
            }
            match self
                .repository
                .bump_shard_count(&agg.latest.ns, &agg.latest.entity_id, &agg.latest.resource, current)
                .await
            {
                Ok(new_count) if new_count > current => {
                    result.shard_doublings += 1;
                    tracing::debug!(
                        ns = %agg.latest.ns,
                        entity_id = %agg.latest.entity_id,
                        resource = %agg.latest.resource,
                        from = current,
                        to = new_count,
                        "aggregator proactively doubled shard count"
                    );
                }
                Ok(_) => {
                    // Lost the race to another writer; already absorbed by
                    // `bump_shard_count`'s own conditional-failure handling.
                }
                Err(e) => result.errors.push(format!(
                    "proactive shard doubling failed for {}/{}/{}: {e}",
                    agg.latest.ns, agg.latest.entity_id, agg.latest.resource
                )),
            }
        }

        // Step 4: propagate shard-count increases from shard 0 to siblings.
        for ((ns, entity_id, resource), transition) in &shard_transitions {
            for shard in 1..transition.new_count {
                let (pk, sk) = keys::pk_bucket(ns, entity_id, resource, shard);
                let req = UpdateItemRequest {
                    pk: pk.clone(),
                    sk: sk.to_string(),
                    actions: vec![UpdateAction::Set(
                        "shard_count".to_string(),
                        crate::store::AttributeValue::N(transition.new_count as i64),
                    )],
                    condition: Some(Condition::Or(
                        Box::new(Condition::AttributeNotExists("shard_count".to_string())),
                        Box::new(Condition::NumLt("shard_count".to_string(), transition.new_count as i64)),
                    )),
                    return_values: crate::store::ReturnValues::None,
                };
                match self.repository.store().update_item(req).await {
                    Ok(_) => result.shard_propagations_written += 1,
                    Err(StoreError::ConditionalCheckFailed { .. }) => {
                        // Already at or past this value; absorbed silently.
                    }
                    Err(e) => result.errors.push(format!(
                        "shard-count propagation to {ns}/{entity_id}/{resource}#{shard} failed: {e}"
                    )),
                }
            }
        }

        // Step 5: proactive refill under the `rf` optimistic lock.
        for agg in aggregated.values() {
            let expected_rf = agg.latest.rf_ms;
            let mut actions = Vec::new();
            for (name, state) in agg.latest.user_limits() {
                let cfg = LimitConfig {
                    capacity_milli: state.cp_milli,
                    burst_milli: state.bx_milli,
                    refill_amount_milli: state.ra_milli,
                    refill_period_ms: state.rp_ms,
                };
                let refill = bucket_math::apply_refill(state.tk_milli, expected_rf, now_ms, &cfg);
                let refill_delta = refill.effective_tk_milli - state.tk_milli;
                if refill_delta <= 0 {
                    continue;
                }
                let consumed_this_batch = agg.tc_delta_milli.get(name).copied().unwrap_or(0);
                if refill_delta >= consumed_this_batch {
                    // The client-driven lazy refill already covers observed
                    // demand; nothing proactive to do here.
                    continue;
                }
                actions.push(UpdateAction::Add(format!("b_{name}_tk"), refill_delta));
            }
            if actions.is_empty() {
                continue;
            }
            actions.push(UpdateAction::Set(
                "rf".to_string(),
                crate::store::AttributeValue::N(now_ms),
            ));
            let (pk, sk) = keys::pk_bucket(&agg.latest.ns, &agg.latest.entity_id, &agg.latest.resource, agg.latest.shard);
            let req = UpdateItemRequest {
                pk: pk.clone(),
                sk: sk.to_string(),
                actions,
                condition: Some(Condition::NumEq("rf".to_string(), expected_rf)),
                return_values: crate::store::ReturnValues::None,
            };
            match self.repository.store().update_item(req).await {
                Ok(_) => result.refills_written += 1,
                Err(StoreError::ConditionalCheckFailed { .. }) => {
                    // Raced a client slow-path refill; skip silently.
                }
                Err(e) => result.errors.push(format!("aggregator refill failed for {pk}: {e}")),
            }
        }

        // Step 6: usage snapshots, summed across shards, per (entity,
        // resource), excluding `wcu`.
        let mut per_entity_resource: BTreeMap<(String, String, String), BTreeMap<String, i64>> = BTreeMap::new();
        for agg in aggregated.values() {
            let key = (agg.latest.ns.clone(), agg.latest.entity_id.clone(), agg.latest.resource.clone());
            let entry = per_entity_resource.entry(key).or_default();
            for (name, delta) in &agg.tc_delta_milli {
                if name == RESERVED_LIMIT_NAME {
                    continue;
                }
                *entry.entry(name.clone()).or_insert(0) += delta;
            }
        }

        for ((ns, entity_id, resource), consumed_milli) in per_entity_resource {
            if consumed_milli.is_empty() {
                continue;
            }
            for window in &self.windows {
                let window_key = window.window_key(now_ms);
                let snapshot = UsageSnapshot {
                    ns: ns.clone(),
                    entity_id: entity_id.clone(),
                    resource: resource.clone(),
                    window_key,
                    consumed_milli: consumed_milli.clone(),
                };
                let item = snapshot.to_item();
                let (pk, sk) = (item.pk().unwrap_or_default().to_string(), item.sk().unwrap_or_default().to_string());
                let mut actions: Vec<UpdateAction> = consumed_milli
                    .iter()
                    .map(|(name, delta)| UpdateAction::Add(format!("b_{name}_tc"), *delta))
                    .collect();
                actions.push(UpdateAction::Set(
                    "GSI2PK".to_string(),
                    crate::store::AttributeValue::S(keys::gsi2pk_resource(&ns, &resource)),
                ));
                actions.push(UpdateAction::Set(
                    "GSI4PK".to_string(),
                    crate::store::AttributeValue::S(keys::gsi4pk_namespace(&ns)),
                ));
                let req = UpdateItemRequest {
                    pk: pk.clone(),
                    sk: sk.clone(),
                    actions,
                    condition: None,
                    return_values: crate::store::ReturnValues::None,
                };
                match self.repository.store().update_item(req).await {
                    Ok(_) => result.usage_snapshots_written += 1,
                    Err(e) => result.errors.push(format!("usage snapshot write failed for {pk}#{sk}: {e}")),
                }
            }
        }

        result
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::clock::TestClock;
    use crate::config::RepositoryConfig;
    use crate::model::{Entity, Limit};
    use crate::repository::Repository;
    use crate::store::memory::MemoryStore;
    use std::collections::BTreeMap as Map;

    fn rpm(capacity: i64) -> Limit {
        Limit {
            name: "rpm".to_string(),
            capacity,
            burst: capacity,
            refill_amount: capacity,
            refill_period_seconds: 60,
        }
    }

    fn rpm_limits(capacity: i64) -> Map<String, Limit> {
        let mut limits = Map::new();
        limits.insert("rpm".to_string(), rpm(capacity));
        limits
    }

    async fn repo_with_bucket(capacity: i64) -> (Arc<Repository<MemoryStore>>, &'static str) {
        let repo = Arc::new(Repository::new(
            Arc::new(MemoryStore::new()),
            RepositoryConfig::default(),
            Arc::new(TestClock::new(0)),
        ));
        let ns = "ns00000000a";
        repo.create_entity(
            ns,
            Entity {
                entity_id: "e1".to_string(),
                parent_id: None,
                cascade: false,
                created_at_ms: 0,
            },
        )
        .await
        .unwrap();
        repo.set_resource_limits(ns, "r1", &[rpm(capacity)]).await.unwrap();
        (repo, ns)
    }

    #[tokio::test]
    async fn usage_snapshot_excludes_wcu_and_sums_across_shards() {
        let (repo, ns) = repo_with_bucket(100).await;
        let mut consume = Map::new();
        consume.insert("rpm".to_string(), 1000);
        let store = repo.store().clone();

        // speculative_consume requires an existing bucket item; seed one
        // directly rather than going through the slow-path creation flow.
        let bucket = crate::model::Bucket {
            ns: ns.to_string(),
            entity_id: "e1".to_string(),
            resource: "r1".to_string(),
            shard: 0,
            rf_ms: 0,
            shard_count: 1,
            cascade: false,
            parent_id: None,
            limits: crate::repository::build_initial_bucket_limits(&rpm_limits(100), 1),
            ttl_ms: None,
        };
        repo.commit_initial(vec![Repository::<MemoryStore>::build_create_write(&bucket)])
            .await
            .unwrap();
        let _ = store.drain_stream().await;

        repo.speculative_consume(ns, "e1", "r1", &consume, 1).await.unwrap();
        let records = store.drain_stream().await;

        let aggregator = Aggregator::new(repo.clone());
        let result = aggregator.process_batch(records, 1_000).await;
        assert_eq!(result.buckets_aggregated, 1);
        assert_eq!(result.usage_snapshots_written, 2); // hourly + daily
        assert!(result.errors.is_empty());

        let (pk, sk) = keys::pk_usage(ns, "e1", "r1", &UsageWindow::Hourly.window_key(1_000));
        let item = store.get_item(&pk, &sk).await.unwrap().unwrap();
        assert_eq!(item.get_n("b_rpm_tc"), Some(1000));
        assert_eq!(item.get_n("b_wcu_tc"), None);
        assert_eq!(
            item.attrs.get("GSI4PK").and_then(crate::store::AttributeValue::as_s),
            Some(keys::gsi4pk_namespace(ns).as_str())
        );
    }

    #[tokio::test]
    async fn shard_count_propagates_from_shard_zero_to_siblings() {
        let (repo, ns) = repo_with_bucket(100).await;
        let bucket0 = crate::model::Bucket {
            ns: ns.to_string(),
            entity_id: "e1".to_string(),
            resource: "r1".to_string(),
            shard: 0,
            rf_ms: 0,
            shard_count: 1,
            cascade: false,
            parent_id: None,
            limits: crate::repository::build_initial_bucket_limits(&rpm_limits(100), 1),
            ttl_ms: None,
        };
        repo.commit_initial(vec![Repository::<MemoryStore>::build_create_write(&bucket0)])
            .await
            .unwrap();
        let store = repo.store().clone();
        let _ = store.drain_stream().await;

        repo.bump_shard_count(ns, "e1", "r1", 1).await.unwrap();
        let records = store.drain_stream().await;

        // Shard 1 doesn't exist yet in this in-memory store; the propagating
        // write still succeeds since the conditional is satisfied on a
        // missing attribute, lazily creating the sibling item's shard_count
        // field (mirrors DynamoDB upsert-on-ADD/SET semantics).
        let aggregator = Aggregator::new(repo.clone());
        let result = aggregator.process_batch(records, 2_000).await;
        assert_eq!(result.shard_propagations_written, 1);

        let (pk, sk) = keys::pk_bucket(ns, "e1", "r1", 1);
        let item = store.get_item(&pk, &sk).await.unwrap().unwrap();
        assert_eq!(item.get_n("shard_count"), Some(2));
    }

    #[tokio::test]
    async fn proactive_refill_tops_up_between_client_refills() {
        let (repo, ns) = repo_with_bucket(60).await; // 1 token/sec effective
        let bucket = crate::model::Bucket {
            ns: ns.to_string(),
            entity_id: "e1".to_string(),
            resource: "r1".to_string(),
            shard: 0,
            rf_ms: 0,
            shard_count: 1,
            cascade: false,
            parent_id: None,
            limits: crate::repository::build_initial_bucket_limits(&rpm_limits(60), 1),
            ttl_ms: None,
        };
        repo.commit_initial(vec![Repository::<MemoryStore>::build_create_write(&bucket)])
            .await
            .unwrap();
        let store = repo.store().clone();
        let _ = store.drain_stream().await;

        let mut consume = Map::new();
        consume.insert("rpm".to_string(), 60_000); // drain it fully
        let req = crate::store::UpdateItemRequest {
            pk: keys::pk_bucket(ns, "e1", "r1", 0).0,
            sk: "#STATE".to_string(),
            actions: vec![
                UpdateAction::Add("b_rpm_tk".to_string(), -60_000),
                UpdateAction::Add("b_rpm_tc".to_string(), 60_000),
            ],
            condition: None,
            return_values: crate::store::ReturnValues::None,
        };
        store.update_item(req).await.unwrap();
        let records = store.drain_stream().await;

        // 30s elapsed since rf=0: 30_000 milli should refill at 1 token/sec.
        let aggregator = Aggregator::new(repo.clone());
        let result = aggregator.process_batch(records, 30_000).await;
        assert_eq!(result.refills_written, 1);

        let (pk, sk) = keys::pk_bucket(ns, "e1", "r1", 0);
        let item = store.get_item(&pk, &sk).await.unwrap().unwrap();
        assert_eq!(item.get_n("b_rpm_tk"), Some(30_000));
        assert_eq!(item.get_n("rf"), Some(30_000));
    }
}
