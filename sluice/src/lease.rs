//! Lease (spec §4.6): the post-admission handle returned by a successful
//! `Acquire`.
//!
//! Construction already implies the consumption is durable — by the time a
//! [`Lease`] exists, the backing store reflects it (write-on-enter). The
//! lease's only remaining job is to let the caller adjust that consumption,
//! and to compensate it if the caller's work fails.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::store::{Store, UpdateAction};

/// One bucket shard a lease actually consumed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedBucket {
    pub ns: String,
    pub entity_id: String,
    pub resource: String,
    pub shard: u32,
}

/// Handle returned by [`crate::limiter::Limiter::acquire`]. See spec §4.5's
/// lease state machine: `ACQUIRED -> COMMITTED` on clean exit (a no-op — the
/// consumption is already durable), `ACQUIRED -> COMPENSATED` on
/// [`Lease::rollback`], and repeated `ACQUIRED -> ACQUIRED` self-loops on
/// [`Lease::adjust`].
pub struct Lease<S: Store> {
    repository: Arc<crate::repository::Repository<S>>,
    buckets: Vec<ConsumedBucket>,
    consume_milli: BTreeMap<String, i64>,
    closed: AtomicBool,
}

impl<S: Store> Lease<S> {
    pub(crate) fn new(
        repository: Arc<crate::repository::Repository<S>>,
        buckets: Vec<ConsumedBucket>,
        consume_milli: BTreeMap<String, i64>,
    ) -> Self {
        Self {
            repository,
            buckets,
            consume_milli,
            closed: AtomicBool::new(false),
        }
    }

    /// A lease over nothing, for the `on_unavailable = allow` degraded path:
    /// admits the caller but never touched the store, so there is nothing to
    /// adjust or compensate.
    pub(crate) fn empty(repository: Arc<crate::repository::Repository<S>>) -> Self {
        Self::new(repository, Vec::new(), BTreeMap::new())
    }

    /// The buckets this lease actually consumed from (child, plus parent if
    /// the admission cascaded).
    pub fn buckets(&self) -> &[ConsumedBucket] {
        &self.buckets
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Unconditionally adjusts a named limit's token count on every bucket
    /// this lease holds, in whole tokens. Positive returns tokens (a
    /// caller's true cost came in under its estimate); negative adds debt (a
    /// caller's true cost exceeded its estimate). Never fails — a bucket may
    /// go negative through this path by design (spec §4.6, §9 "Open
    /// questions").
    pub async fn adjust(&self, limit_name: &str, delta_tokens: i64) {
        if self.buckets.is_empty() {
            return;
        }
        let delta_milli = delta_tokens * 1000;
        let writes = self
            .buckets
            .iter()
            .map(|b| {
                let (pk, sk) = crate::keys::pk_bucket(&b.ns, &b.entity_id, &b.resource, b.shard);
                (
                    pk,
                    sk.to_string(),
                    vec![
                        UpdateAction::Add(format!("b_{limit_name}_tk"), delta_milli),
                        UpdateAction::Add(format!("b_{limit_name}_tc"), -delta_milli),
                    ],
                )
            })
            .collect();
        self.repository.write_each(writes).await;
    }

    /// Marks the lease committed. A no-op beyond the idempotency flag: the
    /// fast path never wrote anything further, and the slow path's
    /// transaction is already durable by the time the lease was built.
    pub fn commit(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Compensates every bucket this lease consumed from, by an independent
    /// unconditional add-back of the original `consume_milli` (plus `wcu`'s
    /// fixed 1000). Idempotent: a second call after the first is a no-op.
    /// Errors from individual compensating writes are logged and swallowed
    /// by [`crate::repository::Repository::write_each`] — never surfaced,
    /// per spec §7's propagation policy.
    pub async fn rollback(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.buckets.is_empty() {
            return Ok(());
        }
        let mut per_bucket_actions = Vec::with_capacity(self.buckets.len());
        for b in &self.buckets {
            let (pk, sk) = crate::keys::pk_bucket(&b.ns, &b.entity_id, &b.resource, b.shard);
            let mut actions = Vec::with_capacity(self.consume_milli.len() * 2 + 2);
            for (name, milli) in &self.consume_milli {
                actions.push(UpdateAction::Add(format!("b_{name}_tk"), *milli));
                actions.push(UpdateAction::Add(format!("b_{name}_tc"), -milli));
            }
            actions.push(UpdateAction::Add("b_wcu_tk".to_string(), 1000));
            actions.push(UpdateAction::Add("b_wcu_tc".to_string(), -1000));
            per_bucket_actions.push((pk, sk.to_string(), actions));
        }
        self.repository.write_each(per_bucket_actions).await;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::clock::TestClock;
    use crate::config::RepositoryConfig;
    use crate::model::{Bucket, BucketLimitState};
    use crate::repository::Repository;
    use crate::store::memory::MemoryStore;
    use std::collections::BTreeMap as Map;

    fn repo() -> Arc<Repository<MemoryStore>> {
        Arc::new(Repository::new(
            Arc::new(MemoryStore::new()),
            RepositoryConfig::default(),
            Arc::new(TestClock::new(0)),
        ))
    }

    fn bucket_with_tk(tk: i64) -> Bucket {
        let mut limits = Map::new();
        limits.insert(
            "rpm".to_string(),
            BucketLimitState {
                tk_milli: tk,
                cp_milli: 100_000,
                bx_milli: 100_000,
                ra_milli: 100_000,
                rp_ms: 60_000,
                tc: 0,
            },
        );
        limits.insert(
            "wcu".to_string(),
            BucketLimitState {
                tk_milli: 999_000,
                cp_milli: 1_000_000,
                bx_milli: 1_000_000,
                ra_milli: 1_000_000,
                rp_ms: 1_000,
                tc: 1_000,
            },
        );
        Bucket {
            ns: "ns00000000a".to_string(),
            entity_id: "e1".to_string(),
            resource: "r1".to_string(),
            shard: 0,
            rf_ms: 0,
            shard_count: 1,
            cascade: false,
            parent_id: None,
            limits,
            ttl_ms: None,
        }
    }

    #[tokio::test]
    async fn rollback_adds_back_consumption_and_is_idempotent() {
        let repo = repo();
        let bucket = bucket_with_tk(90_000);
        repo.commit_initial(vec![Repository::<MemoryStore>::build_create_write(&bucket)])
            .await
            .unwrap();

        let mut consume_milli = Map::new();
        consume_milli.insert("rpm".to_string(), 10_000);
        let lease = Lease::new(
            repo.clone(),
            vec![ConsumedBucket {
                ns: "ns00000000a".to_string(),
                entity_id: "e1".to_string(),
                resource: "r1".to_string(),
                shard: 0,
            }],
            consume_milli,
        );

        lease.rollback().await.unwrap();
        let buckets = repo.get_buckets("ns00000000a", "e1", Some("r1")).await.unwrap();
        assert_eq!(buckets[0].limits["rpm"].tk_milli, 100_000);

        // second rollback is a no-op
        lease.rollback().await.unwrap();
        let buckets = repo.get_buckets("ns00000000a", "e1", Some("r1")).await.unwrap();
        assert_eq!(buckets[0].limits["rpm"].tk_milli, 100_000);
    }

    #[tokio::test]
    async fn adjust_can_push_tokens_negative() {
        let repo = repo();
        let bucket = bucket_with_tk(50_000);
        repo.commit_initial(vec![Repository::<MemoryStore>::build_create_write(&bucket)])
            .await
            .unwrap();

        let mut consume_milli = Map::new();
        consume_milli.insert("rpm".to_string(), 0);
        let lease = Lease::new(
            repo.clone(),
            vec![ConsumedBucket {
                ns: "ns00000000a".to_string(),
                entity_id: "e1".to_string(),
                resource: "r1".to_string(),
                shard: 0,
            }],
            consume_milli,
        );

        lease.adjust("rpm", -200).await;
        let buckets = repo.get_buckets("ns00000000a", "e1", Some("r1")).await.unwrap();
        assert_eq!(buckets[0].limits["rpm"].tk_milli, 50_000 - 200_000);
    }
}
