//! Namespace registry (spec §4.8): opaque-ID assignment, bidirectional
//! lookup, and soft-delete/recover/purge, all living under the reserved
//! namespace [`crate::keys::REGISTRY_NAMESPACE`].

use std::sync::Arc;

use rand::Rng;

use crate::cache::TtlCache;
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::keys::{self, REGISTRY_NAMESPACE};
use crate::model::{NamespaceRecord, NamespaceStatus};
use crate::store::{Condition, Gsi, Store, StoreError, TransactWrite};
use crate::validate;

const OPAQUE_ID_LEN: usize = 11;
const OPAQUE_ID_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// Generates an 11-character opaque ID over a URL-safe alphabet,
/// regenerating if the draw starts with `-` (spec §4.8).
fn generate_opaque_id() -> String {
    loop {
        let mut rng = rand::thread_rng();
        let id: String = (0..OPAQUE_ID_LEN)
            .map(|_| OPAQUE_ID_ALPHABET[rng.gen_range(0..OPAQUE_ID_ALPHABET.len())] as char)
            .collect();
        if !id.starts_with('-') {
            return id;
        }
    }
}

/// Forward name-to-ID resolution is the only hot-path lookup (spec §5,
/// "Shared state": "namespace resolution" is a process-wide cache);
/// everything else in this module is cold administrative traffic.
pub struct NamespaceRegistry<S: Store> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    resolve_cache: TtlCache<String, String>,
}

impl<S: Store> NamespaceRegistry<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, resolve_cache_ttl_ms: Option<i64>) -> Self {
        Self {
            store,
            clock,
            resolve_cache: TtlCache::new(resolve_cache_ttl_ms),
        }
    }

    async fn fetch_forward(&self, name: &str) -> Result<Option<NamespaceRecord>> {
        let pk = keys::pk_namespace_registry(REGISTRY_NAMESPACE);
        let sk = keys::sk_namespace_forward(name);
        let item = self
            .store
            .get_item(&pk, &sk)
            .await
            .map_err(|e| Error::unavailable(e.to_string()))?;
        Ok(item.as_ref().and_then(NamespaceRecord::from_forward_item))
    }

    async fn fetch_reverse(&self, id: &str) -> Result<Option<NamespaceRecord>> {
        let pk = keys::pk_namespace_registry(REGISTRY_NAMESPACE);
        let sk = keys::sk_namespace_reverse(id);
        let item = self
            .store
            .get_item(&pk, &sk)
            .await
            .map_err(|e| Error::unavailable(e.to_string()))?;
        Ok(item.as_ref().and_then(NamespaceRecord::from_reverse_item))
    }

    /// Assigns a fresh opaque ID to `name` and writes the forward/reverse
    /// pair under a single conditional write. Idempotent on re-register: if
    /// `name` is already active, returns its existing ID rather than
    /// erroring.
    pub async fn register(&self, name: &str) -> Result<String> {
        if name == REGISTRY_NAMESPACE {
            return Err(Error::validation(format!(
                "'{REGISTRY_NAMESPACE}' is reserved for the namespace registry itself"
            )));
        }
        validate::validate_stack_name(name)?;

        if let Some(existing) = self.fetch_forward(name).await? {
            return match existing.status {
                NamespaceStatus::Active => Ok(existing.namespace_id),
                NamespaceStatus::Deleted | NamespaceStatus::Purging => Err(Error::validation(
                    format!("namespace '{name}' exists but is not active; recover it first"),
                )),
            };
        }

        let now_ms = self.clock.now_ms();
        loop {
            let id = generate_opaque_id();
            let record = NamespaceRecord {
                name: name.to_string(),
                namespace_id: id.clone(),
                status: NamespaceStatus::Active,
                created_at_ms: now_ms,
                deleted_at_ms: None,
            };
            let writes = vec![
                TransactWrite::Put {
                    item: record.to_forward_item(),
                    condition: Some(Condition::AttributeNotExists("PK".to_string())),
                },
                TransactWrite::Put {
                    item: record.to_reverse_item(),
                    condition: Some(Condition::AttributeNotExists("PK".to_string())),
                },
            ];
            match self.store.transact_write_items(writes).await {
                Ok(()) => {
                    self.resolve_cache.insert(name.to_string(), id.clone(), now_ms, 0);
                    tracing::info!(name, namespace_id = %id, "namespace registered");
                    return Ok(id);
                }
                Err(StoreError::TransactionCanceled { index: 0 }) => {
                    // Someone else registered this name concurrently.
                    if let Some(existing) = self.fetch_forward(name).await? {
                        if existing.status == NamespaceStatus::Active {
                            return Ok(existing.namespace_id);
                        }
                    }
                    return Err(Error::concurrency(format!(
                        "namespace '{name}' registration raced with a concurrent writer"
                    )));
                }
                Err(StoreError::TransactionCanceled { index: 1 }) => {
                    // The drawn opaque ID collided with an existing reverse
                    // record; vanishingly rare, just draw again.
                    continue;
                }
                Err(StoreError::TransactionCanceled { index }) => {
                    return Err(Error::concurrency(format!(
                        "namespace registration failed at unexpected item {index}"
                    )));
                }
                Err(other) => return Err(Error::unavailable(other.to_string())),
            }
        }
    }

    /// Resolves a human name to its opaque ID via the forward record.
    pub async fn resolve(&self, name: &str) -> Result<String> {
        let now_ms = self.clock.now_ms();
        if let Some((id, _)) = self.resolve_cache.get(&name.to_string(), now_ms) {
            return Ok(id);
        }
        let record = self
            .fetch_forward(name)
            .await?
            .ok_or_else(|| Error::not_found(format!("namespace '{name}' is not registered")))?;
        if record.status != NamespaceStatus::Active {
            return Err(Error::not_found(format!("namespace '{name}' is not active")));
        }
        self.resolve_cache
            .insert(name.to_string(), record.namespace_id.clone(), now_ms, 0);
        Ok(record.namespace_id)
    }

    /// Removes the forward record and marks the reverse record `deleted`
    /// (spec §4.8: "removes forward and marks reverse as `deleted`").
    pub async fn delete(&self, name: &str) -> Result<()> {
        let record = self
            .fetch_forward(name)
            .await?
            .ok_or_else(|| Error::not_found(format!("namespace '{name}' is not registered")))?;
        let now_ms = self.clock.now_ms();
        let mut deleted = record.clone();
        deleted.status = NamespaceStatus::Deleted;
        deleted.deleted_at_ms = Some(now_ms);

        let (fpk, fsk) = (
            keys::pk_namespace_registry(REGISTRY_NAMESPACE),
            keys::sk_namespace_forward(name),
        );
        self.store
            .delete_item(&fpk, &fsk, Some(Condition::AttributeExists("PK".to_string())))
            .await
            .map_err(|e| match e {
                StoreError::ConditionalCheckFailed { .. } => {
                    Error::not_found(format!("namespace '{name}' is not registered"))
                }
                other => Error::unavailable(other.to_string()),
            })?;
        self.store
            .put_item(deleted.to_reverse_item(), None)
            .await
            .map_err(|e| Error::unavailable(e.to_string()))?;
        self.resolve_cache.invalidate(&name.to_string());
        tracing::info!(name, namespace_id = %record.namespace_id, "namespace soft-deleted");
        Ok(())
    }

    /// Restores a soft-deleted namespace: re-creates the forward record and
    /// flips the reverse record back to `active`.
    pub async fn recover(&self, id: &str) -> Result<String> {
        let record = self
            .fetch_reverse(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("namespace id '{id}' is not registered")))?;
        if record.status != NamespaceStatus::Deleted {
            return Err(Error::validation(format!(
                "namespace id '{id}' is not in a deleted state"
            )));
        }
        let mut restored = record.clone();
        restored.status = NamespaceStatus::Active;
        restored.deleted_at_ms = None;

        self.store
            .put_item(
                restored.to_forward_item(),
                Some(Condition::AttributeNotExists("PK".to_string())),
            )
            .await
            .map_err(|e| match e {
                StoreError::ConditionalCheckFailed { .. } => Error::validation(format!(
                    "namespace name '{}' was re-registered by someone else; recover impossible",
                    restored.name
                )),
                other => Error::unavailable(other.to_string()),
            })?;
        self.store
            .put_item(restored.to_reverse_item(), None)
            .await
            .map_err(|e| Error::unavailable(e.to_string()))?;
        tracing::info!(namespace_id = id, name = %restored.name, "namespace recovered");
        Ok(restored.name)
    }

    /// Enumerates `GSI4PK={id}` and deletes every item belonging to the
    /// tenant namespace, then the reverse record itself (spec §4.8). This is
    /// the terminal, irreversible step; `status` moves to `purging` for the
    /// duration and the reverse record is gone once this returns `Ok`.
    pub async fn purge(&self, id: &str) -> Result<usize> {
        let record = self
            .fetch_reverse(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("namespace id '{id}' is not registered")))?;
        if record.status == NamespaceStatus::Active {
            return Err(Error::validation(format!(
                "namespace id '{id}' must be deleted before it can be purged"
            )));
        }

        let mut purging = record.clone();
        purging.status = NamespaceStatus::Purging;
        self.store
            .put_item(purging.to_reverse_item(), None)
            .await
            .map_err(|e| Error::unavailable(e.to_string()))?;

        let items = self
            .store
            .query(Gsi::Gsi4, id, false)
            .await
            .map_err(|e| Error::unavailable(e.to_string()))?;

        let mut deleted = 0usize;
        for item in items {
            let (Some(pk), Some(sk)) = (item.pk(), item.sk()) else {
                continue;
            };
            match self.store.delete_item(pk, sk, None).await {
                Ok(()) => deleted += 1,
                Err(e) => tracing::error!(pk, sk, error = %e, "purge failed to delete a namespace item"),
            }
        }

        let (rpk, rsk) = (
            keys::pk_namespace_registry(REGISTRY_NAMESPACE),
            keys::sk_namespace_reverse(id),
        );
        self.store
            .delete_item(&rpk, &rsk, None)
            .await
            .map_err(|e| Error::unavailable(e.to_string()))?;
        self.resolve_cache.invalidate(&record.name);
        tracing::warn!(namespace_id = id, deleted_items = deleted, "namespace purged");
        Ok(deleted)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::clock::TestClock;
    use crate::store::memory::MemoryStore;

    fn registry() -> NamespaceRegistry<MemoryStore> {
        NamespaceRegistry::new(Arc::new(MemoryStore::new()), Arc::new(TestClock::new(0)), Some(60_000))
    }

    #[tokio::test]
    async fn register_then_resolve_round_trips() {
        let reg = registry();
        let id = reg.register("acme-corp").await.unwrap();
        assert_eq!(id.len(), 11);
        assert!(!id.starts_with('-'));
        let resolved = reg.resolve("acme-corp").await.unwrap();
        assert_eq!(resolved, id);
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let reg = registry();
        let id1 = reg.register("acme-corp").await.unwrap();
        let id2 = reg.register("acme-corp").await.unwrap();
        assert_eq!(id1, id2);
    }

    #[tokio::test]
    async fn resolve_unregistered_name_is_not_found() {
        let reg = registry();
        let err = reg.resolve("nope").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_then_recover_restores_forward_lookup() {
        let reg = registry();
        let id = reg.register("acme-corp").await.unwrap();
        reg.delete("acme-corp").await.unwrap();
        assert!(reg.resolve("acme-corp").await.is_err());

        let name = reg.recover(&id).await.unwrap();
        assert_eq!(name, "acme-corp");
        let resolved = reg.resolve("acme-corp").await.unwrap();
        assert_eq!(resolved, id);
    }

    #[tokio::test]
    async fn purge_requires_prior_delete() {
        let reg = registry();
        let id = reg.register("acme-corp").await.unwrap();
        assert!(reg.purge(&id).await.is_err());
        reg.delete("acme-corp").await.unwrap();
        assert!(reg.purge(&id).await.is_ok());
        assert!(reg.fetch_reverse(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn purge_deletes_namespace_scoped_items() {
        let reg = registry();
        let id = reg.register("acme-corp").await.unwrap();
        reg.delete("acme-corp").await.unwrap();

        // Seed one item that belongs to the tenant namespace (GSI4PK = id).
        let mut attrs = std::collections::BTreeMap::new();
        attrs.insert("PK".to_string(), crate::store::AttributeValue::S(format!("{id}/ENTITY#e1")));
        attrs.insert("SK".to_string(), crate::store::AttributeValue::S("#META".to_string()));
        attrs.insert("GSI4PK".to_string(), crate::store::AttributeValue::S(id.clone()));
        reg.store
            .put_item(crate::store::Item { attrs }, None)
            .await
            .unwrap();

        let deleted = reg.purge(&id).await.unwrap();
        assert_eq!(deleted, 1);
    }
}
