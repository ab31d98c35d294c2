//! An in-memory, single-process reference implementation of [`Store`].
//!
//! This is a first-class testing backend, not a `#[cfg(test)]`-only stub: it
//! reproduces conditional-write semantics, all-or-nothing transactions,
//! secondary-index queries, and change-stream emission faithfully enough
//! that the scenarios in spec §8 can be expressed as ordinary
//! `#[tokio::test]` functions with no network dependency. It is exported so
//! downstream crates can write their own integration tests the same way.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    AttributeValue, ChangeRecord, Condition, EventName, Gsi, Item, Key, ReturnValues, Store,
    StoreError, StoreResult, TransactWrite, UpdateAction, UpdateItemRequest, UpdateItemSuccess,
};

fn gsi_attr(index: Gsi) -> &'static str {
    match index {
        Gsi::Gsi1 => "GSI1PK",
        Gsi::Gsi2 => "GSI2PK",
        Gsi::Gsi3 => "GSI3PK",
        Gsi::Gsi4 => "GSI4PK",
    }
}

fn eval_condition(item: Option<&Item>, cond: &Condition) -> bool {
    match cond {
        Condition::AttributeExists(name) => item.is_some_and(|i| i.attrs.contains_key(name)),
        Condition::AttributeNotExists(name) => !item.is_some_and(|i| i.attrs.contains_key(name)),
        Condition::NumGte(name, val) => item
            .and_then(|i| i.get_n(name))
            .is_some_and(|n| n >= *val),
        Condition::NumEq(name, val) => item.and_then(|i| i.get_n(name)).is_some_and(|n| n == *val),
        Condition::NumLt(name, val) => item.and_then(|i| i.get_n(name)).is_some_and(|n| n < *val),
        Condition::Or(a, b) => eval_condition(item, a) || eval_condition(item, b),
        Condition::And(conds) => conds.iter().all(|c| eval_condition(item, c)),
    }
}

fn apply_actions(mut item: Item, pk: &str, sk: &str, actions: &[UpdateAction]) -> Item {
    item.attrs
        .entry("PK".to_string())
        .or_insert_with(|| AttributeValue::S(pk.to_string()));
    item.attrs
        .entry("SK".to_string())
        .or_insert_with(|| AttributeValue::S(sk.to_string()));
    for action in actions {
        match action {
            UpdateAction::Add(name, delta) => {
                let current = item.get_n(name).unwrap_or(0);
                item.attrs
                    .insert(name.clone(), AttributeValue::N(current + delta));
            }
            UpdateAction::Set(name, value) => {
                item.attrs.insert(name.clone(), value.clone());
            }
        }
    }
    item
}

/// A forced-failure hook used by tests that exercise the `UNAVAILABLE` and
/// `PARTITION_THROTTLED` paths without a real store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fault {
    #[default]
    None,
    PartitionThrottled,
    Unavailable,
}

#[derive(Default)]
struct Inner {
    items: BTreeMap<Key, Item>,
    stream: Vec<ChangeRecord>,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    fault_keys: Mutex<BTreeMap<Key, Fault>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            fault_keys: Mutex::new(BTreeMap::new()),
        }
    }

    /// Arranges for the next write to `(pk, sk)` to fail with the given
    /// infrastructure fault, instead of evaluating normally. Consumed after
    /// one use.
    pub async fn inject_fault(&self, pk: impl Into<String>, sk: impl Into<String>, fault: Fault) {
        self.fault_keys.lock().await.insert((pk.into(), sk.into()), fault);
    }

    async fn take_fault(&self, pk: &str, sk: &str) -> Fault {
        self.fault_keys
            .lock()
            .await
            .remove(&(pk.to_string(), sk.to_string()))
            .unwrap_or(Fault::None)
    }

    /// Drains the accumulated change-stream records, in write order. Used by
    /// tests and by an aggregator driver loop to pull batches.
    pub async fn drain_stream(&self) -> Vec<ChangeRecord> {
        let mut guard = self.inner.lock().await;
        std::mem::take(&mut guard.stream)
    }

    /// Total number of live items, for test assertions.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_item(&self, pk: &str, sk: &str) -> StoreResult<Option<Item>> {
        let guard = self.inner.lock().await;
        Ok(guard.items.get(&(pk.to_string(), sk.to_string())).cloned())
    }

    async fn batch_get_item(&self, keys: &[Key]) -> StoreResult<Vec<Option<Item>>> {
        let guard = self.inner.lock().await;
        Ok(keys.iter().map(|k| guard.items.get(k).cloned()).collect())
    }

    async fn update_item(&self, req: UpdateItemRequest) -> StoreResult<UpdateItemSuccess> {
        match self.take_fault(&req.pk, &req.sk).await {
            Fault::None => {}
            Fault::PartitionThrottled => return Err(StoreError::PartitionThrottled),
            Fault::Unavailable => return Err(StoreError::Unavailable("injected fault".into())),
        }

        let mut guard = self.inner.lock().await;
        let key = (req.pk.clone(), req.sk.clone());
        let old_item = guard.items.get(&key).cloned();

        if let Some(cond) = &req.condition {
            if !eval_condition(old_item.as_ref(), cond) {
                return Err(StoreError::ConditionalCheckFailed {
                    old_item: old_item.clone(),
                });
            }
        }

        let base = old_item.clone().unwrap_or_default();
        let new_item = apply_actions(base, &req.pk, &req.sk, &req.actions);
        guard.items.insert(key, new_item.clone());
        guard.stream.push(ChangeRecord {
            event_name: if old_item.is_some() {
                EventName::Modify
            } else {
                EventName::Insert
            },
            new_image: Some(new_item.clone()),
            old_image: old_item.clone(),
        });

        let item = match req.return_values {
            ReturnValues::None => None,
            ReturnValues::AllNew => Some(new_item),
            ReturnValues::AllOld => old_item,
        };
        Ok(UpdateItemSuccess { item })
    }

    async fn put_item(&self, item: Item, condition: Option<Condition>) -> StoreResult<()> {
        let mut guard = self.inner.lock().await;
        let key = (
            item.pk().unwrap_or_default().to_string(),
            item.sk().unwrap_or_default().to_string(),
        );
        let old_item = guard.items.get(&key).cloned();
        if let Some(cond) = &condition {
            if !eval_condition(old_item.as_ref(), cond) {
                return Err(StoreError::ConditionalCheckFailed { old_item });
            }
        }
        guard.items.insert(key, item.clone());
        guard.stream.push(ChangeRecord {
            event_name: if old_item.is_some() {
                EventName::Modify
            } else {
                EventName::Insert
            },
            new_image: Some(item),
            old_image: old_item,
        });
        Ok(())
    }

    async fn delete_item(
        &self,
        pk: &str,
        sk: &str,
        condition: Option<Condition>,
    ) -> StoreResult<()> {
        let mut guard = self.inner.lock().await;
        let key = (pk.to_string(), sk.to_string());
        let old_item = guard.items.get(&key).cloned();
        if let Some(cond) = &condition {
            if !eval_condition(old_item.as_ref(), cond) {
                return Err(StoreError::ConditionalCheckFailed { old_item });
            }
        }
        guard.items.remove(&key);
        if let Some(old) = old_item {
            guard.stream.push(ChangeRecord {
                event_name: EventName::Remove,
                new_image: None,
                old_image: Some(old),
            });
        }
        Ok(())
    }

    async fn transact_write_items(&self, writes: Vec<TransactWrite>) -> StoreResult<()> {
        let mut guard = self.inner.lock().await;

        for (index, write) in writes.iter().enumerate() {
            let (key, condition) = match write {
                TransactWrite::Put { item, condition } => (
                    (
                        item.pk().unwrap_or_default().to_string(),
                        item.sk().unwrap_or_default().to_string(),
                    ),
                    condition.clone(),
                ),
                TransactWrite::Update(req) => {
                    ((req.pk.clone(), req.sk.clone()), req.condition.clone())
                }
                TransactWrite::Delete { pk, sk, condition } => {
                    ((pk.clone(), sk.clone()), condition.clone())
                }
            };
            if let Some(cond) = condition {
                let existing = guard.items.get(&key);
                if !eval_condition(existing, &cond) {
                    return Err(StoreError::TransactionCanceled { index });
                }
            }
        }

        let mut records = Vec::with_capacity(writes.len());
        for write in writes {
            match write {
                TransactWrite::Put { item, .. } => {
                    let key = (
                        item.pk().unwrap_or_default().to_string(),
                        item.sk().unwrap_or_default().to_string(),
                    );
                    let old = guard.items.insert(key, item.clone());
                    records.push(ChangeRecord {
                        event_name: if old.is_some() {
                            EventName::Modify
                        } else {
                            EventName::Insert
                        },
                        new_image: Some(item),
                        old_image: old,
                    });
                }
                TransactWrite::Update(req) => {
                    let key = (req.pk.clone(), req.sk.clone());
                    let old = guard.items.get(&key).cloned();
                    let new_item =
                        apply_actions(old.clone().unwrap_or_default(), &req.pk, &req.sk, &req.actions);
                    guard.items.insert(key, new_item.clone());
                    records.push(ChangeRecord {
                        event_name: if old.is_some() {
                            EventName::Modify
                        } else {
                            EventName::Insert
                        },
                        new_image: Some(new_item),
                        old_image: old,
                    });
                }
                TransactWrite::Delete { pk, sk, .. } => {
                    let key = (pk, sk);
                    if let Some(old) = guard.items.remove(&key) {
                        records.push(ChangeRecord {
                            event_name: EventName::Remove,
                            new_image: None,
                            old_image: Some(old),
                        });
                    }
                }
            }
        }
        guard.stream.extend(records);
        Ok(())
    }

    async fn query(&self, index: Gsi, pk_value: &str, keys_only: bool) -> StoreResult<Vec<Item>> {
        let guard = self.inner.lock().await;
        let attr = gsi_attr(index);
        let mut out = Vec::new();
        for item in guard.items.values() {
            let matches = item
                .attrs
                .get(attr)
                .and_then(AttributeValue::as_s)
                .is_some_and(|v| v == pk_value);
            if !matches {
                continue;
            }
            if keys_only {
                let mut attrs = BTreeMap::new();
                for key_name in ["PK", "SK", attr] {
                    if let Some(v) = item.attrs.get(key_name) {
                        attrs.insert(key_name.to_string(), v.clone());
                    }
                }
                out.push(Item { attrs });
            } else {
                out.push(item.clone());
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn conditional_update_creates_and_blocks_missing() {
        let store = MemoryStore::new();
        let req = UpdateItemRequest {
            pk: "ns/BUCKET#e#r#0".into(),
            sk: "#STATE".into(),
            actions: vec![UpdateAction::Add("b_rpm_tk".into(), -1000)],
            condition: Some(Condition::AttributeExists("PK".into())),
            return_values: ReturnValues::AllOld,
        };
        let err = store.update_item(req).await.unwrap_err();
        assert!(matches!(err, StoreError::ConditionalCheckFailed { old_item: None }));
    }

    #[tokio::test]
    async fn transaction_is_all_or_nothing() {
        let store = MemoryStore::new();
        let writes = vec![
            TransactWrite::Put {
                item: {
                    let mut attrs = BTreeMap::new();
                    attrs.insert("PK".into(), AttributeValue::S("a".into()));
                    attrs.insert("SK".into(), AttributeValue::S("b".into()));
                    Item { attrs }
                },
                condition: None,
            },
            TransactWrite::Delete {
                pk: "missing".into(),
                sk: "missing".into(),
                condition: Some(Condition::AttributeExists("PK".into())),
            },
        ];
        let err = store.transact_write_items(writes).await.unwrap_err();
        assert_eq!(err, StoreError::TransactionCanceled { index: 1 });
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn query_filters_by_gsi_pk() {
        let store = MemoryStore::new();
        let mut attrs = BTreeMap::new();
        attrs.insert("PK".into(), AttributeValue::S("x".into()));
        attrs.insert("SK".into(), AttributeValue::S("y".into()));
        attrs.insert("GSI3PK".into(), AttributeValue::S("ns/ENTITY#e1".into()));
        store.put_item(Item { attrs }, None).await.unwrap();

        let results = store.query(Gsi::Gsi3, "ns/ENTITY#e1", false).await.unwrap();
        assert_eq!(results.len(), 1);
        let none = store.query(Gsi::Gsi3, "ns/ENTITY#other", false).await.unwrap();
        assert!(none.is_empty());
    }
}
