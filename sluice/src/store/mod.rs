//! The backing-store contract (spec §6).
//!
//! `sluice` is written against a DynamoDB-class key-value store: conditional
//! writes, atomic counters, secondary indexes, and a change stream. This
//! module defines that contract as a trait so the core never depends on a
//! specific wire SDK. [`memory`] ships a faithful in-memory implementation
//! used by this crate's own tests and available to downstream integration
//! tests.

pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;

/// A single attribute value, using the store's native typed-attribute
/// format (spec §6, "Item on-wire shape"). Numeric fields are always
/// integers at this boundary — see spec §9 on rejecting malformed items
/// rather than coercing silently.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    S(String),
    N(i64),
    Bool(bool),
}

impl AttributeValue {
    pub fn as_s(&self) -> Option<&str> {
        match self {
            AttributeValue::S(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_n(&self) -> Option<i64> {
        match self {
            AttributeValue::N(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

/// A flat item: `PK`, `SK`, and domain/GSI attributes. No nested maps (spec
/// §6).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Item {
    pub attrs: BTreeMap<String, AttributeValue>,
}

impl Item {
    pub fn pk(&self) -> Option<&str> {
        self.attrs.get("PK").and_then(AttributeValue::as_s)
    }

    pub fn sk(&self) -> Option<&str> {
        self.attrs.get("SK").and_then(AttributeValue::as_s)
    }

    pub fn get_n(&self, name: &str) -> Option<i64> {
        self.attrs.get(name).and_then(AttributeValue::as_n)
    }
}

/// A primary key: `(PK, SK)`.
pub type Key = (String, String);

/// A condition on an item's current state, evaluated atomically with the
/// write it guards.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    AttributeExists(String),
    AttributeNotExists(String),
    NumGte(String, i64),
    NumEq(String, i64),
    NumLt(String, i64),
    Or(Box<Condition>, Box<Condition>),
    And(Vec<Condition>),
}

impl Condition {
    pub fn and(self, other: Condition) -> Condition {
        match self {
            Condition::And(mut v) => {
                v.push(other);
                Condition::And(v)
            }
            first => Condition::And(vec![first, other]),
        }
    }
}

/// One mutating action within an `UpdateItem` call.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateAction {
    /// Atomic increment/decrement. Commutative with concurrent `ADD`s on the
    /// same attribute.
    Add(String, i64),
    Set(String, AttributeValue),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnValues {
    None,
    AllNew,
    AllOld,
}

#[derive(Debug, Clone)]
pub struct UpdateItemRequest {
    pub pk: String,
    pub sk: String,
    pub actions: Vec<UpdateAction>,
    pub condition: Option<Condition>,
    pub return_values: ReturnValues,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateItemSuccess {
    /// Present when `return_values != None`.
    pub item: Option<Item>,
}

/// A single item operation inside a [`Store::transact_write_items`] call.
#[derive(Debug, Clone)]
pub enum TransactWrite {
    Put {
        item: Item,
        condition: Option<Condition>,
    },
    Update(UpdateItemRequest),
    Delete {
        pk: String,
        sk: String,
        condition: Option<Condition>,
    },
}

/// Errors a store adapter can surface. `ConditionalCheckFailed` is a routing
/// signal, not a genuine error — callers classify it themselves (spec §4.3,
/// §7 "Propagation policy").
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    ConditionalCheckFailed { old_item: Option<Item> },
    /// Provisioned-capacity-exceeded, or on-demand throttling whose reason
    /// string matches a per-partition key-range pattern.
    PartitionThrottled,
    /// Throttling for any other reason, or any other infrastructure failure
    /// (timeout, network). Surfaced as unavailability by callers.
    Unavailable(String),
    /// A transactional write failed because one of its member conditions
    /// failed. `index` identifies which item in the request.
    TransactionCanceled { index: usize },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::ConditionalCheckFailed { .. } => write!(f, "conditional check failed"),
            StoreError::PartitionThrottled => write!(f, "partition throttled"),
            StoreError::Unavailable(msg) => write!(f, "store unavailable: {msg}"),
            StoreError::TransactionCanceled { index } => {
                write!(f, "transaction canceled at item {index}")
            }
        }
    }
}

impl std::error::Error for StoreError {}

pub type StoreResult<T> = Result<T, StoreError>;

/// Which named global secondary index a [`Store::query`] targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gsi {
    Gsi1,
    Gsi2,
    Gsi3,
    Gsi4,
}

/// One record from the table's per-partition change stream (spec §6,
/// "Change-stream records").
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub event_name: EventName,
    pub new_image: Option<Item>,
    pub old_image: Option<Item>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventName {
    Insert,
    Modify,
    Remove,
}

/// The backing-store contract (spec §6).
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_item(&self, pk: &str, sk: &str) -> StoreResult<Option<Item>>;

    async fn batch_get_item(&self, keys: &[Key]) -> StoreResult<Vec<Option<Item>>>;

    async fn update_item(&self, req: UpdateItemRequest) -> StoreResult<UpdateItemSuccess>;

    async fn put_item(&self, item: Item, condition: Option<Condition>) -> StoreResult<()>;

    async fn delete_item(
        &self,
        pk: &str,
        sk: &str,
        condition: Option<Condition>,
    ) -> StoreResult<()>;

    /// All-or-nothing write across at most 100 items (spec §5, "Transaction
    /// limits").
    async fn transact_write_items(&self, writes: Vec<TransactWrite>) -> StoreResult<()>;

    /// Queries a named GSI by partition key. `keys_only` restricts the
    /// projection to key attributes, as used by `get_buckets`'s discovery
    /// step (spec §4.3).
    async fn query(&self, index: Gsi, pk_value: &str, keys_only: bool) -> StoreResult<Vec<Item>>;
}
