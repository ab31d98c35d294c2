//! Durable item shapes (spec §3), expressed as typed Rust structs layered
//! over the generic [`crate::store::Item`] the store trait moves around.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::store::{AttributeValue, Item};
use crate::validate::RESERVED_LIMIT_NAME;

/// A rate-limited identity (API key, user, project).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub entity_id: String,
    pub parent_id: Option<String>,
    pub cascade: bool,
    pub created_at_ms: i64,
}

impl Entity {
    pub fn to_item(&self, ns: &str) -> Item {
        let (pk, sk) = crate::keys::pk_entity_meta(ns, &self.entity_id);
        let mut attrs = BTreeMap::new();
        attrs.insert("PK".to_string(), AttributeValue::S(pk));
        attrs.insert("SK".to_string(), AttributeValue::S(sk.to_string()));
        attrs.insert("cascade".to_string(), AttributeValue::Bool(self.cascade));
        attrs.insert(
            "created_at".to_string(),
            AttributeValue::N(self.created_at_ms),
        );
        attrs.insert(
            "GSI4PK".to_string(),
            AttributeValue::S(crate::keys::gsi4pk_namespace(ns)),
        );
        if let Some(parent) = &self.parent_id {
            attrs.insert("parent_id".to_string(), AttributeValue::S(parent.clone()));
            attrs.insert(
                "GSI1PK".to_string(),
                AttributeValue::S(crate::keys::gsi1pk_parent(ns, parent)),
            );
        }
        Item { attrs }
    }

    pub fn from_item(item: &Item) -> Option<Self> {
        let pk = item.attrs.get("PK")?.as_s()?;
        let entity_id = pk.rsplit("ENTITY#").next()?.to_string();
        let cascade = item
            .attrs
            .get("cascade")
            .and_then(AttributeValue::as_bool)
            .unwrap_or(false);
        let created_at_ms = item.get_n("created_at").unwrap_or(0);
        let parent_id = item
            .attrs
            .get("parent_id")
            .and_then(AttributeValue::as_s)
            .map(str::to_string);
        Some(Self {
            entity_id,
            parent_id,
            cascade,
            created_at_ms,
        })
    }
}

/// A named token bucket definition, in whole-token units as supplied by
/// callers; converted to milli-units at the repository boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Limit {
    pub name: String,
    pub capacity: i64,
    pub burst: i64,
    pub refill_amount: i64,
    pub refill_period_seconds: i64,
}

impl Limit {
    pub fn to_milli_config(&self) -> crate::bucket_math::LimitConfig {
        crate::bucket_math::LimitConfig {
            capacity_milli: self.capacity * 1000,
            burst_milli: self.burst * 1000,
            refill_amount_milli: self.refill_amount * 1000,
            refill_period_ms: self.refill_period_seconds * 1000,
        }
    }

    /// The auto-injected infrastructure limit: 1000 tokens, 1000/sec refill,
    /// burst equal to capacity. Never divided by shard count.
    pub fn wcu() -> Self {
        Self {
            name: RESERVED_LIMIT_NAME.to_string(),
            capacity: 1000,
            burst: 1000,
            refill_amount: 1000,
            refill_period_seconds: 1,
        }
    }
}

/// Per-limit bucket fields, using the `b_{name}_{field}` attribute layout
/// from spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketLimitState {
    pub tk_milli: i64,
    pub cp_milli: i64,
    pub bx_milli: i64,
    pub ra_milli: i64,
    pub rp_ms: i64,
    pub tc: i64,
}

/// One shard of one (entity, resource) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    pub ns: String,
    pub entity_id: String,
    pub resource: String,
    pub shard: u32,
    /// Last refill timestamp, ms. Shared across all limits in the item.
    pub rf_ms: i64,
    /// Authoritative only on shard 0; elsewhere a possibly-stale copy.
    pub shard_count: u32,
    pub cascade: bool,
    pub parent_id: Option<String>,
    pub limits: BTreeMap<String, BucketLimitState>,
    /// Absolute expiry, ms, set only when the governing config is a
    /// resource/system default rather than an explicit per-entity one (spec
    /// §3). `None` means the bucket never expires.
    pub ttl_ms: Option<i64>,
}

impl Bucket {
    pub fn user_limits(&self) -> impl Iterator<Item = (&String, &BucketLimitState)> {
        self.limits
            .iter()
            .filter(|(name, _)| name.as_str() != RESERVED_LIMIT_NAME)
    }

    pub fn wcu(&self) -> Option<&BucketLimitState> {
        self.limits.get(RESERVED_LIMIT_NAME)
    }

    fn attr_name(limit: &str, field: &str) -> String {
        format!("b_{limit}_{field}")
    }

    /// Serializes into a generic store [`Item`], including key attributes and
    /// GSI projections.
    pub fn to_item(&self) -> Item {
        let (pk, sk) = crate::keys::pk_bucket(&self.ns, &self.entity_id, &self.resource, self.shard);
        let mut attrs = BTreeMap::new();
        attrs.insert("PK".to_string(), AttributeValue::S(pk));
        attrs.insert("SK".to_string(), AttributeValue::S(sk.to_string()));
        attrs.insert("rf".to_string(), AttributeValue::N(self.rf_ms));
        attrs.insert(
            "shard_count".to_string(),
            AttributeValue::N(self.shard_count as i64),
        );
        attrs.insert("cascade".to_string(), AttributeValue::Bool(self.cascade));
        if let Some(p) = &self.parent_id {
            attrs.insert("parent_id".to_string(), AttributeValue::S(p.clone()));
        }
        if let Some(ttl) = self.ttl_ms {
            attrs.insert("ttl".to_string(), AttributeValue::N(ttl));
        }
        attrs.insert(
            "GSI2PK".to_string(),
            AttributeValue::S(crate::keys::gsi2pk_resource(&self.ns, &self.resource)),
        );
        attrs.insert(
            "GSI3PK".to_string(),
            AttributeValue::S(crate::keys::gsi3pk_entity(&self.ns, &self.entity_id)),
        );
        attrs.insert(
            "GSI4PK".to_string(),
            AttributeValue::S(crate::keys::gsi4pk_namespace(&self.ns)),
        );
        for (name, state) in &self.limits {
            attrs.insert(Self::attr_name(name, "tk"), AttributeValue::N(state.tk_milli));
            attrs.insert(Self::attr_name(name, "cp"), AttributeValue::N(state.cp_milli));
            attrs.insert(Self::attr_name(name, "bx"), AttributeValue::N(state.bx_milli));
            attrs.insert(Self::attr_name(name, "ra"), AttributeValue::N(state.ra_milli));
            attrs.insert(Self::attr_name(name, "rp"), AttributeValue::N(state.rp_ms));
            attrs.insert(Self::attr_name(name, "tc"), AttributeValue::N(state.tc));
        }
        Item { attrs }
    }

    /// Parses a generic store [`Item`] back into a typed `Bucket`. Returns
    /// `None` if the item is not a well-formed bucket item (e.g. malformed
    /// numeric fields arriving as non-numbers — see spec §9 on strict
    /// parsing at the storage boundary).
    pub fn from_item(item: &Item) -> Option<Self> {
        let pk = item.attrs.get("PK")?.as_s()?;
        let (ns, entity_id, resource, shard) = crate::keys::parse_bucket_pk(pk)?;
        let rf_ms = item.attrs.get("rf")?.as_n()?;
        let shard_count = item.attrs.get("shard_count")?.as_n()? as u32;
        let cascade = item
            .attrs
            .get("cascade")
            .and_then(AttributeValue::as_bool)
            .unwrap_or(false);
        let parent_id = item
            .attrs
            .get("parent_id")
            .and_then(AttributeValue::as_s)
            .map(str::to_string);
        let ttl_ms = item.attrs.get("ttl").and_then(AttributeValue::as_n);

        let mut limits: BTreeMap<String, BucketLimitState> = BTreeMap::new();
        for key in item.attrs.keys() {
            let Some(rest) = key.strip_prefix("b_") else {
                continue;
            };
            let Some(rest) = rest.strip_suffix("_tk") else {
                continue;
            };
            let name = rest.to_string();
            let tk_milli = item.attrs.get(&Self::attr_name(&name, "tk"))?.as_n()?;
            let cp_milli = item.attrs.get(&Self::attr_name(&name, "cp"))?.as_n()?;
            let bx_milli = item.attrs.get(&Self::attr_name(&name, "bx"))?.as_n()?;
            let ra_milli = item.attrs.get(&Self::attr_name(&name, "ra"))?.as_n()?;
            let rp_ms = item.attrs.get(&Self::attr_name(&name, "rp"))?.as_n()?;
            let tc = item.attrs.get(&Self::attr_name(&name, "tc"))?.as_n()?;
            limits.insert(
                name,
                BucketLimitState {
                    tk_milli,
                    cp_milli,
                    bx_milli,
                    ra_milli,
                    rp_ms,
                    tc,
                },
            );
        }

        Some(Self {
            ns,
            entity_id,
            resource,
            shard,
            rf_ms,
            shard_count,
            cascade,
            parent_id,
            limits,
            ttl_ms,
        })
    }
}

/// One level of the config hierarchy's stored limits (spec §3, "Config
/// items").
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConfigLevel {
    pub limits: BTreeMap<String, Limit>,
    pub config_version: i64,
}

impl ConfigLevel {
    fn attr_name(limit: &str, field: &str) -> String {
        format!("b_{limit}_{field}")
    }

    pub fn to_item(&self, ns: &str, pk: &str, sk: &str) -> Item {
        let mut attrs = BTreeMap::new();
        attrs.insert("PK".to_string(), AttributeValue::S(pk.to_string()));
        attrs.insert("SK".to_string(), AttributeValue::S(sk.to_string()));
        attrs.insert(
            "GSI4PK".to_string(),
            AttributeValue::S(crate::keys::gsi4pk_namespace(ns)),
        );
        attrs.insert(
            "config_version".to_string(),
            AttributeValue::N(self.config_version),
        );
        for (name, limit) in &self.limits {
            attrs.insert(Self::attr_name(name, "cp"), AttributeValue::N(limit.capacity * 1000));
            attrs.insert(Self::attr_name(name, "bx"), AttributeValue::N(limit.burst * 1000));
            attrs.insert(
                Self::attr_name(name, "ra"),
                AttributeValue::N(limit.refill_amount * 1000),
            );
            attrs.insert(
                Self::attr_name(name, "rp"),
                AttributeValue::N(limit.refill_period_seconds * 1000),
            );
        }
        Item { attrs }
    }

    pub fn from_item(item: &Item) -> Option<Self> {
        let config_version = item.get_n("config_version").unwrap_or(0);
        let mut limits = BTreeMap::new();
        for key in item.attrs.keys() {
            let Some(rest) = key.strip_prefix("b_") else {
                continue;
            };
            let Some(name) = rest.strip_suffix("_cp") else {
                continue;
            };
            let cp = item.attrs.get(&Self::attr_name(name, "cp"))?.as_n()?;
            let bx = item.attrs.get(&Self::attr_name(name, "bx"))?.as_n()?;
            let ra = item.attrs.get(&Self::attr_name(name, "ra"))?.as_n()?;
            let rp = item.attrs.get(&Self::attr_name(name, "rp"))?.as_n()?;
            limits.insert(
                name.to_string(),
                Limit {
                    name: name.to_string(),
                    capacity: cp / 1000,
                    burst: bx / 1000,
                    refill_amount: ra / 1000,
                    refill_period_seconds: rp / 1000,
                },
            );
        }
        Some(Self {
            limits,
            config_version,
        })
    }
}

/// A usage snapshot for one (entity, resource, window).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub ns: String,
    pub entity_id: String,
    pub resource: String,
    pub window_key: String,
    /// Consumed tokens per limit, in milli-units, excluding `wcu`.
    pub consumed_milli: BTreeMap<String, i64>,
}

impl UsageSnapshot {
    fn attr_name(limit: &str) -> String {
        format!("b_{limit}_tc")
    }

    /// `PK=ENTITY#{id}, SK=#USAGE#{resource}#{window_key}`, `GSI2` projected
    /// by resource (spec §3, "Usage snapshots"). Flat item, no nested maps.
    pub fn to_item(&self) -> Item {
        let (pk, sk) = crate::keys::pk_usage(&self.ns, &self.entity_id, &self.resource, &self.window_key);
        let mut attrs = BTreeMap::new();
        attrs.insert("PK".to_string(), AttributeValue::S(pk));
        attrs.insert("SK".to_string(), AttributeValue::S(sk));
        attrs.insert(
            "GSI2PK".to_string(),
            AttributeValue::S(crate::keys::gsi2pk_resource(&self.ns, &self.resource)),
        );
        attrs.insert(
            "GSI4PK".to_string(),
            AttributeValue::S(crate::keys::gsi4pk_namespace(&self.ns)),
        );
        for (name, milli) in &self.consumed_milli {
            attrs.insert(Self::attr_name(name), AttributeValue::N(*milli));
        }
        Item { attrs }
    }

    pub fn from_item(ns: &str, item: &Item) -> Option<Self> {
        let pk = item.attrs.get("PK")?.as_s()?;
        let sk = item.attrs.get("SK")?.as_s()?;
        let entity_id = pk.strip_prefix(&format!("{ns}/ENTITY#"))?.to_string();
        let rest = sk.strip_prefix("#USAGE#")?;
        let (resource, window_key) = rest.rsplit_once('#')?;
        let mut consumed_milli = BTreeMap::new();
        for key in item.attrs.keys() {
            let Some(name) = key.strip_prefix("b_").and_then(|r| r.strip_suffix("_tc")) else {
                continue;
            };
            if let Some(milli) = item.attrs.get(key).and_then(AttributeValue::as_n) {
                consumed_milli.insert(name.to_string(), milli);
            }
        }
        Some(Self {
            ns: ns.to_string(),
            entity_id,
            resource: resource.to_string(),
            window_key: window_key.to_string(),
            consumed_milli,
        })
    }
}

/// The namespace registry's forward/reverse record pair (spec §4.8).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceRecord {
    pub name: String,
    pub namespace_id: String,
    pub status: NamespaceStatus,
    pub created_at_ms: i64,
    pub deleted_at_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NamespaceStatus {
    Active,
    Deleted,
    Purging,
}

impl NamespaceStatus {
    fn as_str(self) -> &'static str {
        match self {
            NamespaceStatus::Active => "active",
            NamespaceStatus::Deleted => "deleted",
            NamespaceStatus::Purging => "purging",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(NamespaceStatus::Active),
            "deleted" => Some(NamespaceStatus::Deleted),
            "purging" => Some(NamespaceStatus::Purging),
            _ => None,
        }
    }
}

impl NamespaceRecord {
    /// The forward record: `PK=_/REGISTRY#, SK=#NAMESPACE#{name}`.
    pub fn to_forward_item(&self) -> Item {
        let pk = crate::keys::pk_namespace_registry(crate::keys::REGISTRY_NAMESPACE);
        let sk = crate::keys::sk_namespace_forward(&self.name);
        let mut attrs = BTreeMap::new();
        attrs.insert("PK".to_string(), AttributeValue::S(pk));
        attrs.insert("SK".to_string(), AttributeValue::S(sk));
        attrs.insert(
            "namespace_id".to_string(),
            AttributeValue::S(self.namespace_id.clone()),
        );
        attrs.insert(
            "status".to_string(),
            AttributeValue::S(self.status.as_str().to_string()),
        );
        attrs.insert("created_at".to_string(), AttributeValue::N(self.created_at_ms));
        Item { attrs }
    }

    pub fn from_forward_item(item: &Item) -> Option<Self> {
        let sk = item.attrs.get("SK")?.as_s()?;
        let name = sk.strip_prefix("#NAMESPACE#")?.to_string();
        let namespace_id = item.attrs.get("namespace_id")?.as_s()?.to_string();
        let status = NamespaceStatus::parse(item.attrs.get("status")?.as_s()?)?;
        let created_at_ms = item.get_n("created_at").unwrap_or(0);
        Some(Self {
            name,
            namespace_id,
            status,
            created_at_ms,
            deleted_at_ms: None,
        })
    }

    /// The reverse record: `PK=_/REGISTRY#, SK=#NSID#{id}`.
    pub fn to_reverse_item(&self) -> Item {
        let pk = crate::keys::pk_namespace_registry(crate::keys::REGISTRY_NAMESPACE);
        let sk = crate::keys::sk_namespace_reverse(&self.namespace_id);
        let mut attrs = BTreeMap::new();
        attrs.insert("PK".to_string(), AttributeValue::S(pk));
        attrs.insert("SK".to_string(), AttributeValue::S(sk));
        attrs.insert("name".to_string(), AttributeValue::S(self.name.clone()));
        attrs.insert(
            "status".to_string(),
            AttributeValue::S(self.status.as_str().to_string()),
        );
        attrs.insert("created_at".to_string(), AttributeValue::N(self.created_at_ms));
        if let Some(deleted_at) = self.deleted_at_ms {
            attrs.insert("deleted_at".to_string(), AttributeValue::N(deleted_at));
        }
        Item { attrs }
    }

    pub fn from_reverse_item(item: &Item) -> Option<Self> {
        let sk = item.attrs.get("SK")?.as_s()?;
        let namespace_id = sk.strip_prefix("#NSID#")?.to_string();
        let name = item.attrs.get("name")?.as_s()?.to_string();
        let status = NamespaceStatus::parse(item.attrs.get("status")?.as_s()?)?;
        let created_at_ms = item.get_n("created_at").unwrap_or(0);
        let deleted_at_ms = item.get_n("deleted_at");
        Some(Self {
            name,
            namespace_id,
            status,
            created_at_ms,
            deleted_at_ms,
        })
    }
}

/// The schema-version record (spec §3, "Version record").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionRecord {
    pub schema_version: u32,
    pub aggregator_version: u32,
}

impl VersionRecord {
    pub fn to_item(&self, ns: &str) -> Item {
        let (pk, sk) = crate::keys::pk_system_version(ns);
        let mut attrs = BTreeMap::new();
        attrs.insert("PK".to_string(), AttributeValue::S(pk));
        attrs.insert("SK".to_string(), AttributeValue::S(sk.to_string()));
        attrs.insert(
            "schema_version".to_string(),
            AttributeValue::N(self.schema_version as i64),
        );
        attrs.insert(
            "aggregator_version".to_string(),
            AttributeValue::N(self.aggregator_version as i64),
        );
        Item { attrs }
    }

    pub fn from_item(item: &Item) -> Option<Self> {
        Some(Self {
            schema_version: item.get_n("schema_version")? as u32,
            aggregator_version: item.get_n("aggregator_version").unwrap_or(0) as u32,
        })
    }
}
