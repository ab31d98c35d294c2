//! Key schema (spec §4.1).
//!
//! Pure functions to build every `PK`/`SK`/GSI key, plus the one inverse,
//! [`parse_bucket_pk`]. Nothing here touches the store; nothing here
//! validates names (see [`crate::validate`]) — callers are expected to
//! validate before building keys.

/// The namespace that hosts the namespace registry itself.
pub const REGISTRY_NAMESPACE: &str = "_";

/// Sentinel resource name used for an entity-level default config.
pub const DEFAULT_RESOURCE: &str = "_default_";

fn ns_prefix(ns: &str) -> String {
    format!("{ns}/")
}

pub fn pk_entity_meta(ns: &str, entity_id: &str) -> (String, &'static str) {
    (format!("{}ENTITY#{entity_id}", ns_prefix(ns)), "#META")
}

pub fn pk_entity_config(ns: &str, entity_id: &str, resource: &str) -> (String, String) {
    (
        format!("{}ENTITY#{entity_id}", ns_prefix(ns)),
        format!("#CONFIG#{resource}"),
    )
}

pub fn pk_resource_config(ns: &str, resource: &str) -> (String, &'static str) {
    (format!("{}RESOURCE#{resource}", ns_prefix(ns)), "#CONFIG")
}

pub fn pk_system_config(ns: &str) -> (String, &'static str) {
    (format!("{}SYSTEM#", ns_prefix(ns)), "#CONFIG")
}

pub fn pk_system_version(ns: &str) -> (String, &'static str) {
    (format!("{}SYSTEM#", ns_prefix(ns)), "#VERSION")
}

pub fn pk_bucket(ns: &str, entity_id: &str, resource: &str, shard: u32) -> (String, &'static str) {
    (
        format!("{}BUCKET#{entity_id}#{resource}#{shard}", ns_prefix(ns)),
        "#STATE",
    )
}

pub fn pk_usage(ns: &str, entity_id: &str, resource: &str, window_key: &str) -> (String, String) {
    (
        format!("{}ENTITY#{entity_id}", ns_prefix(ns)),
        format!("#USAGE#{resource}#{window_key}"),
    )
}

/// `PK` shared by every namespace-registry record (forward and reverse
/// alike), always addressed under [`REGISTRY_NAMESPACE`].
pub fn pk_namespace_registry(ns: &str) -> String {
    format!("{}REGISTRY#", ns_prefix(ns))
}

pub fn sk_namespace_forward(name: &str) -> String {
    format!("#NAMESPACE#{name}")
}

pub fn sk_namespace_reverse(id: &str) -> String {
    format!("#NSID#{id}")
}

/// `GSI1`: child enumeration by parent.
pub fn gsi1pk_parent(ns: &str, parent_id: &str) -> String {
    format!("{}ENTITY#{parent_id}", ns_prefix(ns))
}

/// `GSI2`: resource aggregation (buckets and usage snapshots alike).
pub fn gsi2pk_resource(ns: &str, resource: &str) -> String {
    format!("{}RESOURCE#{resource}", ns_prefix(ns))
}

/// `GSI3`: entity-bucket discovery.
pub fn gsi3pk_entity(ns: &str, entity_id: &str) -> String {
    format!("{}ENTITY#{entity_id}", ns_prefix(ns))
}

/// `GSI4`: namespace enumeration, keyed by the namespace's own opaque ID, used
/// by `purge` to find every item belonging to a namespace.
pub fn gsi4pk_namespace(ns: &str) -> String {
    ns.to_string()
}

/// Parses a bucket `PK` back into `(ns, entity, resource, shard)`.
///
/// Parsing rule (spec §4.1): after stripping the `{ns}/BUCKET#` prefix, split
/// off the final `#<integer>` as the shard, then split the remainder on the
/// *first* `#` into entity and resource. This is unique even when the
/// resource contains `/`, `.`, `-`, `_`, because `#` is forbidden in any
/// user-supplied identifier and therefore can only appear at the two
/// delimiter positions this function expects.
pub fn parse_bucket_pk(pk: &str) -> Option<(String, String, String, u32)> {
    let sep = pk.find("/BUCKET#")?;
    let ns = pk[..sep].to_string();
    let rest = &pk[sep + "/BUCKET#".len()..];

    let last_hash = rest.rfind('#')?;
    let (entity_resource, shard_str) = (&rest[..last_hash], &rest[last_hash + 1..]);
    let shard: u32 = shard_str.parse().ok()?;

    let first_hash = entity_resource.find('#')?;
    let entity = entity_resource[..first_hash].to_string();
    let resource = entity_resource[first_hash + 1..].to_string();

    if entity.is_empty() || resource.is_empty() {
        return None;
    }

    Some((ns, entity, resource, shard))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip_simple() {
        let (pk, sk) = pk_bucket("abcdefghijk", "user-1", "rpm-resource", 3);
        assert_eq!(sk, "#STATE");
        let parsed = parse_bucket_pk(&pk).unwrap();
        assert_eq!(parsed, ("abcdefghijk".to_string(), "user-1".to_string(), "rpm-resource".to_string(), 3));
    }

    #[test]
    fn round_trip_resource_with_slash_dot_dash_underscore() {
        for resource in ["openai/gpt-4o", "a.b_c-d", "provider/model.v2", "x_y/z-1.2"] {
            let (pk, _) = pk_bucket("ns0000000ab", "ent_1", resource, 0);
            let parsed = parse_bucket_pk(&pk).unwrap();
            assert_eq!(parsed.0, "ns0000000ab");
            assert_eq!(parsed.1, "ent_1");
            assert_eq!(parsed.2, resource);
            assert_eq!(parsed.3, 0);
        }
    }

    #[test]
    fn round_trip_high_shard() {
        let (pk, _) = pk_bucket("ns0000000ab", "e", "r", 4294967295);
        assert_eq!(parse_bucket_pk(&pk).unwrap().3, 4294967295);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_bucket_pk("not-a-bucket-key").is_none());
        assert!(parse_bucket_pk("ns/BUCKET#onlyentity").is_none());
        assert!(parse_bucket_pk("ns/BUCKET#entity#resource#notanumber").is_none());
    }
}
