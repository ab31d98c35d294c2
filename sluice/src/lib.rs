//! # sluice
//!
//! Core admission engine for a distributed, multi-tenant token-bucket rate
//! limiter, backed by a single-table key-value store of the DynamoDB class
//! (conditional writes, atomic counters, secondary indexes, change streams).
//!
//! This crate owns three tightly coupled subsystems:
//!
//! - the **admission engine** ([`limiter`], [`lease`]): the speculative
//!   conditional-write fast path, the read-modify-write slow path, the
//!   atomic multi-item commit for cascade, compensating rollback on failure,
//!   and the lease lifecycle;
//! - the **pre-shard bucket model** ([`keys`], [`bucket_math`],
//!   [`repository`]): per-shard partitioning of every (entity, resource),
//!   the auto-injected `wcu` infrastructure limit, client-side shard
//!   doubling, and shard-count propagation;
//! - the **stream aggregator** ([`aggregator`]): consumes the backing
//!   store's change stream to proactively refill buckets, emit usage
//!   snapshots, and trigger/propagate sharding ahead of client-observed
//!   exhaustion.
//!
//! CLI surfaces, infrastructure provisioning, YAML-to-policy reconciliation,
//! S3 audit archival, terminal visualization, and load-test orchestration
//! are external collaborators of this core and are not part of this crate.

pub mod aggregator;
pub mod bucket_math;
pub mod cache;
pub mod clock;
pub mod config;
pub mod config_resolver;
pub mod deadline;
pub mod driver;
pub mod error;
pub mod keys;
pub mod lease;
pub mod limiter;
pub mod model;
pub mod namespace;
pub mod repository;
pub mod store;
pub mod validate;

pub use aggregator::Aggregator;
pub use config::RepositoryConfig;
pub use deadline::Deadline;
pub use driver::{CooperativeDriver, Driver, ThreadPoolDriver};
pub use error::{Error, Result};
pub use lease::Lease;
pub use limiter::{AcquireRequest, Limiter};
pub use namespace::NamespaceRegistry;
pub use repository::Repository;
