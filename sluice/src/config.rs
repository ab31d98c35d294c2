//! Config surfaces accepted at the core boundary (spec §6).
//!
//! A plain struct with a hand-written `Default`, `serde`-derivable so a
//! host application can embed it in its own configuration file, with no
//! CLI or env-var layering inside this crate — that belongs to the
//! external collaborator named in spec §1.

use serde::{Deserialize, Serialize};

use crate::driver::ConcurrencyStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OnUnavailable {
    /// Surface `UNAVAILABLE` to the caller.
    Block,
    /// Admit without consumption.
    Allow,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RepositoryConfig {
    /// `0` disables the config cache.
    pub config_cache_ttl_seconds: u64,
    /// `0` disables TTL on default-backed buckets.
    pub bucket_ttl_refill_multiplier: u32,
    pub on_unavailable: OnUnavailable,
    pub speculative_writes: bool,
    /// Not read by this crate: [`crate::limiter::Limiter`] is generic over
    /// its [`crate::driver::Driver`] and the concrete driver is fixed at
    /// construction, not switched at call time. This field exists so a host
    /// application can serialize its driver choice alongside the rest of its
    /// repository config and pick the matching `Driver` impl when building
    /// the `Limiter`.
    pub cascade_concurrency_strategy: ConcurrencyStrategy,
    /// Maximum number of *additional* shard retries on `APP_LIMIT_EXHAUSTED`
    /// (spec §4.5 step 5: "up to `MAX_SHARD_RETRIES = 2` additional
    /// attempts").
    pub max_shard_retries: u32,
    /// Threshold (fraction of `wcu` capacity consumed in one aggregator
    /// batch) above which the aggregator proactively doubles shard 0 (spec
    /// §4.7 step 3).
    pub wcu_proactive_threshold: f64,
    /// Shard count above which the aggregator logs a warning while
    /// continuing to double (spec §4.7 step 3).
    pub shard_warning_threshold: u32,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            config_cache_ttl_seconds: 60,
            bucket_ttl_refill_multiplier: 7,
            on_unavailable: OnUnavailable::Block,
            speculative_writes: true,
            cascade_concurrency_strategy: ConcurrencyStrategy::Auto,
            max_shard_retries: 2,
            wcu_proactive_threshold: 0.8,
            shard_warning_threshold: 32,
        }
    }
}

impl RepositoryConfig {
    pub fn config_cache_ttl_ms(&self) -> Option<i64> {
        if self.config_cache_ttl_seconds == 0 {
            None
        } else {
            Some(self.config_cache_ttl_seconds as i64 * 1000)
        }
    }

    pub fn with_on_unavailable(mut self, policy: OnUnavailable) -> Self {
        self.on_unavailable = policy;
        self
    }

    pub fn with_speculative_writes(mut self, enabled: bool) -> Self {
        self.speculative_writes = enabled;
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_matches_spec_defaults() {
        let cfg = RepositoryConfig::default();
        assert_eq!(cfg.config_cache_ttl_seconds, 60);
        assert_eq!(cfg.bucket_ttl_refill_multiplier, 7);
        assert_eq!(cfg.on_unavailable, OnUnavailable::Block);
        assert!(cfg.speculative_writes);
        assert_eq!(cfg.max_shard_retries, 2);
    }

    #[test]
    fn zero_ttl_means_disabled() {
        let mut cfg = RepositoryConfig::default();
        cfg.config_cache_ttl_seconds = 0;
        assert_eq!(cfg.config_cache_ttl_ms(), None);
    }
}
