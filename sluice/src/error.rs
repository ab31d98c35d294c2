//! The error taxonomy.
//!
//! Errors are classified at the store-adapter boundary and never reclassified
//! higher up the call stack. Adjust and rollback paths never surface store
//! errors to the caller (see [`crate::lease`]) — they log and swallow them,
//! because surfacing them risks double-compensation.

use serde::Serialize;
use std::time::Duration;

/// One status line for a single named limit, as observed at the end of an
/// admission attempt.
///
/// `wcu`, the reserved infrastructure limit, is never represented here.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LimitStatus {
    pub name: String,
    /// Tokens currently available, in whole tokens (milli-units / 1000).
    pub remaining: i64,
    pub capacity: i64,
    /// Seconds until at least one more token is available. Zero if already
    /// non-negative.
    pub retry_after_seconds: f64,
}

impl LimitStatus {
    pub fn is_violation(&self) -> bool {
        self.remaining < 0
    }
}

/// The full shape of a `RATE_LIMIT_EXCEEDED` error, as described in spec §7.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitExceeded {
    pub violations: Vec<LimitStatus>,
    pub passed: Vec<LimitStatus>,
    pub primary_violation: LimitStatus,
    pub retry_after_seconds: f64,
}

impl RateLimitExceeded {
    /// Build from a full list of statuses, splitting into violations/passed
    /// and picking the primary bottleneck (longest time-to-next-token, ties
    /// broken by the original, stable order).
    pub fn from_statuses(statuses: Vec<LimitStatus>) -> Option<Self> {
        let mut violations = Vec::new();
        let mut passed = Vec::new();
        for s in statuses {
            if s.is_violation() {
                violations.push(s);
            } else {
                passed.push(s);
            }
        }
        if violations.is_empty() {
            return None;
        }
        let primary_idx = violations
            .iter()
            .enumerate()
            .max_by(|(ai, a), (bi, b)| {
                a.retry_after_seconds
                    .partial_cmp(&b.retry_after_seconds)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(bi.cmp(ai))
            })
            .map(|(i, _)| i)
            .unwrap_or(0);
        let primary_violation = violations[primary_idx].clone();
        let retry_after_seconds = primary_violation.retry_after_seconds;
        Some(Self {
            violations,
            passed,
            primary_violation,
            retry_after_seconds,
        })
    }

    /// `Retry-After` header value: the ceiling-rounded number of seconds, per
    /// spec §7.
    pub fn retry_after_header_value(&self) -> u64 {
        self.retry_after_seconds.ceil().max(0.0) as u64
    }

    pub fn retry_after_duration(&self) -> Duration {
        Duration::from_secs(self.retry_after_header_value())
    }

    /// A plain, JSON-shaped map suitable for an HTTP response body, per the
    /// "dictionary form" named in spec §7. Kept independent of any particular
    /// web framework.
    pub fn to_json_value(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("RateLimitExceeded fields are all JSON-representable")
    }
}

/// The full error taxonomy (spec §7). Variants are kinds, not a one-to-one
/// map of every failure site.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed name, reserved name, length overflow, ambiguous/missing
    /// limits at admission, negative `consume`, etc. Fatal; never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Entity missing where required, namespace missing, infrastructure item
    /// absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// One or more user limits exhausted after all retries.
    #[error("rate limit exceeded: {0:?}")]
    RateLimitExceeded(RateLimitExceeded),

    /// Backing store error (timeout, throttle we cannot classify to a
    /// per-partition cause, network failure) observed during admission.
    #[error("backing store unavailable: {0}")]
    Unavailable(String),

    /// Optimistic-lock contention the core retry logic could not resolve.
    #[error("concurrency conflict: {0}")]
    Concurrency(String),

    /// Schema version mismatch detected on first use.
    #[error("schema version mismatch: have {have}, need {need}")]
    Version { have: u32, need: u32 },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Error::Unavailable(msg.into())
    }

    pub fn concurrency(msg: impl Into<String>) -> Self {
        Error::Concurrency(msg.into())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn primary_violation_is_longest_retry() {
        let statuses = vec![
            LimitStatus {
                name: "rpm".into(),
                remaining: -500,
                capacity: 100_000,
                retry_after_seconds: 0.3,
            },
            LimitStatus {
                name: "tpm".into(),
                remaining: -10,
                capacity: 100_000,
                retry_after_seconds: 1.2,
            },
            LimitStatus {
                name: "burst".into(),
                remaining: 10,
                capacity: 100_000,
                retry_after_seconds: 0.0,
            },
        ];
        let exceeded = RateLimitExceeded::from_statuses(statuses).unwrap();
        assert_eq!(exceeded.primary_violation.name, "tpm");
        assert_eq!(exceeded.violations.len(), 2);
        assert_eq!(exceeded.passed.len(), 1);
        assert_eq!(exceeded.retry_after_header_value(), 2);
    }

    #[test]
    fn no_violations_returns_none() {
        let statuses = vec![LimitStatus {
            name: "rpm".into(),
            remaining: 5,
            capacity: 100,
            retry_after_seconds: 0.0,
        }];
        assert!(RateLimitExceeded::from_statuses(statuses).is_none());
    }
}
