//! Bucket math (spec §4.2).
//!
//! All arithmetic is integer, over milli-units (tokens × 1000), to avoid
//! floating-point drift in a value that many concurrent writers increment
//! and decrement via atomic `ADD`.

/// One limit's static configuration, already in milli-units / milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitConfig {
    pub capacity_milli: i64,
    pub burst_milli: i64,
    pub refill_amount_milli: i64,
    pub refill_period_ms: i64,
}

/// The refill-lazy result of applying elapsed time to a bucket's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefillResult {
    /// Tokens available after refill, clamped to `burst_milli`.
    pub effective_tk_milli: i64,
    /// The `rf` a refilling writer should persist. Carries the remainder of
    /// the integer division forward so a `rf` that refills every 3ms at
    /// rate 1/2ms doesn't lose half a millisecond's worth of capacity on
    /// every refill.
    pub advanced_rf_ms: i64,
}

/// Applies lazy refill to `(tk, rf)` given `limit` and the current time.
///
/// `elapsed = max(0, now_ms - rf)`; `refill_milli = elapsed * ra / rp_ms`
/// (integer division). The remainder is carried forward into `advanced_rf_ms`
/// rather than discarded, so a writer that *does* refill (and therefore does
/// advance `rf`) never loses fractional progress across repeated small
/// refills.
pub fn apply_refill(tk_milli: i64, rf_ms: i64, now_ms: i64, limit: &LimitConfig) -> RefillResult {
    let elapsed = (now_ms - rf_ms).max(0);
    if limit.refill_amount_milli <= 0 || limit.refill_period_ms <= 0 {
        return RefillResult {
            effective_tk_milli: tk_milli.min(limit.burst_milli),
            advanced_rf_ms: rf_ms,
        };
    }

    let refill_milli = (elapsed as i128 * limit.refill_amount_milli as i128
        / limit.refill_period_ms as i128) as i64;

    let advanced_rf_ms = if refill_milli > 0 {
        // advance rf by exactly the time needed to produce refill_milli
        // tokens, carrying any fractional remainder forward.
        let consumed_time_ms = (refill_milli as i128 * limit.refill_period_ms as i128
            / limit.refill_amount_milli as i128) as i64;
        rf_ms + consumed_time_ms
    } else {
        rf_ms
    };

    let effective_tk_milli = (tk_milli + refill_milli).min(limit.burst_milli);

    RefillResult {
        effective_tk_milli,
        advanced_rf_ms,
    }
}

/// Effective (sharded) capacity of an application limit: `cp / shard_count`.
/// `wcu` is never divided — callers must not route it through this function.
pub fn effective_capacity_milli(capacity_milli: i64, shard_count: u32) -> i64 {
    let shard_count = shard_count.max(1) as i64;
    capacity_milli / shard_count
}

/// Effective refill rate of an application limit under sharding:
/// `ra / shard_count`, floor-divided like capacity.
pub fn effective_refill_amount_milli(refill_amount_milli: i64, shard_count: u32) -> i64 {
    let shard_count = shard_count.max(1) as i64;
    refill_amount_milli / shard_count
}

/// Time-to-fill, in seconds: `cp / ra * rp_seconds`.
pub fn time_to_fill_seconds(limit: &LimitConfig) -> f64 {
    if limit.refill_amount_milli <= 0 {
        return f64::INFINITY;
    }
    let rp_seconds = limit.refill_period_ms as f64 / 1000.0;
    (limit.capacity_milli as f64 / limit.refill_amount_milli as f64) * rp_seconds
}

/// TTL (absolute `now + max_time_to_fill * multiplier`) for a default-backed
/// bucket. A multiplier of `0` disables TTL (returns `None`).
pub fn bucket_ttl_ms(now_ms: i64, max_time_to_fill_seconds: f64, multiplier: u32) -> Option<i64> {
    if multiplier == 0 {
        return None;
    }
    let ttl_ms = (max_time_to_fill_seconds * multiplier as f64 * 1000.0).round() as i64;
    Some(now_ms + ttl_ms)
}

/// Seconds until `deficit_milli` (a negative or insufficient token balance,
/// expressed as a positive magnitude) is covered by the limit's refill rate.
/// Used to compute `retry_after_seconds`.
pub fn retry_after_seconds(deficit_milli: i64, limit: &LimitConfig) -> f64 {
    if deficit_milli <= 0 {
        return 0.0;
    }
    if limit.refill_amount_milli <= 0 {
        return f64::INFINITY;
    }
    let rp_seconds = limit.refill_period_ms as f64 / 1000.0;
    let refill_rate_per_second = limit.refill_amount_milli as f64 / rp_seconds;
    (deficit_milli as f64 / refill_rate_per_second).max(0.0)
}

#[cfg(test)]
mod test {
    use super::*;

    fn rpm_100() -> LimitConfig {
        LimitConfig {
            capacity_milli: 100_000,
            burst_milli: 100_000,
            refill_amount_milli: 100_000,
            refill_period_ms: 60_000,
        }
    }

    #[test]
    fn refill_accumulates_over_elapsed_time() {
        let limit = rpm_100();
        // half a minute elapsed: half the bucket should refill.
        let result = apply_refill(0, 0, 30_000, &limit);
        assert_eq!(result.effective_tk_milli, 50_000);
    }

    #[test]
    fn refill_clamps_to_burst() {
        let limit = LimitConfig {
            capacity_milli: 100_000,
            burst_milli: 120_000,
            refill_amount_milli: 100_000,
            refill_period_ms: 60_000,
        };
        let result = apply_refill(119_000, 0, 120_000, &limit);
        assert_eq!(result.effective_tk_milli, 120_000);
    }

    #[test]
    fn no_refill_when_rf_equals_now() {
        let limit = rpm_100();
        let result = apply_refill(50_000, 1_000, 1_000, &limit);
        assert_eq!(result.effective_tk_milli, 50_000);
        assert_eq!(result.advanced_rf_ms, 1_000);
    }

    #[test]
    fn negative_elapsed_is_clamped_to_zero() {
        let limit = rpm_100();
        let result = apply_refill(50_000, 5_000, 1_000, &limit);
        assert_eq!(result.effective_tk_milli, 50_000);
    }

    #[test]
    fn effective_capacity_divides_by_shard_count() {
        assert_eq!(effective_capacity_milli(100_000, 4), 25_000);
        assert_eq!(effective_capacity_milli(100_000, 1), 100_000);
        assert_eq!(effective_capacity_milli(100_000, 0), 100_000);
    }

    #[test]
    fn time_to_fill_matches_formula() {
        let limit = rpm_100();
        assert_eq!(time_to_fill_seconds(&limit), 60.0);
    }

    #[test]
    fn ttl_disabled_when_multiplier_zero() {
        let limit = rpm_100();
        assert_eq!(bucket_ttl_ms(0, time_to_fill_seconds(&limit), 0), None);
    }

    #[test]
    fn ttl_uses_default_multiplier_of_seven() {
        let limit = rpm_100();
        let ttl = bucket_ttl_ms(1_000, time_to_fill_seconds(&limit), 7).unwrap();
        assert_eq!(ttl, 1_000 + 60_000 * 7);
    }

    #[test]
    fn retry_after_scenario_2() {
        // capacity=100, refill_amount=100, period=60s; exhausted by 1 token.
        let limit = rpm_100();
        let seconds = retry_after_seconds(1_000, &limit);
        assert!((seconds - 0.6).abs() < 1e-9);
    }
}
