//! Threshold arithmetic for the tenured pool.
//!
//! All maths is done in `u128` so percentages of very large pools cannot
//! overflow, and results saturate at zero.

use serde::{Deserialize, Serialize};

fn percent_of(bytes: u64, percent: u8) -> u64 {
    ((bytes as u128) * (percent as u128) / 100) as u64
}

/// Usage threshold handed to the host for the tenured pool.
///
/// `pool * tenured_min_percent / 100 - pool * reserve_percent / 100`
pub fn calculated_tenured_threshold(pool_max: u64, tenured_min_percent: u8, reserve_percent: u8) -> u64 {
    percent_of(pool_max, tenured_min_percent).saturating_sub(percent_of(pool_max, reserve_percent))
}

/// Usage above which the pool is considered outside the safe zone; never
/// below the tenured threshold.
pub fn safety_threshold(pool_max: u64, safe_zone_lower: u8, tenured_threshold: u64) -> u64 {
    pool_max
        .saturating_sub(percent_of(pool_max, safe_zone_lower))
        .max(tenured_threshold)
}

/// Usage the incremental path tries to get back down to.
pub fn incremental_target_usage(pool_max: u64, safe_zone_upper: u8) -> u64 {
    pool_max.saturating_sub(percent_of(pool_max, safe_zone_upper))
}

/// Bytes the panic path must reclaim to reach `min_free_percent` free.
pub fn panic_required_bytes(max_memory: u64, free_bytes: u64, min_free_percent: u8) -> u64 {
    percent_of(max_memory, min_free_percent).saturating_sub(free_bytes)
}

/// Fraction of a tier to clear so that `still_needed` bytes come back.
pub fn tier_clear_fraction(still_needed: u64, tier_estimated_size: u64) -> f64 {
    if tier_estimated_size == 0 {
        return 1.0;
    }
    (still_needed as f64 / tier_estimated_size as f64).min(1.0)
}

/// Thresholds derived from the latest host sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    pub pool_max: u64,
    pub reserve_percent: u8,
    pub tenured_threshold: u64,
    pub safety_threshold: u64,
    pub incremental_target: u64,
}

impl Thresholds {
    pub fn compute(
        pool_max: u64,
        tenured_min_percent: u8,
        reserve_percent: u8,
        safe_zone_lower: u8,
        safe_zone_upper: u8,
    ) -> Self {
        let tenured_threshold =
            calculated_tenured_threshold(pool_max, tenured_min_percent, reserve_percent);
        Self {
            pool_max,
            reserve_percent,
            tenured_threshold,
            safety_threshold: safety_threshold(pool_max, safe_zone_lower, tenured_threshold),
            incremental_target: incremental_target_usage(pool_max, safe_zone_upper),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenured_threshold_strictly_decreases_with_reserve() {
        let pool = 1_000_000;
        let mut previous = calculated_tenured_threshold(pool, 80, 0);
        for reserve in 1..=50 {
            let next = calculated_tenured_threshold(pool, 80, reserve);
            assert!(next < previous, "reserve {reserve}: {next} >= {previous}");
            previous = next;
        }
    }

    #[test]
    fn tenured_threshold_saturates() {
        assert_eq!(calculated_tenured_threshold(1_000, 10, 50), 0);
        assert_eq!(calculated_tenured_threshold(1_000, 80, 10), 700);
    }

    #[test]
    fn safety_threshold_is_clamped_to_tenured() {
        assert_eq!(safety_threshold(1_000, 20, 700), 800);
        assert_eq!(safety_threshold(1_000, 50, 700), 700);
    }

    #[test]
    fn panic_requirement() {
        assert_eq!(panic_required_bytes(2_000, 100, 20), 300);
        assert_eq!(panic_required_bytes(2_000, 900, 20), 0);
    }

    #[test]
    fn clear_fraction_is_capped() {
        assert_eq!(tier_clear_fraction(50, 200), 0.25);
        assert_eq!(tier_clear_fraction(500, 200), 1.0);
        assert_eq!(tier_clear_fraction(10, 0), 1.0);
    }

    #[test]
    fn huge_pools_do_not_overflow() {
        let t = Thresholds::compute(u64::MAX, 95, 10, 20, 40);
        assert!(t.tenured_threshold <= t.safety_threshold);
        assert!(t.incremental_target < t.pool_max);
    }
}
