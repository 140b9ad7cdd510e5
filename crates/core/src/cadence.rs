//! Adaptive re-check cadence.
//!
//! Every vault is re-checked on an interval that shortens as risk rises.
//! Total borrowed value selects a size bucket; each bucket carries three
//! intervals (liquidation, high-risk, safe) and the health scores pick a
//! point between them by linear interpolation. The computed interval is
//! capped at the configured maximum and jittered by ±10% to decorrelate
//! the workload.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Per-bucket check intervals in seconds, fastest to slowest.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BucketIntervals {
    pub liq: f64,
    pub high: f64,
    pub safe: f64,
}

/// Size bucket selected by total borrowed USD value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeBucket {
    Teeny,
    Mini,
    Small,
    Medium,
    Large,
}

/// Bucket thresholds (upper bounds, USD) and the interval table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizeBucketTable {
    pub teeny_max_usd: f64,
    pub mini_max_usd: f64,
    pub small_max_usd: f64,
    pub medium_max_usd: f64,
    pub teeny: BucketIntervals,
    pub mini: BucketIntervals,
    pub small: BucketIntervals,
    pub medium: BucketIntervals,
    pub large: BucketIntervals,
}

impl SizeBucketTable {
    pub fn bucket_for(&self, total_borrowed_usd: f64) -> SizeBucket {
        if total_borrowed_usd < self.teeny_max_usd {
            SizeBucket::Teeny
        } else if total_borrowed_usd < self.mini_max_usd {
            SizeBucket::Mini
        } else if total_borrowed_usd < self.small_max_usd {
            SizeBucket::Small
        } else if total_borrowed_usd < self.medium_max_usd {
            SizeBucket::Medium
        } else {
            SizeBucket::Large
        }
    }

    pub fn intervals(&self, bucket: SizeBucket) -> &BucketIntervals {
        match bucket {
            SizeBucket::Teeny => &self.teeny,
            SizeBucket::Mini => &self.mini,
            SizeBucket::Small => &self.small,
            SizeBucket::Medium => &self.medium,
            SizeBucket::Large => &self.large,
        }
    }
}

/// Health-score thresholds separating the cadence regimes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HealthThresholds {
    pub liquidation: f64,
    pub high_risk: f64,
    pub safe: f64,
}

/// Full cadence configuration for one chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CadenceConfig {
    pub buckets: SizeBucketTable,
    pub thresholds: HealthThresholds,
    pub max_update_interval_seconds: f64,
}

/// Compute the pre-jitter check interval in seconds.
///
/// An empty vault (both scores infinite) is checked at the maximum
/// interval. When the two scores fall into an interpolated regime, the
/// minimum of the two per-score results wins, so the riskier side always
/// drives the cadence.
pub fn check_interval_seconds(
    cadence: &CadenceConfig,
    internal_hs: f64,
    external_hs: f64,
    total_borrowed_usd: f64,
    externally_liquidated: bool,
) -> f64 {
    let max_interval = cadence.max_update_interval_seconds;

    if internal_hs.is_infinite() && external_hs.is_infinite() {
        return max_interval;
    }

    let t = &cadence.thresholds;
    let iv = cadence.buckets.intervals(cadence.buckets.bucket_for(total_borrowed_usd));

    let gap = if internal_hs <= t.liquidation || external_hs <= t.liquidation || externally_liquidated
    {
        iv.liq
    } else if internal_hs < t.high_risk || external_hs < t.high_risk {
        let span = t.high_risk - t.liquidation;
        let ratio_internal = (internal_hs - t.liquidation) / span;
        let ratio_external = (external_hs - t.liquidation) / span;
        let gap_internal = iv.liq + (iv.high - iv.liq) * ratio_internal;
        let gap_external = iv.liq + (iv.high - iv.liq) * ratio_external;
        gap_internal.min(gap_external)
    } else if internal_hs < t.safe || external_hs < t.safe {
        let span = t.safe - t.high_risk;
        let ratio_internal = (internal_hs - t.high_risk) / span;
        let ratio_external = (external_hs - t.high_risk) / span;
        let gap_internal = iv.high + (iv.safe - iv.high) * ratio_internal;
        let gap_external = iv.high + (iv.safe - iv.high) * ratio_external;
        gap_internal.min(gap_external)
    } else {
        iv.safe
    };

    gap.min(max_interval)
}

/// Apply the ±10% scheduling jitter.
pub fn jittered(seconds: f64, rng: &mut impl Rng) -> f64 {
    seconds * rng.gen_range(0.9..=1.1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChainConfig;

    fn cadence() -> CadenceConfig {
        ChainConfig::testing().cadence
    }

    #[test]
    fn empty_vault_uses_max_interval() {
        let c = cadence();
        let gap = check_interval_seconds(&c, f64::INFINITY, f64::INFINITY, 0.0, false);
        assert_eq!(gap, c.max_update_interval_seconds);
    }

    #[test]
    fn interval_never_exceeds_max() {
        let c = cadence();
        for hs in [0.5, 1.0, 1.1, 1.3, 2.0, 10.0] {
            for borrowed in [1.0, 200.0, 1000.0, 20_000.0, 1_000_000.0] {
                let gap = check_interval_seconds(&c, hs, hs, borrowed, false);
                assert!(gap <= c.max_update_interval_seconds, "hs={hs} borrowed={borrowed}");
                assert!(gap > 0.0);
            }
        }
    }

    #[test]
    fn liquidatable_small_position_uses_small_liq_interval() {
        // $1000 borrowed lands in the SMALL bucket; hs below the
        // liquidation threshold pins the cadence at the LIQ interval.
        let c = cadence();
        let gap = check_interval_seconds(&c, 0.99, 1.5, 1000.0, false);
        assert_eq!(gap, c.buckets.small.liq);
    }

    #[test]
    fn externally_liquidated_uses_liq_interval_regardless_of_scores() {
        let c = cadence();
        let gap = check_interval_seconds(&c, 5.0, 5.0, 1000.0, true);
        assert_eq!(gap, c.buckets.small.liq);
    }

    #[test]
    fn high_risk_scheduled_sooner_than_safe() {
        let c = cadence();
        let risky = check_interval_seconds(&c, 1.02, 1.02, 1000.0, false);
        let safe = check_interval_seconds(&c, 2.0, 2.0, 1000.0, false);
        assert!(risky < safe, "risky={risky} safe={safe}");
    }

    #[test]
    fn interval_is_monotone_in_health() {
        // If vault A has both scores >= vault B's, A's interval >= B's.
        let c = cadence();
        let scores = [1.0, 1.02, 1.05, 1.1, 1.2, 1.4, 2.0];
        for (i, &a) in scores.iter().enumerate() {
            for &b in &scores[..=i] {
                let gap_a = check_interval_seconds(&c, a, a, 1000.0, false);
                let gap_b = check_interval_seconds(&c, b, b, 1000.0, false);
                assert!(gap_a >= gap_b, "a={a} b={b} gap_a={gap_a} gap_b={gap_b}");
            }
        }
    }

    #[test]
    fn riskier_of_two_scores_drives_cadence() {
        let c = cadence();
        let mixed = check_interval_seconds(&c, 1.02, 2.0, 1000.0, false);
        let both_risky = check_interval_seconds(&c, 1.02, 1.02, 1000.0, false);
        assert_eq!(mixed, both_risky);
    }

    #[test]
    fn larger_positions_check_faster() {
        let c = cadence();
        let small = check_interval_seconds(&c, 1.3, 1.3, 1000.0, false);
        let large = check_interval_seconds(&c, 1.3, 1.3, 1_000_000.0, false);
        assert!(large < small);
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let j = jittered(100.0, &mut rng);
            assert!((90.0..=110.0).contains(&j));
        }
    }
}
