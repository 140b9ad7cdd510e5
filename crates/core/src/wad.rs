//! Helpers for 18-decimal fixed-point values.
//!
//! Borrow values arrive from the chain as 1e18-scaled USD integers. Bucket
//! selection and report formatting want approximate dollars; the loss of
//! precision in the f64 conversion is irrelevant at those magnitudes.

use alloy::primitives::U256;

/// One whole unit in 18-decimal fixed point.
pub const WAD: u128 = 1_000_000_000_000_000_000;

/// Convert a U256 to f64, saturating at `f64::MAX` for values beyond u128.
pub fn u256_to_f64(value: U256) -> f64 {
    if value > U256::from(u128::MAX) {
        return f64::MAX;
    }
    value.to::<u128>() as f64
}

/// Convert an 18-decimal fixed-point value to f64 (USD values to dollars,
/// 1e18-scaled health factors to plain scores).
pub fn from_wad(value: U256) -> f64 {
    u256_to_f64(value) / WAD as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_wad_converts_whole_dollars() {
        let thousand = U256::from(1000u64) * U256::from(WAD);
        assert!((from_wad(thousand) - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn from_wad_handles_fractions() {
        let half = U256::from(WAD / 2);
        assert!((from_wad(half) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn oversized_values_saturate() {
        assert_eq!(u256_to_f64(U256::MAX), f64::MAX);
    }
}
