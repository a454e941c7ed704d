//! Difficulty and compact target utilities.

use std::cmp::Ordering;

use neutrond_consensus::constants::{TARGET_SPACING, TARGET_TIMESPAN};
use neutrond_consensus::Hash256;
use primitive_types::U256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    let negative = (bits & 0x0080_0000) != 0;

    if negative {
        return Err(CompactError::Negative);
    }

    let value = if size <= 3 {
        let shift = 8 * (3 - size);
        word >>= shift;
        U256::from(word)
    } else {
        let shift = 8 * (size - 3);
        U256::from(word) << shift
    };

    if word != 0 {
        let overflow = size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32);
        if overflow {
            return Err(CompactError::Overflow);
        }
    }

    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = value.bits().div_ceil(8) as u32;
    let mut compact: u32;

    if size <= 3 {
        compact = value.low_u32() << (8 * (3 - size));
    } else {
        let shift = 8 * (size - 3);
        compact = (value >> shift).low_u32();
    }

    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }

    (size << 24) | (compact & 0x007f_ffff)
}

pub fn compact_to_target(bits: u32) -> Result<Hash256, CompactError> {
    let value = compact_to_u256(bits)?;
    Ok(u256_to_hash(value))
}

pub fn target_to_compact(target: &Hash256) -> u32 {
    let value = U256::from_little_endian(target);
    u256_to_compact(value)
}

pub fn u256_to_hash(value: U256) -> Hash256 {
    let mut out = [0u8; 32];
    value.to_little_endian(&mut out);
    out
}

pub fn hash_meets_target(hash: &Hash256, target: &Hash256) -> bool {
    let hash_value = U256::from_little_endian(hash);
    let target_value = U256::from_little_endian(target);
    hash_value <= target_value
}

/// Expected work (or stake weight) for a block: `floor(2^256 / (target + 1))`.
pub fn block_trust(bits: u32) -> U256 {
    let Ok(target) = compact_to_u256(bits) else {
        return U256::zero();
    };
    if target.is_zero() {
        return U256::zero();
    }
    let one = U256::from(1u64);
    (!target / (target + one)) + one
}

pub fn cmp_be(a: &Hash256, b: &Hash256) -> Ordering {
    let left = U256::from_little_endian(a);
    let right = U256::from_little_endian(b);
    left.cmp(&right)
}

/// Minimal view of a prior block needed for retargeting: the last two
/// blocks of the requested consensus kind, newest first.
#[derive(Clone, Copy, Debug)]
pub struct TargetBlock {
    pub time: i64,
    pub bits: u32,
}

/// Exponential moving retarget toward the target spacing, recomputed
/// every block from the two most recent blocks of matching kind.
pub fn next_target_required(
    prev: Option<TargetBlock>,
    prev_prev: Option<TargetBlock>,
    limit: &Hash256,
) -> u32 {
    let limit_value = U256::from_little_endian(limit);
    let (Some(prev), Some(prev_prev)) = (prev, prev_prev) else {
        return u256_to_compact(limit_value);
    };

    let mut actual_spacing = prev.time - prev_prev.time;
    if actual_spacing < 0 {
        actual_spacing = TARGET_SPACING;
    }

    let Ok(prev_target) = compact_to_u256(prev.bits) else {
        return u256_to_compact(limit_value);
    };

    let interval = TARGET_TIMESPAN / TARGET_SPACING;
    let numerator = (interval - 1) * TARGET_SPACING + 2 * actual_spacing;
    let denominator = (interval + 1) * TARGET_SPACING;

    let new_target = prev_target.saturating_mul(U256::from(numerator as u64))
        / U256::from(denominator as u64);

    if new_target.is_zero() || new_target > limit_value {
        return u256_to_compact(limit_value);
    }
    u256_to_compact(new_target)
}

/// Easiest target reachable `elapsed` seconds after a base target,
/// allowing at most a 200% adjustment per day.
pub fn compute_max_bits(limit: &Hash256, base_bits: u32, mut elapsed: i64) -> u32 {
    let limit_value = U256::from_little_endian(limit);
    let Ok(base) = compact_to_u256(base_bits) else {
        return u256_to_compact(limit_value);
    };

    let mut result = base.saturating_mul(U256::from(2u64));
    while elapsed > 0 && result < limit_value {
        result = result.saturating_mul(U256::from(2u64));
        elapsed -= 24 * 60 * 60;
    }
    if result > limit_value {
        result = limit_value;
    }
    u256_to_compact(result)
}

pub fn compute_min_work(pow_limit: &Hash256, base_bits: u32, elapsed: i64) -> u32 {
    compute_max_bits(pow_limit, base_bits, elapsed)
}

pub fn compute_min_stake(pos_limit: &Hash256, base_bits: u32, elapsed: i64) -> u32 {
    compute_max_bits(pos_limit, base_bits, elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retarget_returns_limit_without_history() {
        let limit = [0xffu8; 32];
        let bits = next_target_required(None, None, &limit);
        assert_eq!(bits, target_to_compact(&limit));
    }

    #[test]
    fn retarget_monotone_in_spacing() {
        // Faster blocks must produce a harder (smaller) target.
        let mut limit = [0xffu8; 32];
        limit[31] = 0x00;
        let base = TargetBlock {
            time: 10_000,
            bits: 0x1d00_ffff,
        };
        let slow = next_target_required(
            Some(TargetBlock {
                time: 10_000 + 300,
                bits: base.bits,
            }),
            Some(base),
            &limit,
        );
        let fast = next_target_required(
            Some(TargetBlock {
                time: 10_000 + 10,
                bits: base.bits,
            }),
            Some(base),
            &limit,
        );
        let slow_target = compact_to_u256(slow).expect("target");
        let fast_target = compact_to_u256(fast).expect("target");
        assert!(fast_target < slow_target);
    }

    #[test]
    fn negative_spacing_clamps_to_target_spacing() {
        let mut limit = [0xffu8; 32];
        limit[31] = 0x00;
        let on_time = next_target_required(
            Some(TargetBlock {
                time: 10_000 + TARGET_SPACING,
                bits: 0x1d00_ffff,
            }),
            Some(TargetBlock {
                time: 10_000,
                bits: 0x1d00_ffff,
            }),
            &limit,
        );
        let reversed = next_target_required(
            Some(TargetBlock {
                time: 9_000,
                bits: 0x1d00_ffff,
            }),
            Some(TargetBlock {
                time: 10_000,
                bits: 0x1d00_ffff,
            }),
            &limit,
        );
        assert_eq!(on_time, reversed);
    }

    #[test]
    fn block_trust_increases_with_difficulty() {
        let easy = block_trust(0x1e0f_ffff);
        let hard = block_trust(0x1d00_ffff);
        assert!(hard > easy);
        assert!(easy > U256::zero());
    }

    #[test]
    fn max_bits_caps_at_limit() {
        let mut limit = [0u8; 32];
        limit[29] = 0x0f;
        for byte in limit.iter_mut().take(29) {
            *byte = 0xff;
        }
        let bits = compute_max_bits(&limit, target_to_compact(&limit), 10 * 86_400);
        assert_eq!(bits, target_to_compact(&limit));
    }
}
