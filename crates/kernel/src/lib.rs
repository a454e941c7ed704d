//! Proof-of-stake kernel: stake modifier advancement and kernel-hash checks.
//!
//! The chain-state feeds this crate plain data collected from the block
//! tree; nothing here touches disk or the index directly.

pub mod modifier;
pub mod validation;

pub use modifier::{
    compute_next_stake_modifier, selection_interval, stake_modifier_checksum, ModifierCandidate,
    PrevModifier,
};
pub use validation::{
    check_coinstake_timestamp, check_stake_kernel_hash, KernelError, StakeKernelInput,
};

/// Compact target decoding, rejecting the sign bit and zero targets.
pub(crate) fn compact_to_u256_checked(bits: u32) -> Option<primitive_types::U256> {
    let size = bits >> 24;
    let word = bits & 0x007f_ffff;
    if (bits & 0x0080_0000) != 0 {
        return None;
    }
    let value = if size <= 3 {
        primitive_types::U256::from(word >> (8 * (3 - size)))
    } else {
        if size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32) {
            return None;
        }
        primitive_types::U256::from(word) << (8 * (size - 3))
    };
    if value.is_zero() {
        return None;
    }
    Some(value)
}
