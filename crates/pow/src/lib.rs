//! Compact-target math, block trust, and retargeting.

pub mod difficulty;
pub mod validation;

pub use difficulty::{
    block_trust, compact_to_target, compact_to_u256, compute_max_bits, compute_min_stake,
    compute_min_work, next_target_required, target_to_compact, u256_to_compact, CompactError,
    TargetBlock,
};
pub use validation::{check_proof_of_work, PowError};
