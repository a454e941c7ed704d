//! Stake modifier computation.
//!
//! The modifier is a 64-bit value rebuilt once per modifier interval by
//! selecting 64 blocks from the recent past, weighted toward proof-of-stake
//! blocks, and folding in each selected block's entropy bit. Binding the
//! kernel hash to it prevents a staker from precomputing future kernels.

use neutrond_consensus::constants::{MODIFIER_INTERVAL, MODIFIER_INTERVAL_RATIO};
use neutrond_consensus::Hash256;
use neutrond_primitives::encoding::Encoder;
use neutrond_primitives::hash::sha256d;
use primitive_types::U256;

use crate::validation::KernelError;

const MODIFIER_BITS: usize = 64;

/// A block eligible for modifier selection, collected by walking the main
/// chain backward from the previous block.
#[derive(Clone, Debug)]
pub struct ModifierCandidate {
    pub hash: Hash256,
    pub time: i64,
    pub is_proof_of_stake: bool,
    pub hash_proof: Hash256,
    pub entropy_bit: bool,
}

/// Modifier state carried by the previous block.
#[derive(Clone, Copy, Debug)]
pub struct PrevModifier {
    pub modifier: u64,
    /// Timestamp of the block where the current modifier series started.
    pub modifier_time: i64,
    pub block_time: i64,
}

/// Seconds of history the selection rounds may reach back over.
pub fn selection_interval() -> i64 {
    let mut interval = 0i64;
    for section in 0..MODIFIER_BITS as i64 {
        interval += section_interval(section);
    }
    interval
}

fn section_interval(section: i64) -> i64 {
    MODIFIER_INTERVAL * 63 / (63 + ((63 - section) * (MODIFIER_INTERVAL_RATIO - 1)))
}

/// Computes the stake modifier for a block whose parent carries `prev`.
///
/// `candidates` must hold the main-chain blocks with timestamps inside the
/// selection window, any order. Returns `(modifier, generated)`; when the
/// interval has not yet elapsed the parent's modifier is reused and
/// `generated` is false.
pub fn compute_next_stake_modifier(
    prev: Option<&PrevModifier>,
    candidates: &[ModifierCandidate],
) -> Result<(u64, bool), KernelError> {
    let Some(prev) = prev else {
        // Genesis gets the null modifier.
        return Ok((0, true));
    };

    if prev.modifier_time / MODIFIER_INTERVAL >= prev.block_time / MODIFIER_INTERVAL {
        return Ok((prev.modifier, false));
    }

    let selection_start =
        (prev.block_time / MODIFIER_INTERVAL) * MODIFIER_INTERVAL - selection_interval();

    let mut sorted: Vec<&ModifierCandidate> = candidates
        .iter()
        .filter(|candidate| candidate.time >= selection_start)
        .collect();
    sorted.sort_by(|a, b| (a.time, a.hash).cmp(&(b.time, b.hash)));

    if sorted.is_empty() {
        return Err(KernelError::InsufficientCandidates);
    }

    let mut modifier = 0u64;
    let mut selected: Vec<bool> = vec![false; sorted.len()];
    let mut round_stop = selection_start;
    let rounds = (MODIFIER_BITS as i64).min(sorted.len() as i64);

    for round in 0..rounds {
        round_stop += section_interval(round);
        let chosen = select_block_for_round(&sorted, &selected, round_stop, prev.modifier)?;
        selected[chosen] = true;
        if sorted[chosen].entropy_bit {
            modifier |= 1u64 << round;
        }
    }

    Ok((modifier, true))
}

/// Picks the unselected candidate with the lowest selection hash among
/// those no newer than `round_stop`. The first unselected candidate is
/// always eligible so selection stays live on a young chain.
/// Proof-of-stake candidates are preferred by shifting their selection
/// hash down 32 bits.
fn select_block_for_round(
    candidates: &[&ModifierCandidate],
    selected: &[bool],
    round_stop: i64,
    prev_modifier: u64,
) -> Result<usize, KernelError> {
    let mut best: Option<(U256, usize)> = None;

    for (index, candidate) in candidates.iter().enumerate() {
        if selected[index] {
            continue;
        }
        if best.is_some() && candidate.time > round_stop {
            // Sorted ascending; nothing newer qualifies either.
            break;
        }

        let mut encoder = Encoder::new();
        encoder.write_hash_le(&candidate.hash_proof);
        encoder.write_u64_le(prev_modifier);
        let mut selection_hash = U256::from_little_endian(&sha256d(&encoder.into_inner()));
        if candidate.is_proof_of_stake {
            selection_hash >>= 32;
        }

        match best {
            Some((best_hash, _)) if selection_hash >= best_hash => {}
            _ => best = Some((selection_hash, index)),
        }
    }

    best.map(|(_, index)| index)
        .ok_or(KernelError::InsufficientCandidates)
}

/// Rolling checksum binding each block's modifier state to its ancestry.
pub fn stake_modifier_checksum(
    prev_checksum: u32,
    flags: u32,
    hash_proof: &Hash256,
    modifier: u64,
) -> u32 {
    let mut encoder = Encoder::new();
    encoder.write_u32_le(prev_checksum);
    encoder.write_u32_le(flags);
    encoder.write_hash_le(hash_proof);
    encoder.write_u64_le(modifier);
    let digest = sha256d(&encoder.into_inner());
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(tag: u8, time: i64, entropy: bool) -> ModifierCandidate {
        ModifierCandidate {
            hash: [tag; 32],
            time,
            is_proof_of_stake: tag % 2 == 0,
            hash_proof: [tag.wrapping_add(1); 32],
            entropy_bit: entropy,
        }
    }

    fn window_candidates(base: i64) -> Vec<ModifierCandidate> {
        (0..200u8)
            .map(|tag| candidate(tag, base + (tag as i64) * 60, tag % 3 == 0))
            .collect()
    }

    #[test]
    fn genesis_gets_null_modifier() {
        let (modifier, generated) = compute_next_stake_modifier(None, &[]).expect("modifier");
        assert_eq!(modifier, 0);
        assert!(generated);
    }

    #[test]
    fn modifier_is_reused_within_interval() {
        let prev = PrevModifier {
            modifier: 0xdead_beef,
            modifier_time: 10_000 * MODIFIER_INTERVAL,
            block_time: 10_000 * MODIFIER_INTERVAL + 30,
        };
        let (modifier, generated) =
            compute_next_stake_modifier(Some(&prev), &[]).expect("modifier");
        assert_eq!(modifier, 0xdead_beef);
        assert!(!generated);
    }

    #[test]
    fn new_series_is_deterministic() {
        let block_time = 20_000 * MODIFIER_INTERVAL;
        let prev = PrevModifier {
            modifier: 7,
            modifier_time: block_time - 2 * MODIFIER_INTERVAL,
            block_time,
        };
        let candidates =
            window_candidates(block_time - selection_interval() - MODIFIER_INTERVAL);
        let first =
            compute_next_stake_modifier(Some(&prev), &candidates).expect("modifier");
        let second =
            compute_next_stake_modifier(Some(&prev), &candidates).expect("modifier");
        assert!(first.1);
        assert_eq!(first, second);
    }

    #[test]
    fn empty_window_is_an_error() {
        let block_time = 20_000 * MODIFIER_INTERVAL;
        let prev = PrevModifier {
            modifier: 7,
            modifier_time: block_time - 2 * MODIFIER_INTERVAL,
            block_time,
        };
        assert!(matches!(
            compute_next_stake_modifier(Some(&prev), &[]),
            Err(KernelError::InsufficientCandidates)
        ));
    }

    #[test]
    fn checksum_chains() {
        let a = stake_modifier_checksum(0, 0, &[1u8; 32], 42);
        let b = stake_modifier_checksum(a, 0, &[2u8; 32], 42);
        assert_ne!(a, b);
        assert_eq!(a, stake_modifier_checksum(0, 0, &[1u8; 32], 42));
    }

    #[test]
    fn selection_interval_spans_multiple_modifier_intervals() {
        let interval = selection_interval();
        assert!(interval > MODIFIER_INTERVAL);
        assert!(interval < 64 * MODIFIER_INTERVAL);
    }
}
