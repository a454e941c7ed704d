use neutrond_consensus::Hash256;
use primitive_types::U256;

use crate::difficulty::{compact_to_u256, CompactError};

#[derive(Debug)]
pub enum PowError {
    InvalidBits(&'static str),
    HashMismatch,
    Compact(CompactError),
}

impl std::fmt::Display for PowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowError::InvalidBits(message) => write!(f, "{message}"),
            PowError::HashMismatch => write!(f, "pow hash does not meet target"),
            PowError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for PowError {}

impl From<CompactError> for PowError {
    fn from(err: CompactError) -> Self {
        PowError::Compact(err)
    }
}

pub fn check_proof_of_work(
    hash: &Hash256,
    bits: u32,
    pow_limit: &Hash256,
) -> Result<(), PowError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Err(PowError::InvalidBits("pow target is zero"));
    }

    let limit = U256::from_little_endian(pow_limit);
    if target > limit {
        return Err(PowError::InvalidBits("pow target above limit"));
    }

    let hash_value = U256::from_little_endian(hash);
    if hash_value > target {
        return Err(PowError::HashMismatch);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::difficulty::target_to_compact;

    #[test]
    fn accepts_hash_at_target() {
        let mut limit = [0u8; 32];
        limit[31] = 0x0f;
        for byte in limit.iter_mut().take(31) {
            *byte = 0xff;
        }
        let bits = target_to_compact(&limit);
        let hash = [0u8; 32];
        assert!(check_proof_of_work(&hash, bits, &limit).is_ok());
    }

    #[test]
    fn rejects_hash_above_target() {
        let mut target = [0u8; 32];
        target[20] = 0x01;
        let mut limit = [0u8; 32];
        limit[30] = 0xff;
        let bits = target_to_compact(&target);
        let hash = [0xffu8; 32];
        assert!(matches!(
            check_proof_of_work(&hash, bits, &limit),
            Err(PowError::HashMismatch)
        ));
    }

    #[test]
    fn rejects_target_above_limit() {
        let mut target = [0u8; 32];
        target[30] = 0xff;
        let mut limit = [0u8; 32];
        limit[29] = 0x01;
        let bits = target_to_compact(&target);
        assert!(matches!(
            check_proof_of_work(&[0u8; 32], bits, &limit),
            Err(PowError::InvalidBits(_))
        ));
    }
}
